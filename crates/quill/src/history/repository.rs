//! Repository for conversation and turn rows.

use anyhow::{Context, Result};
use chrono::Utc;
use nanoid::nanoid;
use sqlx::SqlitePool;

use super::models::{ConversationSummary, NewTurn, Turn};

/// Longest last-message preview stored on a conversation summary.
const PREVIEW_LEN: usize = 50;

/// Repository for history operations.
pub struct HistoryRepository {
    pool: SqlitePool,
}

impl HistoryRepository {
    /// Create a new repository instance.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Allocate a new conversation identifier.
    ///
    /// Time-derived with a short random suffix so two appends in the same
    /// millisecond cannot collide.
    pub fn allocate_conversation_id() -> String {
        format!("chat_{}_{}", Utc::now().timestamp_millis(), nanoid!(6))
    }

    /// Append one turn and refresh the owning conversation summary.
    ///
    /// The turn insert and summary upsert are separate statements; a crash
    /// between them leaves a stale summary that the next successful append
    /// repairs.
    pub async fn append_turn(&self, user_id: &str, turn: &NewTurn) -> Result<String> {
        let conversation_id = turn
            .conversation_id
            .clone()
            .unwrap_or_else(Self::allocate_conversation_id);
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO turns (conversation_id, user_id, role, content, image_url, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conversation_id)
        .bind(user_id)
        .bind(turn.role.to_string())
        .bind(&turn.content)
        .bind(&turn.image_url)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("inserting turn")?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, title, last_message, created_at, updated_at)
            VALUES (?, ?, NULL, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                last_message = excluded.last_message,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&conversation_id)
        .bind(user_id)
        .bind(preview(&turn.content))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("updating conversation summary")?;

        Ok(conversation_id)
    }

    /// Turns of one conversation, oldest first.
    pub async fn turns(
        &self,
        user_id: &str,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<Turn>> {
        sqlx::query_as::<_, Turn>(
            r#"
            SELECT id, conversation_id, user_id, role, content, image_url, created_at
            FROM turns
            WHERE user_id = ? AND conversation_id = ?
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("fetching turns")
    }

    /// A caller's conversations, most recently updated first.
    pub async fn conversations(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<ConversationSummary>> {
        sqlx::query_as::<_, ConversationSummary>(
            r#"
            SELECT id, user_id, title, last_message, created_at, updated_at
            FROM conversations
            WHERE user_id = ?
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing conversations")
    }
}

/// Truncate content into a summary preview.
fn preview(content: &str) -> String {
    if content.chars().count() > PREVIEW_LEN {
        let head: String = content.chars().take(PREVIEW_LEN).collect();
        format!("{head}...")
    } else {
        content.to_string()
    }
}
