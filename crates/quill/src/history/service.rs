//! History assembly and persistence with an explicit degrade policy.

use tracing::warn;

use crate::auth::Caller;

use super::models::{ConversationSummary, NewTurn, Turn};
use super::repository::HistoryRepository;

/// Maximum prior turns attached to a completion request.
const ASSEMBLE_LIMIT: i64 = 20;
/// Maximum conversations returned by a listing.
const LIST_LIMIT: i64 = 100;

/// History facade used by the turn pipeline.
///
/// Pipeline reads and writes degrade instead of failing: history is an
/// enrichment of a chat turn, not a dependency. The listing methods used
/// by the API surface errors normally.
pub struct HistoryService {
    repo: HistoryRepository,
}

impl HistoryService {
    pub fn new(repo: HistoryRepository) -> Self {
        Self { repo }
    }

    /// Prior turns for a continuation, oldest first.
    ///
    /// Empty for anonymous callers, absent conversation ids, and store
    /// failures (logged as a warning).
    pub async fn assemble(&self, caller: &Caller, conversation_id: Option<&str>) -> Vec<Turn> {
        let (Some(user_id), Some(conversation_id)) = (caller.id(), conversation_id) else {
            return Vec::new();
        };

        match self.repo.turns(user_id, conversation_id, ASSEMBLE_LIMIT).await {
            Ok(turns) => turns,
            Err(err) => {
                warn!("failed to load history for {conversation_id}: {err:#}");
                Vec::new()
            }
        }
    }

    /// Append a turn; returns the conversation id it landed in.
    ///
    /// `None` when nothing was persisted: the caller is anonymous or the
    /// store rejected the write (logged, never raised).
    pub async fn append(&self, caller: &Caller, turn: NewTurn) -> Option<String> {
        let user_id = caller.id()?;

        match self.repo.append_turn(user_id, &turn).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!("failed to persist {} turn: {err:#}", turn.role);
                None
            }
        }
    }

    /// List a caller's conversations, most recently updated first.
    pub async fn conversations(&self, user_id: &str) -> anyhow::Result<Vec<ConversationSummary>> {
        self.repo.conversations(user_id, LIST_LIMIT).await
    }

    /// List the turns of one conversation, oldest first.
    pub async fn turns(&self, user_id: &str, conversation_id: &str) -> anyhow::Result<Vec<Turn>> {
        self.repo.turns(user_id, conversation_id, ASSEMBLE_LIMIT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::history::TurnRole;

    async fn setup() -> HistoryService {
        let db = Database::in_memory().await.unwrap();
        HistoryService::new(HistoryRepository::new(db.pool().clone()))
    }

    fn turn(content: &str) -> NewTurn {
        NewTurn {
            conversation_id: None,
            role: TurnRole::User,
            content: content.to_string(),
            image_url: None,
        }
    }

    #[tokio::test]
    async fn test_anonymous_append_is_noop() {
        let service = setup().await;
        assert_eq!(service.append(&Caller::Anonymous, turn("hello")).await, None);
    }

    #[tokio::test]
    async fn test_anonymous_assemble_is_empty() {
        let service = setup().await;
        let turns = service
            .assemble(&Caller::Anonymous, Some("chat_123"))
            .await;
        assert!(turns.is_empty());
    }

    #[tokio::test]
    async fn test_assemble_without_id_is_empty() {
        let service = setup().await;
        let caller = Caller::User {
            id: "u1".to_string(),
        };
        assert!(service.assemble(&caller, None).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_conversation_degrades_to_empty() {
        let service = setup().await;
        let caller = Caller::User {
            id: "u1".to_string(),
        };
        assert!(service.assemble(&caller, Some("chat_missing")).await.is_empty());
    }

    #[tokio::test]
    async fn test_append_then_assemble() {
        let service = setup().await;
        let caller = Caller::User {
            id: "u1".to_string(),
        };

        let id = service.append(&caller, turn("hello")).await.unwrap();
        let turns = service.assemble(&caller, Some(&id)).await;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "hello");
    }
}
