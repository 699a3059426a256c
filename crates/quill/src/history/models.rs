//! Chat history data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Role of a stored turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for TurnRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("Unknown turn role: {}", s)),
        }
    }
}

/// A persisted turn of a conversation. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Turn {
    /// Auto-incrementing ID
    pub id: i64,
    /// Owning conversation
    pub conversation_id: String,
    /// Owning caller
    pub user_id: String,
    /// "user" or "assistant"
    pub role: String,
    /// Message text
    pub content: String,
    /// Stored image URL, set only when the upload succeeded
    pub image_url: Option<String>,
    /// Store-assigned RFC 3339 timestamp
    pub created_at: String,
}

/// Input for appending a turn.
#[derive(Debug, Clone)]
pub struct NewTurn {
    /// Conversation to append to; `None` allocates a fresh one.
    pub conversation_id: Option<String>,
    pub role: TurnRole,
    pub content: String,
    pub image_url: Option<String>,
}

/// Conversation summary row for listings.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConversationSummary {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    /// Preview of the most recent turn's text
    pub last_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_turn_role_round_trip() {
        assert_eq!(TurnRole::User.to_string(), "user");
        assert_eq!(TurnRole::from_str("Assistant").unwrap(), TurnRole::Assistant);
        assert!(TurnRole::from_str("system").is_err());
    }
}
