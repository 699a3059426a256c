//! Completion request and response types.

use serde::{Deserialize, Serialize};

/// One block of a message's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

/// Base64 image source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl ContentBlock {
    /// A text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// A base64 image block.
    pub fn image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Image {
            source: ImageSource {
                source_type: "base64".to_string(),
                media_type: media_type.into(),
                data: data.into(),
            },
        }
    }
}

/// A role-tagged message in the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

/// A full completion request. Constructed fresh per call, never reused.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Content blocks of the current turn, in order.
    pub blocks: Vec<ContentBlock>,
    /// Prior turns, oldest first, text-only projections.
    pub prior_messages: Vec<Message>,
    /// System prompt.
    pub system: String,
}

impl CompletionRequest {
    /// All messages of the request: history followed by the current turn.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = self.prior_messages.clone();
        messages.push(Message {
            role: "user".to_string(),
            content: self.blocks.clone(),
        });
        messages
    }
}

/// A buffered completion result.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Full response text.
    pub text: String,
    /// Provider-assigned message id.
    pub message_id: String,
}
