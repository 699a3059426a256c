//! Turn request and reply shapes.

use serde::{Deserialize, Serialize};

/// A chat turn request body (buffered and streaming routes).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TurnRequest {
    /// User message text. May be empty when an image carries the turn.
    #[serde(default)]
    pub message: String,
    /// Optional data-URI encoded image.
    #[serde(default)]
    pub image_data: Option<String>,
    /// Conversation to continue; absent for a fresh exchange.
    #[serde(default)]
    pub chat_id: Option<String>,
    /// Per-request system prompt override.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// How a request supplies its image, if at all.
#[derive(Debug, Clone)]
pub enum ImagePayload {
    /// Data-URI string, subject to normalization.
    DataUri(String),
    /// Raw bytes with a declared content type (file-upload route).
    Raw { bytes: Vec<u8>, media_type: String },
}

/// Resolved inputs for one turn of the pipeline.
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    pub message: String,
    pub image: Option<ImagePayload>,
    pub conversation_id: Option<String>,
    pub system_prompt: Option<String>,
}

impl From<TurnRequest> for TurnInput {
    fn from(request: TurnRequest) -> Self {
        Self {
            message: request.message,
            image: request.image_data.map(ImagePayload::DataUri),
            conversation_id: request.chat_id,
            system_prompt: request.system_prompt,
        }
    }
}

/// A buffered turn reply.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    /// Full response text.
    pub content: String,
    /// Conversation id the exchange was stored under, when persisted.
    pub chat_id: Option<String>,
    /// Stored image URL, when the upload succeeded.
    pub image_url: Option<String>,
}
