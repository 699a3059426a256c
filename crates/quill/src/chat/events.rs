//! Stream event framing for incremental responses.

use serde::{Deserialize, Serialize};

/// One framed unit of a streaming turn response.
///
/// Ordering invariant: exactly one `metadata` first, zero or more `content`
/// frames in arrival order, at most one `error`, a `final` only when the
/// exchange was persisted, and a terminating `done` always last. `content`
/// never follows `final`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Opens every stream: the conversation id known so far (the request's,
    /// if any) and the stored image URL when an upload succeeded.
    Metadata {
        chat_id: Option<String>,
        image_url: Option<String>,
    },
    /// One response text fragment.
    Content { content: String },
    /// Mid-stream completion failure, kept distinct from real content.
    Error { error: String },
    /// The persisted conversation id, emitted after a successful append.
    Final { chat_id: String },
    /// Terminal sentinel.
    Done,
}
