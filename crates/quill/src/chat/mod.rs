//! Turn orchestration: the chat pipeline and its streaming frames.

mod events;
mod models;
mod service;

pub use events::StreamEvent;
pub use models::{ImagePayload, TurnInput, TurnReply, TurnRequest};
pub use service::{ChatError, ChatService};
