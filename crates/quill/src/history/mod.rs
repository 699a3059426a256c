//! Conversation history: storage, assembly, and the persistence sink.

mod models;
mod repository;
mod service;

pub use models::{ConversationSummary, NewTurn, Turn, TurnRole};
pub use repository::HistoryRepository;
pub use service::HistoryService;
