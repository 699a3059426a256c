//! HTTP handlers.

mod chat;
mod misc;

pub use chat::*;
pub use misc::*;
