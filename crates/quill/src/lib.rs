//! Quill, a chat turn orchestration backend.
//!
//! Accepts a user chat turn (text plus optional image), enriches it with
//! prior conversation context, forwards it to a remote completion service
//! in buffered or streamed mode, and persists the exchange.

pub mod api;
pub mod auth;
pub mod blobs;
pub mod chat;
pub mod db;
pub mod history;
pub mod media;
pub mod provider;
