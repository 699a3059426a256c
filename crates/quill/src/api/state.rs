//! Application state shared across handlers.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::FromRef;

use crate::auth::AuthState;
use crate::chat::ChatService;
use crate::history::HistoryService;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Turn orchestration service.
    pub chat: Arc<ChatService>,
    /// History listings.
    pub history: Arc<HistoryService>,
    /// Authentication state.
    pub auth: AuthState,
    /// Directory served under `/uploads`.
    pub uploads_dir: PathBuf,
}

impl AppState {
    /// Create new application state.
    pub fn new(
        chat: Arc<ChatService>,
        history: Arc<HistoryService>,
        auth: AuthState,
        uploads_dir: PathBuf,
    ) -> Self {
        Self {
            chat,
            history,
            auth,
            uploads_dir,
        }
    }
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}
