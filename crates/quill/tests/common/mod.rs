//! Test utilities and common setup.

use async_trait::async_trait;
use axum::Router;
use futures::stream;
use std::path::PathBuf;
use std::sync::Arc;

use quill::api::{self, AppState};
use quill::auth::{AuthConfig, AuthState};
use quill::blobs::{BlobStore, LocalBlobs};
use quill::chat::ChatService;
use quill::db::Database;
use quill::history::{HistoryRepository, HistoryService};
use quill::media::MediaConfig;
use quill::provider::{
    Completion, CompletionBackend, CompletionRequest, FragmentStream, ProviderResult,
};

/// Completion backend with canned buffered and streamed replies.
pub struct MockBackend {
    reply: String,
    fragments: Vec<String>,
}

impl MockBackend {
    pub fn new(reply: &str, fragments: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
        })
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn complete(&self, _request: CompletionRequest) -> ProviderResult<Completion> {
        Ok(Completion {
            text: self.reply.clone(),
            message_id: "msg_test".to_string(),
        })
    }

    async fn stream(&self, _request: CompletionRequest) -> ProviderResult<FragmentStream> {
        let items: Vec<ProviderResult<String>> =
            self.fragments.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

/// Create a test AuthConfig with a JWT secret for testing.
fn test_auth_config() -> AuthConfig {
    AuthConfig {
        jwt_secret: Some("test-secret-for-integration-tests-minimum-32-chars".to_string()),
        ..Default::default()
    }
}

fn test_uploads_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("quill-tests-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn build_app(
    backend: Option<Arc<dyn CompletionBackend>>,
    auth_state: AuthState,
) -> Router {
    let db = Database::in_memory().await.unwrap();
    let history = Arc::new(HistoryService::new(HistoryRepository::new(
        db.pool().clone(),
    )));

    let uploads_dir = test_uploads_dir();
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobs::new(uploads_dir.clone()));

    let chat = Arc::new(ChatService::new(
        backend,
        Arc::clone(&history),
        blobs,
        MediaConfig::default(),
        "You are a test assistant.".to_string(),
    ));

    let state = AppState::new(chat, history, auth_state, uploads_dir);
    api::create_router(state, 10)
}

/// Create a test application with the given completion backend.
pub async fn test_app(backend: Option<Arc<dyn CompletionBackend>>) -> Router {
    build_app(backend, AuthState::new(test_auth_config())).await
}

/// Create a test application and a valid bearer token for "user1".
pub async fn test_app_with_token(
    backend: Option<Arc<dyn CompletionBackend>>,
) -> (Router, String) {
    let auth_state = AuthState::new(test_auth_config());
    let token = auth_state
        .generate_token("user1", Some("user1@example.com"), Some("Test User"))
        .unwrap();

    (build_app(backend, auth_state).await, token)
}
