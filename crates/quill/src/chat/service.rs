//! The turn pipeline.
//!
//! Sequencing per request: provider precondition, image normalization and
//! upload, history assembly, completion (buffered or streamed), then
//! persistence. Image, history, and persistence are enrichments that
//! degrade on failure; only the completion step can fail a request, and in
//! streaming mode even that failure is delivered in-band.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::auth::Caller;
use crate::blobs::BlobStore;
use crate::history::{HistoryService, NewTurn, Turn, TurnRole};
use crate::media::{self, MediaConfig, NormalizedImage};
use crate::provider::{CompletionBackend, CompletionRequest, ContentBlock, Message, ProviderError};

use super::events::StreamEvent;
use super::models::{ImagePayload, TurnInput, TurnReply};

/// Stream events buffered between the pipeline task and the SSE response.
const EVENT_BUFFER: usize = 32;

/// Turn pipeline errors surfaced to the API layer.
#[derive(Debug, Error)]
pub enum ChatError {
    /// No completion backend was configured at startup.
    #[error("completion service is unavailable")]
    ServiceUnavailable,

    /// The uploaded payload is not an acceptable image.
    #[error("invalid image: {0}")]
    BadImage(String),

    /// The mandatory completion call failed (buffered mode).
    #[error("completion failed: {0}")]
    Provider(#[from] ProviderError),
}

/// Optional image resolved for one turn.
#[derive(Debug, Clone, Default)]
struct PreparedImage {
    /// Request-attachable payload, absent when normalization failed.
    attachment: Option<NormalizedImage>,
    /// Stored URL, set only when the upload succeeded.
    url: Option<String>,
}

/// Turn orchestration service.
pub struct ChatService {
    provider: Option<Arc<dyn CompletionBackend>>,
    history: Arc<HistoryService>,
    blobs: Arc<dyn BlobStore>,
    media: MediaConfig,
    default_system_prompt: String,
}

impl ChatService {
    pub fn new(
        provider: Option<Arc<dyn CompletionBackend>>,
        history: Arc<HistoryService>,
        blobs: Arc<dyn BlobStore>,
        media: MediaConfig,
        default_system_prompt: String,
    ) -> Self {
        Self {
            provider,
            history,
            blobs,
            media,
            default_system_prompt,
        }
    }

    /// Fail-fast precondition: a turn needs a configured backend before any
    /// other work starts.
    fn backend(&self) -> Result<Arc<dyn CompletionBackend>, ChatError> {
        self.provider.clone().ok_or(ChatError::ServiceUnavailable)
    }

    fn validate_image(&self, input: &TurnInput) -> Result<(), ChatError> {
        if let Some(ImagePayload::Raw { media_type, .. }) = &input.image {
            if !media_type.starts_with("image/") {
                return Err(ChatError::BadImage(format!(
                    "unsupported content type: {media_type}"
                )));
            }
        }
        Ok(())
    }

    /// Run one buffered turn.
    pub async fn turn(&self, caller: &Caller, input: TurnInput) -> Result<TurnReply, ChatError> {
        let backend = self.backend()?;
        self.validate_image(&input)?;

        let image = self.prepare_image(caller, input.image.clone()).await;
        let history = self
            .history
            .assemble(caller, input.conversation_id.as_deref())
            .await;

        let request = self.build_request(&input, &image, &history);
        let completion = backend.complete(request).await?;

        let persisted = self
            .persist_exchange(caller, &input, image.url.as_deref(), &completion.text)
            .await;
        let conversation_id = persisted.or(input.conversation_id);

        info!(persisted = conversation_id.is_some(), "buffered turn complete");
        Ok(TurnReply {
            content: completion.text,
            chat_id: conversation_id,
            image_url: image.url,
        })
    }

    /// Run one streaming turn, returning its framed event sequence.
    ///
    /// Fails fast when the backend is unconfigured; every later failure is
    /// delivered in-band as stream events. The bounded channel is the
    /// request's backpressure point: a slow consumer pauses provider reads.
    pub fn turn_stream(
        self: Arc<Self>,
        caller: Caller,
        input: TurnInput,
    ) -> Result<ReceiverStream<StreamEvent>, ChatError> {
        self.backend()?;
        self.validate_image(&input)?;

        let (tx, rx) = mpsc::channel::<StreamEvent>(EVENT_BUFFER);
        tokio::spawn(async move {
            self.run_stream(caller, input, tx).await;
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn run_stream(&self, caller: Caller, input: TurnInput, tx: mpsc::Sender<StreamEvent>) {
        // Checked before spawning; a handle cannot disappear afterwards.
        let Ok(backend) = self.backend() else {
            let _ = tx.send(StreamEvent::Done).await;
            return;
        };

        let image = self.prepare_image(&caller, input.image.clone()).await;
        let history = self
            .history
            .assemble(&caller, input.conversation_id.as_deref())
            .await;

        let metadata = StreamEvent::Metadata {
            chat_id: input.conversation_id.clone(),
            image_url: image.url.clone(),
        };
        if tx.send(metadata).await.is_err() {
            return;
        }

        let request = self.build_request(&input, &image, &history);
        let mut fragments = match backend.stream(request).await {
            Ok(fragments) => fragments,
            Err(err) => {
                let _ = tx.send(StreamEvent::Error { error: err.to_string() }).await;
                let _ = tx.send(StreamEvent::Done).await;
                return;
            }
        };

        let mut accumulated = String::new();
        let mut failed = false;
        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(text) => {
                    accumulated.push_str(&text);
                    let event = StreamEvent::Content { content: text };
                    if tx.send(event).await.is_err() {
                        // Consumer disconnected: stop reading the provider
                        // and do not persist the incomplete exchange.
                        return;
                    }
                }
                Err(err) => {
                    failed = true;
                    let event = StreamEvent::Error { error: err.to_string() };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                    break;
                }
            }
        }

        // The assistant turn is the full accumulated text; interrupted
        // exchanges are not stored.
        if !failed {
            let persisted = self
                .persist_exchange(&caller, &input, image.url.as_deref(), &accumulated)
                .await;
            if let Some(chat_id) = persisted {
                if tx.send(StreamEvent::Final { chat_id }).await.is_err() {
                    return;
                }
            }
        }

        let _ = tx.send(StreamEvent::Done).await;
    }

    /// Resolve the request's image into an attachable payload and, for
    /// authenticated callers, a stored URL. Both halves degrade on failure.
    async fn prepare_image(&self, caller: &Caller, image: Option<ImagePayload>) -> PreparedImage {
        let Some(payload) = image else {
            return PreparedImage::default();
        };

        let attachment = match payload {
            ImagePayload::DataUri(uri) => match media::normalize(&uri, &self.media) {
                Ok(normalized) => Some(normalized),
                Err(err) => {
                    warn!("dropping malformed image from request: {err}");
                    None
                }
            },
            ImagePayload::Raw { bytes, media_type } => Some(NormalizedImage {
                data: BASE64.encode(&bytes),
                media_type,
            }),
        };

        let url = match (&attachment, caller.id()) {
            (Some(attachment), Some(user_id)) => {
                match BASE64.decode(attachment.data.as_bytes()) {
                    Ok(bytes) => match self
                        .blobs
                        .put(user_id, &bytes, &attachment.media_type)
                        .await
                    {
                        Ok(url) => Some(url),
                        Err(err) => {
                            warn!("image upload failed, continuing without a stored copy: {err}");
                            None
                        }
                    },
                    Err(err) => {
                        warn!("image payload is not valid base64, skipping upload: {err}");
                        None
                    }
                }
            }
            _ => None,
        };

        PreparedImage { attachment, url }
    }

    /// Shape the completion request: the current turn's text block first
    /// (omitted when empty), then the image block. Prior turns become
    /// text-only entries; history images are never re-attached.
    fn build_request(
        &self,
        input: &TurnInput,
        image: &PreparedImage,
        history: &[Turn],
    ) -> CompletionRequest {
        let mut blocks = Vec::new();
        if !input.message.is_empty() {
            blocks.push(ContentBlock::text(input.message.as_str()));
        }
        if let Some(attachment) = &image.attachment {
            blocks.push(ContentBlock::image(
                attachment.media_type.as_str(),
                attachment.data.as_str(),
            ));
        }

        let prior_messages = history
            .iter()
            .filter(|turn| !turn.content.is_empty())
            .map(|turn| Message {
                role: turn.role.clone(),
                content: vec![ContentBlock::text(turn.content.as_str())],
            })
            .collect();

        CompletionRequest {
            blocks,
            prior_messages,
            system: input
                .system_prompt
                .clone()
                .unwrap_or_else(|| self.default_system_prompt.clone()),
        }
    }

    /// Store both turns of the exchange under one conversation id.
    ///
    /// Returns the id only when the user turn was actually written, so a
    /// streaming caller emits `final` strictly on persisted success.
    async fn persist_exchange(
        &self,
        caller: &Caller,
        input: &TurnInput,
        image_url: Option<&str>,
        assistant_text: &str,
    ) -> Option<String> {
        let user_turn = NewTurn {
            conversation_id: input.conversation_id.clone(),
            role: TurnRole::User,
            content: input.message.clone(),
            image_url: image_url.map(str::to_string),
        };
        let conversation_id = self.history.append(caller, user_turn).await?;

        let assistant_turn = NewTurn {
            conversation_id: Some(conversation_id.clone()),
            role: TurnRole::Assistant,
            content: assistant_text.to_string(),
            image_url: None,
        };
        self.history.append(caller, assistant_turn).await;

        Some(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::LocalBlobs;
    use crate::db::Database;
    use crate::history::HistoryRepository;
    use crate::provider::{Completion, FragmentStream, ProviderResult};
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Backend scripted per test: a fixed buffered reply and/or a one-shot
    /// fragment stream.
    struct ScriptedBackend {
        reply: String,
        fragments: Mutex<Option<FragmentStream>>,
    }

    impl ScriptedBackend {
        fn buffered(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                fragments: Mutex::new(None),
            }
        }

        fn streaming(fragments: FragmentStream) -> Self {
            Self {
                reply: String::new(),
                fragments: Mutex::new(Some(fragments)),
            }
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, _request: CompletionRequest) -> ProviderResult<Completion> {
            Ok(Completion {
                text: self.reply.clone(),
                message_id: "msg_test".to_string(),
            })
        }

        async fn stream(&self, _request: CompletionRequest) -> ProviderResult<FragmentStream> {
            Ok(self
                .fragments
                .lock()
                .unwrap()
                .take()
                .expect("stream consumed twice"))
        }
    }

    fn fragment_stream(fragments: &[&str]) -> FragmentStream {
        let items: Vec<ProviderResult<String>> =
            fragments.iter().map(|f| Ok(f.to_string())).collect();
        Box::pin(stream::iter(items))
    }

    struct Harness {
        service: Arc<ChatService>,
        history: Arc<HistoryService>,
        _uploads: TempDir,
    }

    async fn harness(backend: Option<Arc<dyn CompletionBackend>>) -> Harness {
        let db = Database::in_memory().await.unwrap();
        let history = Arc::new(HistoryService::new(HistoryRepository::new(db.pool().clone())));
        let uploads = TempDir::new().unwrap();
        let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobs::new(uploads.path()));

        let service = Arc::new(ChatService::new(
            backend,
            Arc::clone(&history),
            blobs,
            MediaConfig::default(),
            "You are a helpful assistant.".to_string(),
        ));

        Harness {
            service,
            history,
            _uploads: uploads,
        }
    }

    fn authed() -> Caller {
        Caller::User {
            id: "u1".to_string(),
        }
    }

    fn text_input(message: &str) -> TurnInput {
        TurnInput {
            message: message.to_string(),
            ..Default::default()
        }
    }

    async fn collect(mut events: ReceiverStream<StreamEvent>) -> Vec<StreamEvent> {
        let mut collected = Vec::new();
        while let Some(event) = events.next().await {
            collected.push(event);
        }
        collected
    }

    #[tokio::test]
    async fn test_unconfigured_backend_fails_fast() {
        let h = harness(None).await;

        let err = h.service.turn(&authed(), text_input("Hello")).await.unwrap_err();
        assert!(matches!(err, ChatError::ServiceUnavailable));

        let err = h
            .service
            .clone()
            .turn_stream(authed(), text_input("Hello"))
            .unwrap_err();
        assert!(matches!(err, ChatError::ServiceUnavailable));
    }

    #[tokio::test]
    async fn test_buffered_turn_persists_exchange() {
        // Scenario: authenticated caller, no image, no prior history.
        let backend = Arc::new(ScriptedBackend::buffered("Hello back!"));
        let h = harness(Some(backend)).await;

        let reply = h.service.turn(&authed(), text_input("Hello")).await.unwrap();
        assert_eq!(reply.content, "Hello back!");
        assert!(reply.image_url.is_none());

        let chat_id = reply.chat_id.expect("exchange should be persisted");
        let turns = h.history.turns("u1", &chat_id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns[0].content, "Hello");
        assert_eq!(turns[1].role, "assistant");
        assert_eq!(turns[1].content, "Hello back!");
    }

    #[tokio::test]
    async fn test_buffered_anonymous_turn_is_stateless() {
        let backend = Arc::new(ScriptedBackend::buffered("Hi"));
        let h = harness(Some(backend)).await;

        let reply = h
            .service
            .turn(&Caller::Anonymous, text_input("Hello"))
            .await
            .unwrap();
        assert_eq!(reply.content, "Hi");
        assert!(reply.chat_id.is_none());

        // Even a supplied conversation id stays untouched for anonymous
        // callers: nothing is read or written.
        let input = TurnInput {
            conversation_id: Some("chat_ignored".to_string()),
            ..text_input("Again")
        };
        let reply = h.service.turn(&Caller::Anonymous, input).await.unwrap();
        assert_eq!(reply.chat_id.as_deref(), Some("chat_ignored"));
        assert!(h.history.turns("u1", "chat_ignored").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_variant_rejects_non_image() {
        let backend = Arc::new(ScriptedBackend::buffered("ok"));
        let h = harness(Some(backend)).await;

        let input = TurnInput {
            image: Some(ImagePayload::Raw {
                bytes: b"plain".to_vec(),
                media_type: "text/plain".to_string(),
            }),
            ..text_input("look")
        };
        let err = h.service.turn(&authed(), input).await.unwrap_err();
        assert!(matches!(err, ChatError::BadImage(_)));
    }

    #[tokio::test]
    async fn test_malformed_data_uri_degrades_to_no_image() {
        let backend = Arc::new(ScriptedBackend::buffered("still fine"));
        let h = harness(Some(backend)).await;

        let input = TurnInput {
            image: Some(ImagePayload::DataUri("not-a-data-uri".to_string())),
            ..text_input("hello")
        };
        let reply = h.service.turn(&authed(), input).await.unwrap();
        assert_eq!(reply.content, "still fine");
        assert!(reply.image_url.is_none());
    }

    #[tokio::test]
    async fn test_streaming_turn_frames_in_order() {
        // Scenario: fragments "Hi", " there" for an authenticated caller.
        let backend = Arc::new(ScriptedBackend::streaming(fragment_stream(&[
            "Hi", " there",
        ])));
        let h = harness(Some(backend)).await;

        let events = h
            .service
            .clone()
            .turn_stream(authed(), text_input("greet me"))
            .unwrap();
        let events = collect(events).await;

        assert_eq!(events.len(), 5);
        assert_eq!(
            events[0],
            StreamEvent::Metadata {
                chat_id: None,
                image_url: None
            }
        );
        assert_eq!(
            events[1],
            StreamEvent::Content {
                content: "Hi".to_string()
            }
        );
        assert_eq!(
            events[2],
            StreamEvent::Content {
                content: " there".to_string()
            }
        );
        let StreamEvent::Final { chat_id } = &events[3] else {
            panic!("expected final event, got {:?}", events[3]);
        };
        assert_eq!(events[4], StreamEvent::Done);

        // The persisted assistant turn is the accumulated text.
        let turns = h.history.turns("u1", chat_id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "Hi there");
    }

    #[tokio::test]
    async fn test_streaming_anonymous_has_no_final() {
        // Scenario: anonymous streaming caller.
        let backend = Arc::new(ScriptedBackend::streaming(fragment_stream(&["Hi"])));
        let h = harness(Some(backend)).await;

        let events = h
            .service
            .clone()
            .turn_stream(Caller::Anonymous, text_input("hello"))
            .unwrap();
        let events = collect(events).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Metadata {
                    chat_id: None,
                    image_url: None
                },
                StreamEvent::Content {
                    content: "Hi".to_string()
                },
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_streaming_error_is_distinct_and_unpersisted() {
        let items: Vec<ProviderResult<String>> = vec![
            Ok("partial".to_string()),
            Err(ProviderError::Stream("overloaded".to_string())),
        ];
        let backend = Arc::new(ScriptedBackend::streaming(Box::pin(stream::iter(items))));
        let h = harness(Some(backend)).await;

        let events = h
            .service
            .clone()
            .turn_stream(authed(), text_input("hello"))
            .unwrap();
        let events = collect(events).await;

        assert!(matches!(events[1], StreamEvent::Content { .. }));
        assert!(matches!(events[2], StreamEvent::Error { .. }));
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Final { .. })));

        // The interrupted exchange is not stored.
        assert!(h.history.conversations("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_consumer_disconnect_skips_persistence() {
        // First fragment arrives immediately, the second only after a
        // delay, so the consumer can disconnect in between.
        let delayed = stream::iter(vec![Ok("Hi".to_string())]).chain(stream::once(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(" there".to_string())
        }));
        let backend = Arc::new(ScriptedBackend::streaming(Box::pin(delayed)));
        let h = harness(Some(backend)).await;

        let mut events = h
            .service
            .clone()
            .turn_stream(authed(), text_input("hello"))
            .unwrap();
        assert!(matches!(
            events.next().await,
            Some(StreamEvent::Metadata { .. })
        ));
        assert!(matches!(
            events.next().await,
            Some(StreamEvent::Content { .. })
        ));
        drop(events);

        // Give the pipeline task time to observe the closed channel.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(h.history.conversations("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_image_turn_attaches_block_and_uploads() {
        // Scenario: image-only turn; empty text is omitted from blocks.
        let backend = Arc::new(ScriptedBackend::buffered("nice picture"));
        let h = harness(Some(backend)).await;

        let png = {
            let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(8, 8));
            let mut buf = Vec::new();
            img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
                .unwrap();
            buf
        };
        let uri = format!("data:image/png;base64,{}", BASE64.encode(&png));

        let input = TurnInput {
            message: String::new(),
            image: Some(ImagePayload::DataUri(uri)),
            ..Default::default()
        };
        let reply = h.service.turn(&authed(), input.clone()).await.unwrap();
        let image_url = reply.image_url.expect("upload should succeed");
        assert!(image_url.starts_with("/uploads/u1/"));

        // The stored user turn carries the image reference.
        let chat_id = reply.chat_id.unwrap();
        let turns = h.history.turns("u1", &chat_id).await.unwrap();
        assert_eq!(turns[0].image_url.as_deref(), Some(image_url.as_str()));

        // Block shaping: empty text omitted, image present.
        let image = h.service.prepare_image(&authed(), input.image.clone()).await;
        let request = h.service.build_request(&input, &image, &[]);
        assert_eq!(request.blocks.len(), 1);
        assert!(matches!(request.blocks[0], ContentBlock::Image { .. }));
    }

    #[tokio::test]
    async fn test_history_projected_text_only() {
        let backend = Arc::new(ScriptedBackend::buffered("reply"));
        let h = harness(Some(backend)).await;
        let caller = authed();

        let id = h
            .history
            .append(
                &caller,
                NewTurn {
                    conversation_id: None,
                    role: TurnRole::User,
                    content: "earlier".to_string(),
                    image_url: Some("/uploads/u1/old.png".to_string()),
                },
            )
            .await
            .unwrap();

        let history = h.history.assemble(&caller, Some(&id)).await;
        let input = text_input("now");
        let request = h
            .service
            .build_request(&input, &PreparedImage::default(), &history);

        assert_eq!(request.prior_messages.len(), 1);
        assert_eq!(request.prior_messages[0].content.len(), 1);
        assert!(matches!(
            request.prior_messages[0].content[0],
            ContentBlock::Text { .. }
        ));
    }
}
