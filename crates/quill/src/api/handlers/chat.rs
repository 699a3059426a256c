//! Chat turn handlers.

use std::convert::Infallible;

use axum::{
    Json,
    extract::{Multipart, Path, State},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::{Caller, CurrentUser};
use crate::chat::{ImagePayload, StreamEvent, TurnInput, TurnReply, TurnRequest};

/// Handle a buffered chat turn.
///
/// POST /api/chat
#[instrument(skip(state, caller, request))]
pub async fn chat(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<TurnRequest>,
) -> ApiResult<Json<TurnReply>> {
    info!(
        anonymous = caller.is_anonymous(),
        has_image = request.image_data.is_some(),
        continuation = request.chat_id.is_some(),
        "chat turn"
    );

    let reply = state.chat.turn(&caller, request.into()).await?;
    Ok(Json(reply))
}

/// Handle a streaming chat turn as server-sent events.
///
/// POST /api/chat/stream
#[instrument(skip(state, caller, request))]
pub async fn chat_stream(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<TurnRequest>,
) -> Result<impl IntoResponse, ApiError> {
    info!(anonymous = caller.is_anonymous(), "streaming chat turn");

    let events = state.chat.clone().turn_stream(caller, request.into())?;
    let stream = events.map(|event| Ok::<Event, Infallible>(sse_frame(&event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_frame(event: &StreamEvent) -> Event {
    // StreamEvent only holds strings; serialization cannot fail.
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}

/// Handle a chat turn with a multipart file upload.
///
/// POST /api/chat/upload
#[instrument(skip(state, caller, multipart))]
pub async fn chat_upload(
    State(state): State<AppState>,
    caller: Caller,
    mut multipart: Multipart,
) -> ApiResult<Json<TurnReply>> {
    let mut input = TurnInput::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") => {
                let media_type = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_default();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("failed to read image: {e}")))?;
                input.image = Some(ImagePayload::Raw {
                    bytes: bytes.to_vec(),
                    media_type,
                });
            }
            Some("message") => input.message = text_field(field).await?,
            Some("chat_id") => {
                input.conversation_id = Some(text_field(field).await?).filter(|s| !s.is_empty());
            }
            Some("system_prompt") => {
                input.system_prompt = Some(text_field(field).await?).filter(|s| !s.is_empty());
            }
            _ => {}
        }
    }

    if input.image.is_none() {
        return Err(ApiError::bad_request("missing image field"));
    }

    info!(anonymous = caller.is_anonymous(), "chat upload turn");
    let reply = state.chat.turn(&caller, input).await?;
    Ok(Json(reply))
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid form field: {e}")))
}

/// List the caller's conversations, most recently updated first.
///
/// GET /api/chats
#[instrument(skip(state, user))]
pub async fn list_chats(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Value>> {
    let chats = state
        .history
        .conversations(user.id())
        .await
        .map_err(|e| ApiError::internal(format!("failed to list chats: {e}")))?;

    Ok(Json(json!({ "chats": chats })))
}

/// List the turns of one conversation, oldest first.
///
/// GET /api/chats/{chat_id}
#[instrument(skip(state, user))]
pub async fn get_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let messages = state
        .history
        .turns(user.id(), &chat_id)
        .await
        .map_err(|e| ApiError::internal(format!("failed to load chat: {e}")))?;

    Ok(Json(json!({ "messages": messages })))
}
