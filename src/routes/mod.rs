//! API routes
//!
//! Sending a message answers with `application/x-ndjson`: one
//! [`StreamChunk`] per line, the last one with `isDone: true`. Closing the
//! response early cancels the exchange. Continuing a chat streams the same way.

use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conversation::{Conversation, ConversationOptions, OptionDescriptor, StreamChunk, Turn};
use crate::core::{ChatEngine, ChatError, ConversationSummary, StoreError, PROVIDER_NAME};
use crate::harmony::options::MODEL;
use crate::tools::ToolDescriptor;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ChatEngine>,
    /// Used for requests that send no options
    pub default_options: ConversationOptions,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(error: ChatError) -> Self {
        let status = match &error {
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Busy(_) => StatusCode::CONFLICT,
            ChatError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        ChatError::Store(error).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, message = %self.message, "Request failed");
        }
        let body = json!({
            "error": true,
            "message": self.message,
            "status": self.status.as_u16(),
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ProviderInfo {
    name: &'static str,
    tools: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub user_prompt: String,
    /// Id the client already assigned to the user turn
    #[serde(default)]
    pub user_message_id: Option<Uuid>,
    #[serde(default)]
    pub options: Option<ConversationOptions>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueRequest {
    #[serde(default)]
    pub options: Option<ConversationOptions>,
}

/// Options for a request; the configured model applies unless the request names one.
fn resolve_options(state: &AppState, requested: Option<ConversationOptions>) -> ConversationOptions {
    let Some(mut options) = requested else {
        return state.default_options.clone();
    };
    if !options.extended_properties.contains_key(MODEL.key) {
        if let Some(model) = state.default_options.extended_properties.get(MODEL.key) {
            options
                .extended_properties
                .insert(MODEL.key.to_string(), model.clone());
        }
    }
    options
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolDescriptor>> {
    Json(state.engine.tools().descriptors())
}

async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderInfo>> {
    Json(vec![ProviderInfo {
        name: PROVIDER_NAME,
        tools: state.engine.tools().len(),
    }])
}

async fn provider_options(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<&'static [OptionDescriptor]>> {
    if name != PROVIDER_NAME {
        return Err(ApiError::not_found(format!("Unknown provider: {name}")));
    }
    Ok(Json(state.engine.option_descriptors()))
}

async fn list_chats(State(state): State<AppState>) -> ApiResult<Json<Vec<ConversationSummary>>> {
    Ok(Json(state.engine.store().list().await?))
}

async fn get_chat(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Conversation>> {
    let conversation = state.engine.store().load(&id).await?;
    if conversation.is_empty() {
        return Err(ApiError::not_found(format!("Conversation not found: {id}")));
    }
    Ok(Json(conversation))
}

async fn delete_chat(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    if state.engine.store().delete(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("Conversation not found: {id}")))
    }
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<Response> {
    let mut turn = Turn::user(request.user_prompt);
    if let Some(turn_id) = request.user_message_id {
        turn = turn.with_id(turn_id);
    }
    let options = resolve_options(&state, request.options);

    let cancel = CancellationToken::new();
    let chunks = Arc::clone(&state.engine)
        .send_message(&id, turn, options, cancel.clone())
        .await?;

    Ok(ndjson_response(cancel, chunks))
}

async fn continue_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ContinueRequest>,
) -> ApiResult<Response> {
    let options = resolve_options(&state, request.options);

    let cancel = CancellationToken::new();
    let chunks = Arc::clone(&state.engine)
        .continue_chat(&id, options, cancel.clone())
        .await?;

    Ok(ndjson_response(cancel, chunks))
}

fn ndjson_response(cancel: CancellationToken, mut chunks: mpsc::Receiver<StreamChunk>) -> Response {
    // dropping the body (client went away) cancels the exchange
    let guard = cancel.drop_guard();
    let body = stream! {
        let _guard = guard;
        while let Some(chunk) = chunks.recv().await {
            if let Some(line) = ndjson_line(&chunk) {
                yield Ok::<_, Infallible>(line);
            }
        }
    };

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response()
}

fn ndjson_line(chunk: &StreamChunk) -> Option<String> {
    match serde_json::to_string(chunk) {
        Ok(mut line) => {
            line.push('\n');
            Some(line)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode chunk");
            None
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/tools", get(list_tools))
        .route("/api/providers", get(list_providers))
        .route("/api/providers/:name/options", get(provider_options))
        .route("/api/chats", get(list_chats))
        .route("/api/chats/:id", get(get_chat).delete(delete_chat))
        .route("/api/chats/:id/messages", post(send_message))
        .route("/api/chats/:id/continue", post(continue_chat))
}
