//! API routes

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post, put},
    Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::conversation::{Conversation, ConversationSummary};
use crate::core::analysis::{self, TextStats};
use crate::core::{EngineError, ScanReceipt, SendReceipt};
use crate::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    provider: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub image_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ViewportRequest {
    pub pinned: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub text: String,
    #[serde(default)]
    pub image_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnalysisRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    stopped: bool,
}

#[derive(Debug, Serialize)]
struct FeedbackResponse {
    liked: Option<bool>,
}

#[derive(Debug, Serialize)]
struct TextResponse {
    text: String,
}

/// Engine errors mapped onto HTTP statuses
#[derive(Debug)]
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NotFound { .. } | EngineError::ConversationNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::Busy(_) => StatusCode::CONFLICT,
            EngineError::NotAUserMessage(_) | EngineError::EmptyMessage => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::Storage(err) => {
                tracing::error!("Storage error: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({
            "error": self.0.to_string()
        });

        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        provider: state.config.llm.provider.clone(),
    })
}

async fn list_conversations(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<ConversationSummary>>> {
    Ok(Json(state.engine.list_conversations().await?))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    Ok(Json(state.engine.conversation(&id).await?))
}

async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> ApiResult<(StatusCode, Json<SendReceipt>)> {
    let receipt = state
        .engine
        .send(
            request.conversation_id.as_deref(),
            &request.text,
            request.image_uri,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn stop_generating(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StopResponse>> {
    let stopped = state.engine.stop_generating(&id).await?;
    Ok(Json(StopResponse { stopped }))
}

async fn edit_message(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
    Json(request): Json<EditRequest>,
) -> ApiResult<(StatusCode, Json<SendReceipt>)> {
    let receipt = state
        .engine
        .edit_and_resend(&id, &message_id, &request.text)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn regenerate(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<SendReceipt>)> {
    let receipt = state.engine.regenerate(&id, &message_id).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn like(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
) -> ApiResult<Json<FeedbackResponse>> {
    let liked = state.engine.like(&id, &message_id).await?;
    Ok(Json(FeedbackResponse { liked }))
}

async fn dislike(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
) -> ApiResult<Json<FeedbackResponse>> {
    let liked = state.engine.dislike(&id, &message_id).await?;
    Ok(Json(FeedbackResponse { liked }))
}

async fn copy(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
) -> ApiResult<Json<TextResponse>> {
    let text = state.engine.copy(&id, &message_id).await?;
    Ok(Json(TextResponse { text }))
}

async fn share(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
) -> ApiResult<Json<TextResponse>> {
    let text = state.engine.share(&id, &message_id).await?;
    Ok(Json(TextResponse { text }))
}

async fn set_viewport(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ViewportRequest>,
) -> StatusCode {
    state.engine.set_viewport_pinned(&id, request.pinned).await;
    StatusCode::NO_CONTENT
}

async fn start_from_scan(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> ApiResult<(StatusCode, Json<ScanReceipt>)> {
    let receipt = state
        .engine
        .start_from_scan(&request.text, request.image_uri)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn analyze_text(Json(request): Json<AnalysisRequest>) -> Json<TextStats> {
    Json(analysis::analyze(&request.text))
}

/// Engine events as server-sent events, one JSON object per event
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.engine.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => match Event::default().json_data(&event) {
                    Ok(sse) => yield Ok(sse),
                    Err(e) => tracing::warn!("Failed to encode event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/conversations", get(list_conversations))
        .route("/v1/conversations/messages", post(send_message))
        .route("/v1/conversations/:id", get(get_conversation))
        .route("/v1/conversations/:id/stop", post(stop_generating))
        .route("/v1/conversations/:id/viewport", put(set_viewport))
        .route(
            "/v1/conversations/:id/messages/:message_id/edit",
            post(edit_message),
        )
        .route(
            "/v1/conversations/:id/messages/:message_id/regenerate",
            post(regenerate),
        )
        .route("/v1/conversations/:id/messages/:message_id/like", post(like))
        .route(
            "/v1/conversations/:id/messages/:message_id/dislike",
            post(dislike),
        )
        .route("/v1/conversations/:id/messages/:message_id/copy", post(copy))
        .route("/v1/conversations/:id/messages/:message_id/share", post(share))
        .route("/v1/scans", post(start_from_scan))
        .route("/v1/analysis", post(analyze_text))
        .route("/v1/events", get(events))
}
