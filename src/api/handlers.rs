//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{ChatRequest, ErrorResponse, WelcomeResponse};
use super::AppState;
use crate::db::{ConversationSummary, DbError};
use crate::runtime::StoreError;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Header naming the conversation a chat message continues
pub const CONVERSATION_HEADER: &str = "conversation-id";

const MIN_QUERY_CHARS: usize = 2;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1", get(welcome))
        .route("/api/v1/chat", post(chat))
        .route("/api/v1/chat/:conversation_id", get(get_conversation))
        .with_state(state)
}

async fn welcome(State(state): State<AppState>) -> Json<WelcomeResponse> {
    Json(WelcomeResponse {
        message: "Calendar agent is up. POST /api/v1/chat to talk to it.".to_string(),
        app_name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_conversations: state.runtime.active_conversations().await,
        turns: state.runtime.telemetry().turns(),
    })
}

// ============================================================
// Chat
// ============================================================

/// Start a conversation, or continue the one named by the header.
/// The response is the turn's event stream.
async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let text = req.query_text.trim();
    if text.chars().count() < MIN_QUERY_CHARS {
        return Err(AppError::BadRequest(format!(
            "Query text must be at least {MIN_QUERY_CHARS} characters long."
        )));
    }

    let stream = match conversation_id(&headers)? {
        Some(id) => {
            tracing::info!(conv_id = %id, "Continuing conversation");
            state
                .runtime
                .continue_conversation(&id, text.to_string())
                .await?
        }
        None => state.runtime.start(text.to_string()).await.1,
    };

    Ok(sse_stream(stream).into_response())
}

fn conversation_id(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(value) = headers.get(CONVERSATION_HEADER) else {
        return Ok(None);
    };
    let id = value
        .to_str()
        .map_err(|_| AppError::BadRequest(format!("Invalid {CONVERSATION_HEADER} header")))?
        .trim();
    Ok((!id.is_empty()).then(|| id.to_string()))
}

// ============================================================
// Status polling
// ============================================================

async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationSummary>, AppError> {
    state
        .db
        .get_summary(&conversation_id)
        .map(Json)
        .map_err(|e| match e {
            DbError::ConversationNotFound(id) => {
                AppError::NotFound(format!("Conversation {id} not found"))
            }
            other => AppError::Internal(other.to_string()),
        })
}

// ============================================================
// Error handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => AppError::NotFound(format!("Conversation {id} not found")),
            StoreError::Unavailable(msg) => AppError::Unavailable(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        if status.is_server_error() {
            tracing::error!(status = %status, error = %message, "Request failed");
        }

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
