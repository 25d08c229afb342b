//! API request and response types

use serde::{Deserialize, Serialize};

/// Body of `POST /api/v1/chat`
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub query_text: String,
}

/// Response for `GET /api/v1`
#[derive(Debug, Serialize)]
pub struct WelcomeResponse {
    pub message: String,
    pub app_name: String,
    pub version: String,
    pub active_conversations: usize,
    pub turns: u64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
