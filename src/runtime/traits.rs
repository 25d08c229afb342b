//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the executor with mock implementations.

use crate::calendar::CalendarProvider;
use crate::db::{Database, DbError};
use crate::llm::{LlmError, LlmRequest, LlmResponse, ModelRegistry, ToolDefinition};
use crate::state_machine::ConversationState;
use crate::tools::{ToolContext, ToolOutput, ToolRegistry};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Conversation store failures as seen by the runtime
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("conversation store unavailable: {0}")]
    Unavailable(String),
}

/// Storage for conversation state
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, conv_id: &str) -> Result<ConversationState, StoreError>;

    /// Persist the state; histories only ever grow
    async fn save(&self, conv_id: &str, state: &ConversationState) -> Result<(), StoreError>;

    async fn exists(&self, conv_id: &str) -> Result<bool, StoreError>;
}

/// Client for making LLM requests
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete an LLM request
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

/// Executor for tools
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute a tool by name; `None` when no such tool is bound
    async fn execute(
        &self,
        name: &str,
        input: Value,
        conv_id: &str,
        cancel: CancellationToken,
    ) -> Option<ToolOutput>;

    /// Get tool definitions for LLM
    fn definitions(&self) -> Vec<ToolDefinition>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ConversationStore + ?Sized> ConversationStore for Arc<T> {
    async fn load(&self, conv_id: &str) -> Result<ConversationState, StoreError> {
        (**self).load(conv_id).await
    }

    async fn save(&self, conv_id: &str, state: &ConversationState) -> Result<(), StoreError> {
        (**self).save(conv_id, state).await
    }

    async fn exists(&self, conv_id: &str) -> Result<bool, StoreError> {
        (**self).exists(conv_id).await
    }
}

#[async_trait]
impl<T: LlmClient + ?Sized> LlmClient for Arc<T> {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        (**self).complete(request).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

#[async_trait]
impl<T: ToolExecutor + ?Sized> ToolExecutor for Arc<T> {
    async fn execute(
        &self,
        name: &str,
        input: Value,
        conv_id: &str,
        cancel: CancellationToken,
    ) -> Option<ToolOutput> {
        (**self).execute(name, input, conv_id, cancel).await
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        (**self).definitions()
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as a `ConversationStore`
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn store_error(e: DbError) -> StoreError {
    match e {
        DbError::ConversationNotFound(id) => StoreError::NotFound(id),
        other => StoreError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl ConversationStore for DatabaseStorage {
    async fn load(&self, conv_id: &str) -> Result<ConversationState, StoreError> {
        self.db.load_state(conv_id).map_err(store_error)
    }

    async fn save(&self, conv_id: &str, state: &ConversationState) -> Result<(), StoreError> {
        self.db.save_state(conv_id, state).map_err(store_error)
    }

    async fn exists(&self, conv_id: &str) -> Result<bool, StoreError> {
        self.db.conversation_exists(conv_id).map_err(store_error)
    }
}

/// Adapter to use `ModelRegistry` as `LlmClient`
pub struct RegistryLlmClient {
    registry: Arc<ModelRegistry>,
    model_id: String,
}

impl RegistryLlmClient {
    pub fn new(registry: Arc<ModelRegistry>, model_id: String) -> Self {
        Self { registry, model_id }
    }
}

#[async_trait]
impl LlmClient for RegistryLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let llm = self
            .registry
            .get(&self.model_id)
            .or_else(|| self.registry.default())
            .ok_or_else(|| LlmError::auth("No LLM available; set OPENAI_API_KEY or LLM_GATEWAY"))?;
        llm.complete(request).await
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Adapter to use `ToolRegistry` as `ToolExecutor`
pub struct ToolRegistryExecutor {
    registry: ToolRegistry,
    calendar: Arc<dyn CalendarProvider>,
}

impl ToolRegistryExecutor {
    pub fn new(registry: ToolRegistry, calendar: Arc<dyn CalendarProvider>) -> Self {
        Self { registry, calendar }
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistryExecutor {
    async fn execute(
        &self,
        name: &str,
        input: Value,
        conv_id: &str,
        cancel: CancellationToken,
    ) -> Option<ToolOutput> {
        let ctx = ToolContext::new(cancel, conv_id.to_string(), self.calendar.clone());
        self.registry.execute(name, input, ctx).await
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }
}
