//! Runtime for executing conversations
//!
//! One worker task per active conversation drains a queue of turn requests,
//! so turns of the same conversation run strictly one after another while
//! different conversations proceed concurrently.

mod emitter;
mod executor;
mod recovery;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use emitter::{Emitter, EventStream, StreamEvent};
pub use executor::{ConversationRuntime, Timeouts, TurnError};
pub use traits::*;

use crate::state_machine::TurnSettings;
use crate::telemetry::Telemetry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::Instrument;

/// Type alias for production runtime with trait-object adapters
pub type ProductionRuntime =
    ConversationRuntime<dyn ConversationStore, dyn LlmClient, dyn ToolExecutor>;

/// Workers exit after this long without a turn
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

type Handles = Arc<RwLock<HashMap<String, ConversationHandle>>>;

struct TurnRequest {
    text: String,
    fresh: bool,
    emitter: Emitter,
}

/// Handle to a running conversation worker
struct ConversationHandle {
    turn_tx: mpsc::UnboundedSender<TurnRequest>,
}

/// Manager for all conversation runtimes
pub struct RuntimeManager {
    store: Arc<dyn ConversationStore>,
    llm_client: Arc<dyn LlmClient>,
    tool_executor: Arc<dyn ToolExecutor>,
    settings: TurnSettings,
    timeouts: Timeouts,
    telemetry: Arc<Telemetry>,
    runtimes: Handles,
}

impl RuntimeManager {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        llm_client: Arc<dyn LlmClient>,
        tool_executor: Arc<dyn ToolExecutor>,
        settings: TurnSettings,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            store,
            llm_client,
            tool_executor,
            settings,
            timeouts: Timeouts::default(),
            telemetry,
            runtimes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Start a new conversation. The stream opens with the trace id.
    pub async fn start(&self, text: String) -> (String, EventStream) {
        let conversation_id = uuid::Uuid::new_v4().to_string();
        let (emitter, stream) = Emitter::channel(&conversation_id);
        emitter.trace_id();

        tracing::info!(conv_id = %conversation_id, "Starting conversation");
        self.submit(
            &conversation_id,
            TurnRequest {
                text,
                fresh: true,
                emitter,
            },
        )
        .await;
        (conversation_id, stream)
    }

    /// Queue a turn on an existing conversation
    pub async fn continue_conversation(
        &self,
        conversation_id: &str,
        text: String,
    ) -> Result<EventStream, StoreError> {
        let running = self.runtimes.read().await.contains_key(conversation_id);
        if !running && !self.store.exists(conversation_id).await? {
            return Err(StoreError::NotFound(conversation_id.to_string()));
        }

        let (emitter, stream) = Emitter::channel(conversation_id);
        self.submit(
            conversation_id,
            TurnRequest {
                text,
                fresh: false,
                emitter,
            },
        )
        .await;
        Ok(stream)
    }

    /// Number of conversations with a live worker
    pub async fn active_conversations(&self) -> usize {
        self.runtimes.read().await.len()
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Hand a request to the conversation's worker, spawning one if needed.
    ///
    /// Sending happens under the map lock; a worker only retires while holding
    /// the write lock with an empty queue, so no request is ever stranded.
    async fn submit(&self, conversation_id: &str, request: TurnRequest) {
        let request = {
            let runtimes = self.runtimes.read().await;
            match runtimes.get(conversation_id) {
                Some(handle) => match handle.turn_tx.send(request) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(request)) => request,
                },
                None => request,
            }
        };

        let mut runtimes = self.runtimes.write().await;
        let handle = runtimes
            .entry(conversation_id.to_string())
            .or_insert_with(|| self.spawn_worker(conversation_id));
        if let Err(mpsc::error::SendError(request)) = handle.turn_tx.send(request) {
            // Worker died without retiring; replace it
            tracing::warn!(conv_id = %conversation_id, "Replacing dead conversation worker");
            let fresh = self.spawn_worker(conversation_id);
            let _ = fresh.turn_tx.send(request);
            runtimes.insert(conversation_id.to_string(), fresh);
        }
    }

    fn spawn_worker(&self, conversation_id: &str) -> ConversationHandle {
        let (turn_tx, mut turn_rx) = mpsc::unbounded_channel::<TurnRequest>();
        let mut runtime: ProductionRuntime = ConversationRuntime::new(
            conversation_id,
            self.settings.clone(),
            self.store.clone(),
            self.llm_client.clone(),
            self.tool_executor.clone(),
        )
        .with_timeouts(self.timeouts);

        let conv_id = conversation_id.to_string();
        let telemetry = self.telemetry.clone();
        let runtimes = self.runtimes.clone();

        tokio::spawn(async move {
            loop {
                let request = match tokio::time::timeout(IDLE_TIMEOUT, turn_rx.recv()).await {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(_) => {
                        let mut handles = runtimes.write().await;
                        if turn_rx.is_empty() {
                            handles.remove(&conv_id);
                            break;
                        }
                        continue;
                    }
                };

                let span = Telemetry::turn_span(&conv_id);
                let result = runtime
                    .run_turn(request.text, request.fresh, request.emitter)
                    .instrument(span)
                    .await;
                telemetry.record_turn(result.is_ok());
            }
            tracing::debug!(conv_id = %conv_id, "Conversation worker stopped");
        });

        ConversationHandle { turn_tx }
    }
}
