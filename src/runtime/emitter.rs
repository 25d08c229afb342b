//! Streaming emitter
//!
//! Each turn gets a fresh unbounded channel. The runtime writes progress and
//! exactly one terminal event; the caller reads them as a stream. A caller
//! that went away does not stop the turn.

use crate::decoder::AgentEvent;
use crate::state_machine::state::ContactMatch;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// One event of a turn's stream, tagged by `op` on the wire
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StreamEvent {
    TraceId {
        trace_id: String,
    },
    Info {
        message: String,
    },
    /// The turn is suspended until the user answers
    AskUserData {
        message: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        candidates: Vec<ContactMatch>,
    },
    FinalGenerated {
        message: String,
        events: Vec<AgentEvent>,
        /// False when the answer could not be saved
        persisted: bool,
    },
    Error {
        message: String,
        kind: String,
    },
}

impl StreamEvent {
    /// Terminal events end the stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::AskUserData { .. }
                | StreamEvent::FinalGenerated { .. }
                | StreamEvent::Error { .. }
        )
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
            kind: kind.to_string(),
        }
    }
}

/// Ordered, finite event stream handed to the caller
pub type EventStream = UnboundedReceiverStream<StreamEvent>;

/// Write side of one turn's stream
pub struct Emitter {
    conv_id: String,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl Emitter {
    pub fn channel(conv_id: impl Into<String>) -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conv_id: conv_id.into(),
                tx,
            },
            UnboundedReceiverStream::new(rx),
        )
    }

    fn send(&self, event: StreamEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!(conv_id = %self.conv_id, "Stream receiver dropped");
        }
    }

    pub fn trace_id(&self) {
        self.send(StreamEvent::TraceId {
            trace_id: self.conv_id.clone(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.send(StreamEvent::Info {
            message: message.into(),
        });
    }

    /// Emit the terminal event. Consumes the emitter, closing the stream.
    pub fn finish(self, event: StreamEvent) {
        debug_assert!(event.is_terminal());
        self.send(event);
    }
}
