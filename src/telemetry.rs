//! Tracing setup and turn counters
//!
//! `Telemetry` is built once in `main` and handed to the runtime manager.
//! It owns the subscriber installation and is flushed on shutdown.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "calendar_agent=info,tower_http=debug";

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

pub struct Telemetry {
    started: Instant,
    turns: AtomicU64,
    failed_turns: AtomicU64,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            turns: AtomicU64::new(0),
            failed_turns: AtomicU64::new(0),
        }
    }
}

impl Telemetry {
    /// Install the global subscriber. A second call keeps the first subscriber.
    pub fn init(format: LogFormat) -> Self {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
        let registry = tracing_subscriber::registry().with(filter);
        let installed = match format {
            LogFormat::Json => registry
                .with(fmt::layer().json().with_current_span(true).with_span_list(false))
                .try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
        if let Err(e) = installed {
            tracing::debug!(error = %e, "Subscriber already installed");
        }
        Self::default()
    }

    /// Span wrapping every step of one turn
    pub fn turn_span(conversation_id: &str) -> tracing::Span {
        tracing::info_span!("turn", trace_id = %conversation_id)
    }

    pub fn record_turn(&self, succeeded: bool) {
        self.turns.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.failed_turns.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn turns(&self) -> u64 {
        self.turns.load(Ordering::Relaxed)
    }

    pub fn failed_turns(&self) -> u64 {
        self.failed_turns.load(Ordering::Relaxed)
    }

    /// Log the counters and flush stdout
    pub fn shutdown(&self) {
        tracing::info!(
            turns = self.turns(),
            failed_turns = self.failed_turns(),
            uptime_secs = self.started.elapsed().as_secs(),
            "Shutting down"
        );
        let _ = std::io::stdout().flush();
    }
}
