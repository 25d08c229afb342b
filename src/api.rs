//! HTTP adapter
//!
//! Thin transport layer over the runtime manager: request validation,
//! SSE framing of turn events and status polling.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::db::Database;
use crate::runtime::RuntimeManager;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeManager>,
    pub db: Database,
}

impl AppState {
    pub fn new(runtime: Arc<RuntimeManager>, db: Database) -> Self {
        Self { runtime, db }
    }
}
