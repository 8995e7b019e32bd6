//! Application state for the API server

use crate::{Config, Orchestrator};
use std::sync::Arc;

/// Shared application state accessible to all route handlers
///
/// This struct is cloned for each request (cheap Arc clone) and provides
/// access to the orchestrator and configuration.
#[derive(Clone)]
pub struct AppState {
    /// The orchestrator driving tasks and the relay
    pub orchestrator: Arc<Orchestrator>,

    /// Configuration (read-only at runtime)
    pub config: Arc<Config>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(orchestrator: Arc<Orchestrator>, config: Arc<Config>) -> Self {
        Self {
            orchestrator,
            config,
        }
    }
}
