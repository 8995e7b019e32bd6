//! # swipe-dl
//!
//! Review-then-download orchestration with an on-demand, cost-metered relay.
//!
//! Candidates discovered by an external feed listener enter a review queue as
//! PENDING tasks. An operator confirms or ignores each one. Confirmed tasks are
//! submitted to a remote offline-download service and fetched by a local aria2
//! daemon, all through a single short-lived cloud relay that is created on
//! demand, shared by every active task and deleted once idle.
//!
//! ## Components
//!
//! - [`registry`] - Task state machine with an audit trail
//! - [`relay`] - Relay lease manager (refcount, idle timer, emergency destroy)
//! - [`monitor`] - Polls the transfer daemon and classifies progress
//! - [`cost`] - Billable minutes and monthly spend
//! - [`orchestrator`] - Wires the above together and recovers after restarts
//! - [`api`] - REST API and server-sent events
//!
//! ## Quick Start
//!
//! ```no_run
//! use swipe_dl::{Config, Orchestrator, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let orchestrator = Orchestrator::new(config).await?;
//!     orchestrator.start();
//!
//!     let mut events = orchestrator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     run_with_shutdown(orchestrator).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API module
pub mod api;
/// Configuration types
pub mod config;
/// Relay billing arithmetic
pub mod cost;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Transfer progress polling and stall detection
pub mod monitor;
/// Coordination of tasks, relay, storage and transfers
pub mod orchestrator;
/// Task state machine
pub mod registry;
/// On-demand relay lease management
pub mod relay;
/// Retry logic with exponential backoff
pub mod retry;
/// Remote offline-download storage client
pub mod storage;
/// Local transfer daemon client
pub mod transfer;
/// Core types and events
pub mod types;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{Config, StallPolicy};
pub use db::Database;
pub use error::{
    ApiError, DatabaseError, Error, ErrorDetail, RelayError, Result, TaskError, ToHttpStatus,
};
pub use orchestrator::{Orchestrator, Services};
pub use relay::{RelayLeaseManager, RelayRoute};
pub use types::{
    AuditEntry, Channel, DashboardSnapshot, Decision, EmergencyDestroyReport, Event, LeaseId,
    LeaseState, NewTask, RelayAlert, RelayStatus, StatusCounts, Task, TaskId, TaskPage,
    TaskStatus,
};

/// Run the orchestrator until a termination signal, then shut it down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use swipe_dl::{Config, Orchestrator, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let orchestrator = Orchestrator::new(Config::default()).await?;
///     orchestrator.start();
///     run_with_shutdown(orchestrator).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(orchestrator: Orchestrator) -> Result<()> {
    wait_for_signal().await;
    orchestrator.shutdown().await
}

/// Resolves on SIGTERM or SIGINT (Ctrl+C elsewhere)
pub async fn shutdown_signal() {
    wait_for_signal().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
