//! Orchestrator: the control loop tying the components together.
//!
//! The `Orchestrator` struct and its methods are organized by domain:
//! - [`dispatch`] - Operator decisions and the confirmation worker pool
//! - [`handlers`] - Monitor events, cancellation, emergency destroy, dashboard and settings
//! - [`recovery`] - Startup reconciliation of tasks, ledger and provider
//! - [`lifecycle`] - Background loops and shutdown
//!
//! Every cross-component change to a task happens while holding that task's
//! guard from the [`TaskRegistry`], so one task is never mutated by two paths
//! at once while different tasks proceed concurrently.

mod dispatch;
mod handlers;
mod lifecycle;
mod recovery;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::monitor::{DownloadMonitor, MonitorEvent};
use crate::registry::TaskRegistry;
use crate::relay::{
    HealthProbe, HttpProxyProbe, LeaseHandle, LinodeProvider, RelayLeaseManager, RelayProvider,
};
use crate::storage::{HttpOfflineStorage, OfflineStorage};
use crate::transfer::{Aria2Client, TransferDaemon};
use crate::types::{AuditEntry, Event, NewTask, StatusCounts, Task, TaskId, TaskPage, TaskStatus};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// External collaborators the orchestrator drives
///
/// Built from configuration by [`Services::from_config`]; tests substitute
/// in-memory implementations.
#[derive(Clone)]
pub struct Services {
    /// Relay compute provider
    pub provider: Arc<dyn RelayProvider>,
    /// Health probe run through a fresh relay
    pub probe: Arc<dyn HealthProbe>,
    /// Remote offline-download storage
    pub storage: Arc<dyn OfflineStorage>,
    /// Local transfer daemon
    pub transfer: Arc<dyn TransferDaemon>,
}

impl Services {
    /// HTTP clients for Linode, the storage service and aria2
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            provider: Arc::new(LinodeProvider::new(&config.relay)?),
            probe: Arc::new(HttpProxyProbe::new(&config.relay)),
            storage: Arc::new(HttpOfflineStorage::new(&config.storage)?),
            transfer: Arc::new(Aria2Client::new(&config.transfer)?),
        })
    }
}

/// Work handed from decisions and recovery to the confirmation workers
#[derive(Clone)]
pub(crate) struct WorkQueue {
    pub(crate) tx: mpsc::UnboundedSender<TaskId>,
    pub(crate) rx: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<TaskId>>>>,
    /// Bounds concurrent confirmations (respects orchestrator.workers)
    pub(crate) workers: Arc<Semaphore>,
}

/// Main orchestrator instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Orchestrator {
    /// Database instance for persistence
    /// Public for integration tests to inspect the ledger and audit trail
    pub db: Arc<Database>,
    pub(crate) config: Arc<Config>,
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) registry: TaskRegistry,
    pub(crate) relay: RelayLeaseManager,
    pub(crate) monitor: Arc<DownloadMonitor>,
    pub(crate) monitor_rx: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<MonitorEvent>>>>,
    pub(crate) storage: Arc<dyn OfflineStorage>,
    pub(crate) transfer: Arc<dyn TransferDaemon>,
    pub(crate) provider: Arc<dyn RelayProvider>,
    /// Relay references held by downloading tasks
    pub(crate) leases: Arc<Mutex<HashMap<TaskId, LeaseHandle>>>,
    pub(crate) work: WorkQueue,
    /// Cleared during shutdown; confirmations are refused afterwards
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Stops background loops
    pub(crate) cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator talking to the real collaborators
    ///
    /// Opens the database, reconciles state left by the previous run and
    /// returns without starting background loops; call [`Orchestrator::start`].
    pub async fn new(config: Config) -> Result<Self> {
        let services = Services::from_config(&config)?;
        Self::with_services(config, services).await
    }

    /// Create an orchestrator over explicit collaborators
    pub async fn with_services(config: Config, services: Services) -> Result<Self> {
        config.validate()?;

        let db = Arc::new(Database::new(&config.persistence.database_path).await?);
        let (event_tx, _rx) = broadcast::channel(config.orchestrator.event_buffer);

        let registry = TaskRegistry::new(db.clone(), event_tx.clone());
        let relay = RelayLeaseManager::new(
            config.relay.clone(),
            services.provider.clone(),
            services.probe.clone(),
            db.clone(),
            event_tx.clone(),
        );
        let (monitor, monitor_rx) = DownloadMonitor::new(
            config.monitor.clone(),
            services.transfer.clone(),
            event_tx.clone(),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let work = WorkQueue {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(Some(rx))),
            workers: Arc::new(Semaphore::new(config.orchestrator.workers)),
        };

        let orchestrator = Self {
            db,
            config: Arc::new(config),
            event_tx,
            registry,
            relay,
            monitor: Arc::new(monitor),
            monitor_rx: Arc::new(tokio::sync::Mutex::new(Some(monitor_rx))),
            storage: services.storage,
            transfer: services.transfer,
            provider: services.provider,
            leases: Arc::new(Mutex::new(HashMap::new())),
            work,
            accepting_new: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
        };

        orchestrator.recover().await?;
        Ok(orchestrator)
    }

    /// Subscribe to engine events
    ///
    /// Each subscriber receives every event independently. A subscriber more
    /// than `orchestrator.event_buffer` events behind gets `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// The relay lease manager
    pub fn relay(&self) -> &RelayLeaseManager {
        &self.relay
    }

    /// Record a new candidate from the feed listener
    pub async fn enqueue(&self, candidate: NewTask) -> Result<Task> {
        self.registry.enqueue(candidate).await
    }

    /// Get a task by ID
    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.registry.get(id).await
    }

    /// List tasks newest first
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<TaskPage> {
        self.registry.list(status, limit, offset).await
    }

    /// Task counts per status
    pub async fn counts(&self) -> Result<StatusCounts> {
        self.registry.counts().await
    }

    /// A task's audit trail
    pub async fn task_history(&self, id: TaskId) -> Result<Vec<AuditEntry>> {
        self.registry.history(id).await
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<TaskId, LeaseHandle>> {
        self.leases.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drop the relay reference a task holds, if any
    pub(crate) fn release_lease(&self, id: TaskId) {
        let handle = self.leases().remove(&id);
        if let Some(handle) = handle
            && !self.relay.release(&handle)
        {
            tracing::debug!(task_id = %id, "relay handle was already stale");
        }
    }

    /// Remember a task's relay reference; a holder only ever counts once
    pub(crate) fn hold_lease(&self, handle: LeaseHandle) {
        self.leases().insert(handle.holder(), handle);
    }

    pub(crate) fn holds_lease(&self, id: TaskId) -> bool {
        self.leases().contains_key(&id)
    }

    pub(crate) fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
