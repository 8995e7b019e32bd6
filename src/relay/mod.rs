//! Relay lease manager
//!
//! Owns the single on-demand relay instance. Downloads take a reference with
//! [`RelayLeaseManager::acquire`] and drop it with [`RelayLeaseManager::release`].
//! The first acquire provisions an instance; concurrent acquires while it boots
//! wait on the same provisioning run. When the last reference is released an
//! idle timer starts, and the instance is deleted if nobody acquires before it
//! fires.
//!
//! Every instance gets a ledger row so cost and undeleted instances survive a
//! restart. Deletions that exhaust their retries leave the instance in the
//! orphan list, raise an alert, and are retried by [`RelayLeaseManager::retry_orphans`].
//!
//! Lease state sits behind a synchronous mutex that is never held across an
//! `.await`. Each provisioning run and each adopted lease gets a new generation
//! number; handles and background tasks from an older generation are ignored.

use crate::config::RelayConfig;
use crate::cost::CostAccountant;
use crate::db::{Database, LeaseRow, NewLease, lease_status};
use crate::error::{Error, RelayError, Result};
use crate::retry::with_retry;
use crate::types::{
    EmergencyDestroyReport, Event, LeaseId, LeaseState, ProbeReport, RelayStatus, TaskId,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

pub mod bootstrap;
pub mod probe;
pub mod provider;

pub use probe::{HealthProbe, HttpProxyProbe};
pub use provider::{InstanceSpec, InstanceStatus, LinodeProvider, ProviderInstance, RelayProvider};

/// Orphan deletions in flight at once
const ORPHAN_DELETE_CONCURRENCY: usize = 4;

/// How to reach the relay's proxy
#[derive(Clone, PartialEq, Eq)]
pub struct RelayRoute {
    /// Public address
    pub address: String,
    /// Proxy port
    pub port: u16,
    /// Proxy username
    pub username: String,
    /// Proxy password
    pub password: String,
}

impl RelayRoute {
    /// `address:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Proxy URL with embedded credentials, as taken by the transfer daemon
    pub fn proxy_url(&self) -> String {
        format!(
            "http://{}:{}@{}:{}",
            self.username, self.password, self.address, self.port
        )
    }
}

impl std::fmt::Debug for RelayRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRoute")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One holder's reference on the relay
///
/// Must be handed back to [`RelayLeaseManager::release`]. Handles from before an
/// emergency destroy are stale and releasing them is a no-op.
#[derive(Clone, Debug)]
pub struct LeaseHandle {
    lease_id: LeaseId,
    generation: u64,
    holder: TaskId,
    route: RelayRoute,
}

impl LeaseHandle {
    /// Ledger id of the lease
    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// Task holding the reference
    pub fn holder(&self) -> TaskId {
        self.holder
    }

    /// Where to send traffic
    pub fn route(&self) -> &RelayRoute {
        &self.route
    }
}

type ProvisionOutcome = std::result::Result<(), RelayError>;

struct ProvisionSlot {
    cancel: CancellationToken,
    outcome: Arc<watch::Sender<Option<ProvisionOutcome>>>,
}

struct LiveLease {
    id: LeaseId,
    instance_id: Option<String>,
    route: Option<RelayRoute>,
    created_at: DateTime<Utc>,
    ready_at: Option<DateTime<Utc>>,
}

struct Orphan {
    lease_id: Option<LeaseId>,
    instance_id: String,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct LeaseInner {
    state: LeaseState,
    generation: u64,
    lease: Option<LiveLease>,
    holders: HashSet<TaskId>,
    waiters: usize,
    provision: Option<ProvisionSlot>,
    idle_timer: Option<CancellationToken>,
    orphans: Vec<Orphan>,
}

struct LeaseShared {
    config: RelayConfig,
    provider: Arc<dyn RelayProvider>,
    probe: Arc<dyn HealthProbe>,
    db: Arc<Database>,
    accountant: CostAccountant,
    event_tx: broadcast::Sender<Event>,
    state_tx: watch::Sender<LeaseState>,
    inner: Mutex<LeaseInner>,
}

/// Reference-counted owner of the relay instance
#[derive(Clone)]
pub struct RelayLeaseManager {
    shared: Arc<LeaseShared>,
}

enum Step {
    Granted(LeaseHandle),
    Provisioning(watch::Receiver<Option<ProvisionOutcome>>),
    Settle(LeaseState),
}

/// Counts an acquire blocked on provisioning; arms the idle timer on drop if
/// that left an active lease with nobody on it
struct WaiterGuard<'a> {
    manager: &'a RelayLeaseManager,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.manager.lock();
        inner.waiters = inner.waiters.saturating_sub(1);
        if inner.waiters == 0
            && inner.state == LeaseState::Active
            && inner.holders.is_empty()
            && inner.idle_timer.is_none()
        {
            self.manager.arm_idle_timer(&mut inner);
        }
    }
}

/// Whether a failed create call may still have produced an instance
///
/// Transport failures and 5xx answers can follow an accepted request; a 4xx
/// means the provider refused it.
fn creation_outcome_unknown(error: &Error) -> bool {
    match error {
        Error::Relay(RelayError::Provider { status, .. }) => status.is_none_or(|s| s >= 500),
        Error::Relay(_) => false,
        _ => true,
    }
}

fn random_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl RelayLeaseManager {
    /// Create a manager; no instance exists until the first acquire
    pub fn new(
        config: RelayConfig,
        provider: Arc<dyn RelayProvider>,
        probe: Arc<dyn HealthProbe>,
        db: Arc<Database>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        let accountant = CostAccountant::new(config.hourly_rate, config.billing_unit);
        let (state_tx, _) = watch::channel(LeaseState::Absent);
        Self {
            shared: Arc::new(LeaseShared {
                config,
                provider,
                probe,
                db,
                accountant,
                event_tx,
                state_tx,
                inner: Mutex::new(LeaseInner::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LeaseInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Watch lease state changes
    pub fn subscribe_state(&self) -> watch::Receiver<LeaseState> {
        self.shared.state_tx.subscribe()
    }

    /// Current lease state
    pub fn state(&self) -> LeaseState {
        self.lock().state
    }

    /// Take a reference on an active relay, provisioning one if needed
    ///
    /// Returns only once the relay has passed its health probe. A holder that
    /// already has a reference gets another handle to it without adding a second
    /// reference.
    pub async fn acquire(&self, holder: TaskId) -> Result<LeaseHandle> {
        loop {
            let step = {
                let mut inner = self.lock();
                match inner.state {
                    LeaseState::Active => Step::Granted(self.grant(&mut inner, holder)?),
                    LeaseState::Absent => {
                        let rx = self.begin_provision(&mut inner);
                        inner.waiters += 1;
                        Step::Provisioning(rx)
                    }
                    LeaseState::Provisioning => {
                        match inner.provision.as_ref().map(|slot| slot.outcome.subscribe()) {
                            Some(rx) => {
                                inner.waiters += 1;
                                Step::Provisioning(rx)
                            }
                            None => Step::Settle(LeaseState::Provisioning),
                        }
                    }
                    LeaseState::Destroying => Step::Settle(LeaseState::Destroying),
                }
            };

            match step {
                Step::Granted(handle) => {
                    tracing::debug!(task_id = %holder, lease_id = %handle.lease_id, "relay reference granted");
                    return Ok(handle);
                }
                Step::Provisioning(mut rx) => {
                    let waiter = WaiterGuard { manager: self };
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(value) => value.clone().unwrap_or(Err(RelayError::Cancelled)),
                        Err(_) => Err(RelayError::Cancelled),
                    };
                    outcome?;

                    let mut inner = self.lock();
                    if inner.state == LeaseState::Active {
                        let handle = self.grant(&mut inner, holder)?;
                        drop(inner);
                        drop(waiter);
                        return Ok(handle);
                    }
                    // Lease moved on before we got here; start over
                }
                Step::Settle(current) => {
                    let mut rx = self.subscribe_state();
                    if rx.wait_for(|s| *s != current).await.is_err() {
                        return Err(RelayError::Cancelled.into());
                    }
                }
            }
        }
    }

    /// Drop one reference; returns false for stale or unknown handles
    pub fn release(&self, handle: &LeaseHandle) -> bool {
        let mut inner = self.lock();
        if handle.generation != inner.generation {
            tracing::debug!(task_id = %handle.holder, "ignoring release of stale relay handle");
            return false;
        }
        if !inner.holders.remove(&handle.holder) {
            return false;
        }

        tracing::debug!(
            task_id = %handle.holder,
            remaining = inner.holders.len(),
            "relay reference released"
        );
        if inner.holders.is_empty() && inner.waiters == 0 && inner.state == LeaseState::Active {
            self.arm_idle_timer(&mut inner);
        }
        true
    }

    fn grant(&self, inner: &mut LeaseInner, holder: TaskId) -> Result<LeaseHandle> {
        let (lease_id, route) = match &inner.lease {
            Some(LiveLease {
                id,
                route: Some(route),
                ..
            }) => (*id, route.clone()),
            _ => return Err(RelayError::NotActive.into()),
        };
        if let Some(timer) = inner.idle_timer.take() {
            timer.cancel();
        }
        inner.holders.insert(holder);
        Ok(LeaseHandle {
            lease_id,
            generation: inner.generation,
            holder,
            route,
        })
    }

    fn set_state(&self, inner: &mut LeaseInner, state: LeaseState) {
        if inner.state == state {
            return;
        }
        inner.state = state;
        self.shared.state_tx.send_replace(state);
        let _ = self.shared.event_tx.send(Event::RelayStateChanged {
            state,
            lease_id: inner.lease.as_ref().map(|l| l.id),
        });
    }

    fn alert(&self, kind: &str, message: String) {
        let _ = self.shared.event_tx.send(Event::RelayAlert {
            kind: kind.to_string(),
            message,
        });
    }

    fn arm_idle_timer(&self, inner: &mut LeaseInner) {
        if let Some(timer) = inner.idle_timer.take() {
            timer.cancel();
        }
        let token = CancellationToken::new();
        inner.idle_timer = Some(token.clone());

        let generation = inner.generation;
        let idle = self.shared.config.idle_timeout;
        let manager = self.clone();
        tracing::debug!(idle_secs = idle.as_secs(), "relay idle timer armed");

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(idle) => manager.on_idle_timeout(generation, token).await,
            }
        });
    }

    async fn on_idle_timeout(&self, generation: u64, token: CancellationToken) {
        let lease = {
            let mut inner = self.lock();
            let still_idle = inner.generation == generation
                && !token.is_cancelled()
                && inner.state == LeaseState::Active
                && inner.holders.is_empty()
                && inner.waiters == 0;
            if !still_idle {
                return;
            }
            inner.idle_timer = None;
            self.set_state(&mut inner, LeaseState::Destroying);
            inner.lease.take()
        };

        let Some(lease) = lease else {
            return;
        };
        tracing::info!(lease_id = %lease.id, "relay idle; destroying");
        self.destroy_lease(&lease, None).await;

        let mut inner = self.lock();
        if inner.generation == generation {
            self.set_state(&mut inner, LeaseState::Absent);
        }
    }

    fn begin_provision(
        &self,
        inner: &mut LeaseInner,
    ) -> watch::Receiver<Option<ProvisionOutcome>> {
        inner.generation += 1;
        let (tx, rx) = watch::channel(None);
        let outcome = Arc::new(tx);
        let cancel = CancellationToken::new();
        inner.provision = Some(ProvisionSlot {
            cancel: cancel.clone(),
            outcome: outcome.clone(),
        });
        inner.lease = None;
        self.set_state(inner, LeaseState::Provisioning);

        let generation = inner.generation;
        let manager = self.clone();
        tokio::spawn(async move {
            manager.provision(generation, cancel, outcome).await;
        });
        rx
    }

    async fn provision(
        &self,
        generation: u64,
        cancel: CancellationToken,
        outcome: Arc<watch::Sender<Option<ProvisionOutcome>>>,
    ) {
        let config = &self.shared.config;
        let created_at = Utc::now();

        let lease_id = match self
            .shared
            .db
            .insert_lease(&NewLease {
                region: config.region.clone(),
                instance_type: config.instance_type.clone(),
                hourly_rate: config.hourly_rate,
                created_at: created_at.timestamp(),
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let error = RelayError::ProvisionFailed {
                    reason: format!("could not open ledger entry: {e}"),
                };
                self.fail_before_instance(generation, None, error, &outcome)
                    .await;
                return;
            }
        };

        let current = {
            let mut inner = self.lock();
            let current = inner.generation == generation;
            if current {
                inner.lease = Some(LiveLease {
                    id: lease_id,
                    instance_id: None,
                    route: None,
                    created_at,
                    ready_at: None,
                });
            }
            current
        };
        if !current {
            self.close_unused_lease(lease_id, "cancelled before creation")
                .await;
            return;
        }

        let label = format!("{}{}", config.label_prefix, lease_id);
        let password = random_secret(24);
        let spec = InstanceSpec {
            label: label.clone(),
            region: config.region.clone(),
            instance_type: config.instance_type.clone(),
            image: config.image.clone(),
            root_pass: random_secret(32),
            user_data: bootstrap::user_data(config, &password),
        };

        tracing::info!(lease_id = %lease_id, label = %label, region = %config.region, "provisioning relay");

        // Not cancellable: once the provider has the request, the instance may exist
        let instance = match self.shared.provider.create_instance(&spec).await {
            Ok(instance) => instance,
            Err(e) => {
                tracing::error!(lease_id = %lease_id, error = %e, "relay instance creation failed");
                let error = RelayError::ProvisionFailed {
                    reason: e.task_detail(),
                };
                if creation_outcome_unknown(&e)
                    && self
                        .claim_leaked_instance(lease_id, &label, &password, created_at)
                        .await
                {
                    self.finish_failed_provision(generation, error, &outcome);
                } else {
                    self.fail_before_instance(generation, Some(lease_id), error, &outcome)
                        .await;
                }
                return;
            }
        };

        if let Err(e) = self
            .shared
            .db
            .set_lease_instance(lease_id, &instance.id, &label, &password)
            .await
        {
            tracing::warn!(lease_id = %lease_id, error = %e, "failed to record relay instance");
        }

        let stale = {
            let mut inner = self.lock();
            let stale = inner.generation != generation || cancel.is_cancelled();
            if !stale && let Some(lease) = inner.lease.as_mut() {
                lease.instance_id = Some(instance.id.clone());
            }
            stale
        };
        if stale {
            tracing::warn!(lease_id = %lease_id, instance_id = %instance.id, "relay created after cancellation; deleting");
            let lease = LiveLease {
                id: lease_id,
                instance_id: Some(instance.id.clone()),
                route: None,
                created_at,
                ready_at: None,
            };
            self.destroy_lease(&lease, Some("cancelled during creation"))
                .await;
            self.finish_failed_provision(generation, RelayError::Cancelled, &outcome);
            return;
        }

        let result = self.bring_up(instance, &password, &cancel).await;

        match result {
            Ok((route, report)) => {
                let ready_at = Utc::now();
                if let Err(e) = self
                    .shared
                    .db
                    .set_lease_active(lease_id, &route.address, ready_at.timestamp())
                    .await
                {
                    tracing::warn!(lease_id = %lease_id, error = %e, "failed to mark lease active");
                }

                let mut inner = self.lock();
                if inner.generation != generation {
                    // An emergency destroy took the lease and deletes the instance
                    return;
                }
                if let Some(lease) = inner.lease.as_mut() {
                    lease.route = Some(route.clone());
                    lease.ready_at = Some(ready_at);
                }
                inner.provision = None;
                self.set_state(&mut inner, LeaseState::Active);
                outcome.send_replace(Some(Ok(())));
                if inner.waiters == 0 && inner.holders.is_empty() {
                    self.arm_idle_timer(&mut inner);
                }

                tracing::info!(
                    lease_id = %lease_id,
                    address = %route.address,
                    egress_ip = %report.egress_ip,
                    boot_secs = (ready_at - created_at).num_seconds(),
                    "relay active"
                );
            }
            Err(error) => {
                tracing::error!(lease_id = %lease_id, error = %error, "relay provisioning failed");
                let lease = {
                    let mut inner = self.lock();
                    if inner.generation != generation {
                        return;
                    }
                    inner.provision = None;
                    outcome.send_replace(Some(Err(error.clone())));
                    self.set_state(&mut inner, LeaseState::Destroying);
                    inner.lease.take()
                };
                if let Some(lease) = lease {
                    self.destroy_lease(&lease, Some(&error.to_string())).await;
                }
                let mut inner = self.lock();
                if inner.generation == generation {
                    self.set_state(&mut inner, LeaseState::Absent);
                }
            }
        }
    }

    /// Wait for the instance to run, then for the relay to pass its probe
    async fn bring_up(
        &self,
        mut instance: ProviderInstance,
        password: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<(RelayRoute, ProbeReport), RelayError> {
        let config = &self.shared.config;

        let boot = async {
            while !instance.is_ready() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                    _ = tokio::time::sleep(config.provider_poll_interval) => {}
                }
                match self.shared.provider.get_instance(&instance.id).await {
                    Ok(Some(current)) => {
                        tracing::debug!(instance_id = %current.id, status = ?current.status, "waiting for relay to boot");
                        instance = current;
                    }
                    Ok(None) => {
                        return Err(RelayError::ProvisionFailed {
                            reason: format!("instance {} disappeared while booting", instance.id),
                        });
                    }
                    Err(e) => {
                        tracing::warn!(instance_id = %instance.id, error = %e, "instance status poll failed");
                    }
                }
            }
            Ok(())
        };
        let booted = tokio::time::timeout(config.provision_timeout, boot).await;
        match booted {
            Ok(result) => result?,
            Err(_) => {
                return Err(RelayError::ProvisionFailed {
                    reason: format!(
                        "instance not running after {}s",
                        config.provision_timeout.as_secs()
                    ),
                });
            }
        }

        let route = RelayRoute {
            address: instance.ipv4.clone().unwrap_or_default(),
            port: config.relay_port,
            username: config.relay_user.clone(),
            password: password.to_string(),
        };

        let mut last_failure = String::from("no probe attempted");
        let probing = async {
            loop {
                match self.shared.probe.probe(&route).await {
                    Ok(report) => return Ok(report),
                    Err(e) => {
                        tracing::debug!(address = %route.address, error = %e, "relay not healthy yet");
                        last_failure = e.to_string();
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                    _ = tokio::time::sleep(config.probe_interval) => {}
                }
            }
        };
        let probed = tokio::time::timeout(config.probe_timeout, probing).await;
        let report = match probed {
            Ok(result) => result?,
            Err(_) => {
                return Err(RelayError::HealthCheckFailed {
                    address: route.endpoint(),
                    reason: last_failure,
                });
            }
        };

        Ok((route, report))
    }

    async fn fail_before_instance(
        &self,
        generation: u64,
        lease_id: Option<LeaseId>,
        error: RelayError,
        outcome: &watch::Sender<Option<ProvisionOutcome>>,
    ) {
        if let Some(id) = lease_id
            && let Err(e) = self
                .shared
                .db
                .close_lease(
                    id,
                    lease_status::FAILED,
                    Some(Utc::now().timestamp()),
                    0,
                    Some(&error.to_string()),
                )
                .await
        {
            tracing::warn!(lease_id = %id, error = %e, "failed to close lease");
        }
        self.finish_failed_provision(generation, error, outcome);
    }

    fn finish_failed_provision(
        &self,
        generation: u64,
        error: RelayError,
        outcome: &watch::Sender<Option<ProvisionOutcome>>,
    ) {
        let mut inner = self.lock();
        outcome.send_replace(Some(Err(error)));
        if inner.generation != generation {
            return;
        }
        inner.provision = None;
        inner.lease = None;
        self.set_state(&mut inner, LeaseState::Absent);
    }

    /// Find an instance the provider made although creation reported an error
    ///
    /// A match is written to the ledger as destroy-pending, raises a
    /// `provision_leak` alert and joins the orphan list. Returns false when
    /// nothing was found or the lookup failed; the maintenance sweep covers the
    /// latter.
    async fn claim_leaked_instance(
        &self,
        lease_id: LeaseId,
        label: &str,
        password: &str,
        created_at: DateTime<Utc>,
    ) -> bool {
        let db = &self.shared.db;
        let leaked: Vec<ProviderInstance> = match self.shared.provider.list_instances(label).await {
            Ok(instances) => instances.into_iter().filter(|i| i.label == label).collect(),
            Err(e) => {
                tracing::warn!(lease_id = %lease_id, label = %label, error = %e, "could not check for a half-created relay");
                return false;
            }
        };
        if leaked.is_empty() {
            return false;
        }

        for instance in leaked {
            tracing::error!(lease_id = %lease_id, instance_id = %instance.id, "relay instance exists despite failed creation");
            let message = format!(
                "relay instance {} was created although the provider reported an error; deleting it",
                instance.id
            );
            if let Err(e) = db
                .set_lease_instance(lease_id, &instance.id, label, password)
                .await
            {
                tracing::warn!(lease_id = %lease_id, error = %e, "failed to record relay instance");
            }
            let minutes = self.shared.accountant.minutes(created_at, Utc::now());
            if let Err(e) = db
                .close_lease(
                    lease_id,
                    lease_status::DESTROY_PENDING,
                    None,
                    minutes,
                    Some(&message),
                )
                .await
            {
                tracing::warn!(lease_id = %lease_id, error = %e, "failed to record destroy-pending lease");
            }
            if let Err(e) = db
                .insert_alert("provision_leak", &message, Some(&instance.id))
                .await
            {
                tracing::warn!(error = %e, "failed to record relay alert");
            }
            self.alert("provision_leak", message);
            self.register_orphan(Some(lease_id), instance.id, created_at);
        }
        true
    }

    async fn close_unused_lease(&self, lease_id: LeaseId, reason: &str) {
        if let Err(e) = self
            .shared
            .db
            .close_lease(
                lease_id,
                lease_status::FAILED,
                Some(Utc::now().timestamp()),
                0,
                Some(reason),
            )
            .await
        {
            tracing::warn!(lease_id = %lease_id, error = %e, "failed to close lease");
        }
    }

    /// Delete a lease's instance with retries and settle its ledger row
    ///
    /// Returns false if the instance survived and was moved to the orphan list.
    async fn destroy_lease(&self, lease: &LiveLease, last_error: Option<&str>) -> bool {
        let db = &self.shared.db;
        let now = Utc::now();
        let minutes = self.shared.accountant.minutes(lease.created_at, now);

        let Some(instance_id) = lease.instance_id.clone() else {
            self.close_unused_lease(lease.id, last_error.unwrap_or("no instance created"))
                .await;
            return true;
        };

        let deleted = with_retry(&self.shared.config.destroy_retry, || {
            let provider = Arc::clone(&self.shared.provider);
            let id = instance_id.clone();
            async move { provider.delete_instance(&id).await }
        })
        .await;

        match deleted {
            Ok(()) => {
                let now = Utc::now();
                let minutes = self.shared.accountant.minutes(lease.created_at, now);
                if let Err(e) = db
                    .close_lease(
                        lease.id,
                        lease_status::DESTROYED,
                        Some(now.timestamp()),
                        minutes,
                        last_error,
                    )
                    .await
                {
                    tracing::warn!(lease_id = %lease.id, error = %e, "failed to close lease");
                }
                tracing::info!(
                    lease_id = %lease.id,
                    instance_id = %instance_id,
                    billable_minutes = minutes,
                    cost = self.shared.accountant.cost_of(minutes),
                    "relay destroyed"
                );
                true
            }
            Err(e) => {
                let error = RelayError::DestroyFailed {
                    instance_id: instance_id.clone(),
                    reason: e.task_detail(),
                };
                let message = format!("{error}; it may still be billing");
                tracing::error!(lease_id = %lease.id, instance_id = %instance_id, error = %error, "relay destroy failed");

                if let Err(db_err) = db
                    .close_lease(
                        lease.id,
                        lease_status::DESTROY_PENDING,
                        None,
                        minutes,
                        Some(&error.to_string()),
                    )
                    .await
                {
                    tracing::warn!(lease_id = %lease.id, error = %db_err, "failed to record destroy-pending lease");
                }
                if let Err(db_err) = db
                    .insert_alert("destroy_failed", &message, Some(&instance_id))
                    .await
                {
                    tracing::warn!(error = %db_err, "failed to record relay alert");
                }
                self.alert("destroy_failed", message);

                self.lock().orphans.push(Orphan {
                    lease_id: Some(lease.id),
                    instance_id,
                    created_at: lease.created_at,
                });
                false
            }
        }
    }

    /// Delete the relay now, regardless of holders
    ///
    /// Cancels the idle timer and any in-flight provisioning, deletes the
    /// instance, retries every orphan, and leaves the lease ABSENT. The report's
    /// `failed_tasks` lists the tasks that held references.
    pub async fn emergency_destroy(&self) -> EmergencyDestroyReport {
        let (generation, holders, lease) = loop {
            {
                let mut inner = self.lock();
                if inner.state != LeaseState::Destroying {
                    if let Some(timer) = inner.idle_timer.take() {
                        timer.cancel();
                    }
                    if let Some(slot) = inner.provision.take() {
                        slot.cancel.cancel();
                        slot.outcome.send_replace(Some(Err(RelayError::Cancelled)));
                    }
                    inner.generation += 1;
                    let mut holders: Vec<TaskId> = inner.holders.drain().collect();
                    holders.sort();
                    self.set_state(&mut inner, LeaseState::Destroying);
                    let lease = inner.lease.take();
                    break (inner.generation, holders, lease);
                }
            }
            // Let an in-flight idle destroy finish first
            let mut rx = self.subscribe_state();
            let _ = rx.wait_for(|s| *s != LeaseState::Destroying).await;
        };

        tracing::warn!(holders = holders.len(), "emergency relay destroy");

        let mut report = EmergencyDestroyReport {
            failed_tasks: holders,
            ..Default::default()
        };

        if let Some(lease) = lease {
            let instance = lease.instance_id.clone();
            let deleted = self
                .destroy_lease(&lease, Some("emergency destroy"))
                .await;
            if let Some(instance) = instance
                && deleted
            {
                report.destroyed_instances.push(instance);
            }
        }

        let (destroyed, pending) = self.retry_orphans().await;
        report.destroyed_instances.extend(destroyed);
        report.destroy_pending = pending;

        let mut inner = self.lock();
        if inner.generation == generation {
            self.set_state(&mut inner, LeaseState::Absent);
        }
        report
    }

    /// One deletion attempt per orphaned instance
    ///
    /// Returns the instances deleted and those still pending.
    pub async fn retry_orphans(&self) -> (Vec<String>, Vec<String>) {
        let orphans = std::mem::take(&mut self.lock().orphans);
        if orphans.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let db = &self.shared.db;
        let mut destroyed = Vec::new();
        let mut survivors = Vec::new();

        // Deletes are independent; run a few at a time, keeping order
        let provider = &self.shared.provider;
        let outcomes: Vec<(Orphan, Result<()>)> = stream::iter(orphans)
            .map(|orphan| async move {
                let outcome = provider.delete_instance(&orphan.instance_id).await;
                (orphan, outcome)
            })
            .buffered(ORPHAN_DELETE_CONCURRENCY)
            .collect()
            .await;

        for (orphan, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    let now = Utc::now();
                    if let Some(lease_id) = orphan.lease_id {
                        let minutes = self.shared.accountant.minutes(orphan.created_at, now);
                        if let Err(e) = db
                            .close_lease(
                                lease_id,
                                lease_status::DESTROYED,
                                Some(now.timestamp()),
                                minutes,
                                None,
                            )
                            .await
                        {
                            tracing::warn!(lease_id = %lease_id, error = %e, "failed to close lease");
                        }
                    }
                    if let Err(e) = db.resolve_alerts_for_instance(&orphan.instance_id).await {
                        tracing::warn!(error = %e, "failed to resolve relay alerts");
                    }
                    tracing::info!(instance_id = %orphan.instance_id, "orphaned relay instance deleted");
                    destroyed.push(orphan.instance_id);
                }
                Err(e) => {
                    tracing::warn!(instance_id = %orphan.instance_id, error = %e, "orphaned relay instance still not deleted");
                    survivors.push(orphan);
                }
            }
        }

        let pending = survivors.iter().map(|o| o.instance_id.clone()).collect();
        self.lock().orphans.extend(survivors);
        (destroyed, pending)
    }

    /// Track an instance that must be deleted
    ///
    /// Returns false if it was already on the orphan list.
    pub fn register_orphan(
        &self,
        lease_id: Option<LeaseId>,
        instance_id: String,
        created_at: DateTime<Utc>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.orphans.iter().any(|o| o.instance_id == instance_id) {
            return false;
        }
        inner.orphans.push(Orphan {
            lease_id,
            instance_id,
            created_at,
        });
        true
    }

    /// Take over a relay that survived a restart
    ///
    /// Only valid while ABSENT. Returns one handle per holder. With no holders the
    /// idle timer starts immediately.
    pub fn adopt(&self, row: &LeaseRow, address: String, holders: &[TaskId]) -> Result<Vec<LeaseHandle>> {
        let (Some(instance_id), Some(password)) = (row.instance_id.clone(), row.relay_secret.clone())
        else {
            return Err(RelayError::ProvisionFailed {
                reason: format!("lease {} has no instance to adopt", row.id),
            }
            .into());
        };

        let mut inner = self.lock();
        if inner.state != LeaseState::Absent {
            return Err(Error::Other(format!(
                "cannot adopt lease {} while relay is {}",
                row.id, inner.state
            )));
        }

        let route = RelayRoute {
            address,
            port: self.shared.config.relay_port,
            username: self.shared.config.relay_user.clone(),
            password,
        };
        inner.generation += 1;
        inner.lease = Some(LiveLease {
            id: row.lease_id(),
            instance_id: Some(instance_id),
            route: Some(route.clone()),
            created_at: row.created(),
            ready_at: row.ready_at.map(crate::db::timestamp),
        });
        inner.holders = holders.iter().copied().collect();
        self.set_state(&mut inner, LeaseState::Active);

        let handles = holders
            .iter()
            .map(|&holder| LeaseHandle {
                lease_id: row.lease_id(),
                generation: inner.generation,
                holder,
                route: route.clone(),
            })
            .collect();
        if holders.is_empty() {
            self.arm_idle_timer(&mut inner);
        }

        tracing::info!(lease_id = row.id, holders = holders.len(), "adopted surviving relay");
        Ok(handles)
    }

    /// Probe the active relay on demand
    pub async fn proxy_check(&self) -> Result<ProbeReport> {
        let route = {
            let inner = self.lock();
            match (&inner.state, &inner.lease) {
                (
                    LeaseState::Active,
                    Some(LiveLease {
                        route: Some(route),
                        ..
                    }),
                ) => route.clone(),
                _ => return Err(RelayError::NotActive.into()),
            }
        };
        self.shared.probe.probe(&route).await
    }

    /// Persist the live lease's accrued minutes
    pub async fn checkpoint_usage(&self) -> Result<()> {
        let live = {
            let inner = self.lock();
            inner
                .lease
                .as_ref()
                .filter(|l| l.instance_id.is_some())
                .map(|l| (l.id, l.created_at))
        };
        if let Some((id, created_at)) = live {
            let minutes = self.shared.accountant.minutes(created_at, Utc::now());
            self.shared.db.update_lease_minutes(id, minutes).await?;
        }
        Ok(())
    }

    /// Point-in-time view for the dashboard
    pub fn status(&self) -> RelayStatus {
        let inner = self.lock();
        let now = Utc::now();
        let mut holders: Vec<TaskId> = inner.holders.iter().copied().collect();
        holders.sort();

        let mut status = RelayStatus {
            state: inner.state,
            holders,
            destroy_pending: inner.orphans.len(),
            ..Default::default()
        };
        if let Some(lease) = &inner.lease {
            let minutes = if lease.instance_id.is_some() {
                self.shared.accountant.minutes(lease.created_at, now)
            } else {
                0
            };
            status.lease_id = Some(lease.id);
            status.instance_id = lease.instance_id.clone();
            status.address = lease.route.as_ref().map(|r| r.address.clone());
            status.created_at = Some(lease.created_at);
            status.ready_at = lease.ready_at;
            status.uptime_secs = (now - lease.created_at).num_seconds().max(0);
            status.billable_minutes = minutes;
            status.estimated_cost = self.shared.accountant.cost_of(minutes);
        }
        status
    }

    /// Stop timers and provisioning; delete the relay unless downloads still use it
    ///
    /// A relay with holders is left running so the next start can adopt it.
    pub async fn shutdown(&self) {
        let lease = {
            let mut inner = self.lock();
            if let Some(timer) = inner.idle_timer.take() {
                timer.cancel();
            }
            if let Some(slot) = &inner.provision {
                slot.cancel.cancel();
            }
            if inner.state == LeaseState::Active && inner.holders.is_empty() {
                self.set_state(&mut inner, LeaseState::Destroying);
                inner.lease.take()
            } else {
                None
            }
        };

        if let Some(lease) = lease {
            tracing::info!(lease_id = %lease.id, "destroying idle relay for shutdown");
            self.destroy_lease(&lease, None).await;
            let mut inner = self.lock();
            self.set_state(&mut inner, LeaseState::Absent);
            return;
        }

        // A cancelled provisioning run deletes its own instance; give it a moment
        let mut rx = self.subscribe_state();
        let settled = tokio::time::timeout(
            self.shared.config.request_timeout,
            rx.wait_for(|s| *s != LeaseState::Provisioning && *s != LeaseState::Destroying),
        )
        .await;
        if settled.is_err() {
            tracing::warn!("relay still provisioning at shutdown; startup sweep will clean up");
        }
    }
}
