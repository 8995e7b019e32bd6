//! In-memory collaborators for tests

use crate::config::RelayConfig;
use crate::db::Database;
use crate::error::{Error, RelayError, Result};
use crate::relay::{
    HealthProbe, InstanceSpec, InstanceStatus, ProviderInstance, RelayProvider, RelayRoute,
};
use crate::storage::{OfflineJob, OfflineStatus, OfflineStorage};
use crate::transfer::{TransferDaemon, TransferState, TransferStatus};
use crate::types::{ProbeReport, TransferStats};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Throwaway database; keep the file alive as long as the database
pub(crate) async fn temp_db() -> (NamedTempFile, Arc<Database>) {
    let file = NamedTempFile::new().unwrap();
    let db = Database::new(file.path()).await.unwrap();
    (file, Arc::new(db))
}

/// Relay timings short enough for real-time tests
pub(crate) fn fast_relay_config() -> RelayConfig {
    let mut config = RelayConfig {
        idle_timeout: Duration::from_millis(300),
        provision_timeout: Duration::from_secs(2),
        provider_poll_interval: Duration::from_millis(10),
        probe_timeout: Duration::from_millis(500),
        probe_interval: Duration::from_millis(10),
        request_timeout: Duration::from_secs(1),
        ..RelayConfig::default()
    };
    config.destroy_retry.max_attempts = 2;
    config.destroy_retry.initial_delay = Duration::from_millis(5);
    config.destroy_retry.max_delay = Duration::from_millis(10);
    config.destroy_retry.jitter = false;
    config
}

/// Poll until `check` holds or two seconds pass
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[derive(Default)]
pub(crate) struct FakeProvider {
    next_id: AtomicU32,
    pub creates: AtomicUsize,
    pub deletes: AtomicUsize,
    pub fail_create: AtomicBool,
    /// Create the instance but report a client-side timeout
    pub create_then_fail: AtomicBool,
    /// Number of upcoming delete calls that fail with a 503
    pub failing_deletes: AtomicU32,
    /// Polls an instance stays "booting" before it runs
    pub boot_polls: AtomicU32,
    pub create_delay: Mutex<Option<Duration>>,
    pub instances: Mutex<HashMap<String, (ProviderInstance, u32)>>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn live(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.instances.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pretend an instance exists that we never created in this process
    pub fn seed(&self, id: &str, label: &str) {
        let instance = ProviderInstance {
            id: id.to_string(),
            label: label.to_string(),
            status: InstanceStatus::Running,
            ipv4: Some("203.0.113.50".into()),
        };
        self.instances
            .lock()
            .unwrap()
            .insert(id.to_string(), (instance, 0));
    }
}

#[async_trait]
impl RelayProvider for FakeProvider {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<ProviderInstance> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Relay(RelayError::Provider {
                status: Some(400),
                message: "quota exceeded".into(),
            }));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let instance = ProviderInstance {
            id: format!("i-{n}"),
            label: spec.label.clone(),
            status: InstanceStatus::Provisioning,
            ipv4: Some(format!("203.0.113.{n}")),
        };
        let polls = self.boot_polls.load(Ordering::SeqCst);
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), (instance.clone(), polls));
        if self.create_then_fail.load(Ordering::SeqCst) {
            return Err(Error::Relay(RelayError::Provider {
                status: None,
                message: "operation timed out".into(),
            }));
        }
        Ok(instance)
    }

    async fn get_instance(&self, id: &str) -> Result<Option<ProviderInstance>> {
        let mut instances = self.instances.lock().unwrap();
        Ok(instances.get_mut(id).map(|(instance, polls)| {
            if *polls == 0 {
                instance.status = InstanceStatus::Running;
            } else {
                *polls -= 1;
                instance.status = InstanceStatus::Booting;
            }
            instance.clone()
        }))
    }

    async fn delete_instance(&self, id: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_deletes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_deletes.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Relay(RelayError::Provider {
                status: Some(503),
                message: "service unavailable".into(),
            }));
        }
        self.instances.lock().unwrap().remove(id);
        Ok(())
    }

    async fn list_instances(&self, label_prefix: &str) -> Result<Vec<ProviderInstance>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|(i, _)| i.label.starts_with(label_prefix))
            .map(|(i, _)| i.clone())
            .collect())
    }
}

pub(crate) struct FakeProbe {
    pub healthy: AtomicBool,
    pub probes: AtomicUsize,
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, route: &RelayRoute) -> Result<ProbeReport> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(ProbeReport {
                egress_ip: route.address.clone(),
                latency_ms: 12,
            })
        } else {
            Err(Error::Relay(RelayError::HealthCheckFailed {
                address: route.endpoint(),
                reason: "connection refused".into(),
            }))
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeStorage {
    pub submissions: Mutex<Vec<String>>,
    /// URIs containing this text are rejected
    pub reject_containing: Mutex<Option<String>>,
    pub fail_transient: AtomicBool,
    /// Status lookups that report the job still running
    pub pending_polls: AtomicU32,
    /// Jobs end up failed on the storage side
    pub fail_jobs: AtomicBool,
    pub status_calls: AtomicUsize,
}

impl FakeStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl OfflineStorage for FakeStorage {
    async fn submit(&self, uri: &str, _route: &RelayRoute) -> Result<OfflineJob> {
        if self.fail_transient.load(Ordering::SeqCst) {
            return Err(Error::Storage("submission failed with 503: busy".into()));
        }
        let reject = self.reject_containing.lock().unwrap().clone();
        if let Some(pattern) = reject
            && uri.contains(&pattern)
        {
            return Err(Error::SubmissionRejected {
                uri: uri.to_string(),
                reason: "resource is filtered".into(),
            });
        }

        let mut submissions = self.submissions.lock().unwrap();
        submissions.push(uri.to_string());
        let n = submissions.len();
        Ok(OfflineJob {
            id: format!("off-{n}"),
            name: format!("file-{n}.bin"),
            download_url: format!("https://cdn.example/file-{n}.bin"),
        })
    }

    async fn status(&self, id: &str, _route: &RelayRoute) -> Result<OfflineStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.pending_polls.load(Ordering::SeqCst);
        let (phase, progress) = if pending > 0 {
            self.pending_polls.store(pending - 1, Ordering::SeqCst);
            ("running", 0.5)
        } else if self.fail_jobs.load(Ordering::SeqCst) {
            ("failed", 0.0)
        } else {
            ("done", 1.0)
        };
        Ok(OfflineStatus {
            id: id.to_string(),
            phase: phase.into(),
            progress,
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeTransfer {
    next: AtomicU32,
    pub unreachable: AtomicBool,
    pub transfers: Mutex<HashMap<String, TransferStatus>>,
    pub removed: Mutex<Vec<String>>,
    pub proxies: Mutex<Vec<String>>,
}

impl FakeTransfer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, id: &str, state: TransferState, completed: u64, total: u64) {
        let mut transfers = self.transfers.lock().unwrap();
        let entry = transfers
            .entry(id.to_string())
            .or_insert_with(|| TransferStatus::missing(id));
        entry.state = state;
        entry.completed_bytes = completed;
        entry.total_bytes = total;
        entry.error = (state == TransferState::Error).then(|| "network failure".to_string());
    }

    pub fn forget(&self, id: &str) {
        self.transfers.lock().unwrap().remove(id);
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.transfers.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn unreachable_error() -> Error {
    Error::Transfer("aria2.tellStatus: connection refused".into())
}

#[async_trait]
impl TransferDaemon for FakeTransfer {
    async fn add_download(&self, _url: &str, _name: &str, route: &RelayRoute) -> Result<String> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(unreachable_error());
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let gid = format!("gid-{n}");
        let mut status = TransferStatus::missing(&gid);
        status.state = TransferState::Waiting;
        self.transfers.lock().unwrap().insert(gid.clone(), status);
        self.proxies.lock().unwrap().push(route.proxy_url());
        Ok(gid)
    }

    async fn statuses(&self, ids: &[String]) -> Result<Vec<TransferStatus>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(unreachable_error());
        }
        let transfers = self.transfers.lock().unwrap();
        Ok(ids
            .iter()
            .map(|id| {
                transfers
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| TransferStatus::missing(id))
            })
            .collect())
    }

    async fn global_stats(&self) -> Result<TransferStats> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(unreachable_error());
        }
        let transfers = self.transfers.lock().unwrap();
        Ok(TransferStats {
            num_active: transfers
                .values()
                .filter(|t| t.state == TransferState::Active)
                .count() as u64,
            ..TransferStats::default()
        })
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.removed.lock().unwrap().push(id.to_string());
        if let Some(t) = self.transfers.lock().unwrap().get_mut(id) {
            t.state = TransferState::Removed;
        }
        Ok(())
    }
}
