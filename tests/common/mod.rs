//! Shared harness for swipe-dl integration tests
//!
//! Every external collaborator is replaced by an in-memory implementation of
//! its public trait, so scenarios run without a cloud account, a storage
//! service or an aria2 daemon.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swipe_dl::config::RetryConfig;
use swipe_dl::relay::{
    HealthProbe, InstanceSpec, InstanceStatus, ProviderInstance, RelayProvider, RelayRoute,
};
use swipe_dl::storage::{OfflineJob, OfflineStatus, OfflineStorage};
use swipe_dl::transfer::{TransferDaemon, TransferState, TransferStatus};
use swipe_dl::types::{ProbeReport, TransferStats};
use swipe_dl::{Config, Error, NewTask, Orchestrator, RelayError, Result, Services, Task, TaskId, TaskStatus};
use tempfile::NamedTempFile;

#[derive(Default)]
pub struct Cloud {
    next_id: AtomicU32,
    pub creates: AtomicUsize,
    pub deletes: AtomicUsize,
    pub refuse_create: AtomicBool,
    pub instances: Mutex<HashMap<String, ProviderInstance>>,
}

#[async_trait]
impl RelayProvider for Cloud {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<ProviderInstance> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.refuse_create.load(Ordering::SeqCst) {
            return Err(Error::Relay(RelayError::Provider {
                status: Some(400),
                message: "account limit reached".into(),
            }));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let instance = ProviderInstance {
            id: format!("relay-{n}"),
            label: spec.label.clone(),
            status: InstanceStatus::Provisioning,
            ipv4: Some(format!("198.51.100.{n}")),
        };
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, id: &str) -> Result<Option<ProviderInstance>> {
        let mut instances = self.instances.lock().unwrap();
        Ok(instances.get_mut(id).map(|instance| {
            instance.status = InstanceStatus::Running;
            instance.clone()
        }))
    }

    async fn delete_instance(&self, id: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.instances.lock().unwrap().remove(id);
        Ok(())
    }

    async fn list_instances(&self, label_prefix: &str) -> Result<Vec<ProviderInstance>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.label.starts_with(label_prefix))
            .cloned()
            .collect())
    }
}

pub struct Probe;

#[async_trait]
impl HealthProbe for Probe {
    async fn probe(&self, route: &RelayRoute) -> Result<ProbeReport> {
        Ok(ProbeReport {
            egress_ip: route.address.clone(),
            latency_ms: 5,
        })
    }
}

#[derive(Default)]
pub struct Storage {
    pub submitted: Mutex<Vec<String>>,
}

#[async_trait]
impl OfflineStorage for Storage {
    async fn submit(&self, uri: &str, _route: &RelayRoute) -> Result<OfflineJob> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(uri.to_string());
        let n = submitted.len();
        Ok(OfflineJob {
            id: format!("job-{n}"),
            name: format!("payload-{n}"),
            download_url: format!("https://storage.example/payload-{n}"),
        })
    }

    async fn status(&self, id: &str, _route: &RelayRoute) -> Result<OfflineStatus> {
        Ok(OfflineStatus {
            id: id.to_string(),
            phase: "done".into(),
            progress: 1.0,
        })
    }
}

/// aria2 stand-in; transfers sit in `active` until a test finishes them
#[derive(Default)]
pub struct Daemon {
    next: AtomicU32,
    pub transfers: Mutex<HashMap<String, TransferStatus>>,
}

impl Daemon {
    pub fn finish(&self, gid: &str) {
        if let Some(t) = self.transfers.lock().unwrap().get_mut(gid) {
            t.state = TransferState::Complete;
            t.completed_bytes = t.total_bytes;
        }
    }
}

#[async_trait]
impl TransferDaemon for Daemon {
    async fn add_download(&self, _url: &str, _name: &str, _route: &RelayRoute) -> Result<String> {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let gid = format!("{n:016x}");
        let mut status = TransferStatus::missing(&gid);
        status.state = TransferState::Active;
        status.total_bytes = 1_000;
        status.completed_bytes = 10;
        self.transfers.lock().unwrap().insert(gid.clone(), status);
        Ok(gid)
    }

    async fn statuses(&self, ids: &[String]) -> Result<Vec<TransferStatus>> {
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
        Ok(TransferStats::default())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        if let Some(t) = self.transfers.lock().unwrap().get_mut(id) {
            t.state = TransferState::Removed;
        }
        Ok(())
    }
}

pub struct World {
    _db: NamedTempFile,
    pub orchestrator: Orchestrator,
    pub cloud: Arc<Cloud>,
    pub storage: Arc<Storage>,
    pub daemon: Arc<Daemon>,
}

fn config(db: &NamedTempFile) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = db.path().to_path_buf();
    config.relay.idle_timeout = Duration::from_millis(200);
    config.relay.provision_timeout = Duration::from_secs(2);
    config.relay.provider_poll_interval = Duration::from_millis(10);
    config.relay.probe_interval = Duration::from_millis(10);
    config.relay.probe_timeout = Duration::from_millis(500);
    config.monitor.poll_interval = Duration::from_millis(20);
    config.orchestrator.maintenance_interval = Duration::from_secs(3600);
    config.orchestrator.shutdown_timeout = Duration::from_secs(1);
    config.orchestrator.submit_retry = RetryConfig {
        max_attempts: 1,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(10),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

pub async fn world() -> World {
    let db = NamedTempFile::new().unwrap();
    let cloud = Arc::new(Cloud::default());
    let storage = Arc::new(Storage::default());
    let daemon = Arc::new(Daemon::default());

    let services = Services {
        provider: cloud.clone(),
        probe: Arc::new(Probe),
        storage: storage.clone(),
        transfer: daemon.clone(),
    };
    let orchestrator = Orchestrator::with_services(config(&db), services)
        .await
        .unwrap();
    orchestrator.start();

    World {
        _db: db,
        orchestrator,
        cloud,
        storage,
        daemon,
    }
}

pub fn candidate(uri: &str) -> NewTask {
    NewTask {
        uri: uri.to_string(),
        title: format!("release {uri}"),
        description: None,
        size_bytes: 1_000,
        preview_images: vec![],
        source_chat_id: None,
        source_msg_id: None,
    }
}

pub async fn wait_for(orchestrator: &Orchestrator, id: TaskId, status: TaskStatus) -> Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let task = orchestrator.get_task(id).await.unwrap();
        if task.status == status {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} stuck in {} waiting for {status}",
            task.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `check` holds or three seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
