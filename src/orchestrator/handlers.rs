//! Monitor events and operator actions.

use crate::config::StallPolicy;
use crate::cost::month_start;
use crate::error::{Error, Result, TaskError};
use crate::monitor::{MonitorEvent, MonitorEventKind};
use crate::types::{
    Channel, DashboardSnapshot, EmergencyDestroyReport, Event, ProbeReport, RelayAlert,
    RelayStatus, Task, TaskId, TaskStatus,
};
use chrono::Utc;
use std::collections::BTreeSet;

use super::Orchestrator;

impl Orchestrator {
    /// Consume classification events from the download monitor
    pub(crate) fn start_monitor_consumer(&self) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let Some(mut rx) = orchestrator.monitor_rx.lock().await.take() else {
                tracing::warn!("monitor consumer already running");
                return;
            };

            loop {
                tokio::select! {
                    next = rx.recv() => match next {
                        Some(event) => {
                            let id = event.task_id;
                            if let Err(e) = orchestrator.handle_monitor_event(event).await {
                                tracing::error!(task_id = %id, error = %e, "failed to handle monitor event");
                            }
                        }
                        None => break,
                    },
                    _ = orchestrator.cancel.cancelled() => break,
                }
            }
            tracing::debug!("monitor consumer stopped");
        });
    }

    /// Apply one download classification change to its task
    ///
    /// Events for tasks that left DOWNLOADING, or that now point at a
    /// different transfer, are dropped.
    pub(crate) async fn handle_monitor_event(&self, event: MonitorEvent) -> Result<()> {
        let id = event.task_id;
        let guard = self.registry.lock(id).await;
        let task = self.registry.get(id).await?;
        if task.status != TaskStatus::Downloading
            || task.transfer_id.as_deref() != Some(event.transfer_id.as_str())
        {
            tracing::debug!(task_id = %id, status = %task.status, "ignoring stale monitor event");
            return Ok(());
        }

        match event.kind {
            MonitorEventKind::Complete => {
                self.registry.mark_complete(&guard).await?;
                self.release_lease(id);
                tracing::info!(task_id = %id, "download complete");
            }
            MonitorEventKind::Errored { reason } => {
                tracing::warn!(task_id = %id, reason = %reason, "download failed");
                self.fail(&guard, &reason).await?;
            }
            MonitorEventKind::Stalled { stalled_secs } => {
                self.emit(Event::DownloadStalled { id, stalled_secs });
                self.registry
                    .note(&guard, "stalled", Some(&format!("no progress for {stalled_secs}s")))
                    .await?;

                match self.config.monitor.stall_policy {
                    StallPolicy::Fail => {
                        tracing::warn!(task_id = %id, stalled_secs, "download stalled; failing task");
                        self.monitor.untrack(id);
                        self.remove_transfer(id, &event.transfer_id).await;
                        let detail = TaskError::Stalled {
                            id: id.get(),
                            stalled_secs,
                        }
                        .to_string();
                        self.fail(&guard, &detail).await?;
                    }
                    StallPolicy::Surface => {
                        tracing::warn!(task_id = %id, stalled_secs, "download stalled");
                    }
                }
            }
            MonitorEventKind::Active => {
                self.registry.note(&guard, "active", None).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn remove_transfer(&self, id: TaskId, transfer_id: &str) {
        if let Err(e) = self.transfer.remove(transfer_id).await {
            tracing::warn!(task_id = %id, transfer_id = %transfer_id, error = %e, "failed to remove transfer");
        }
    }

    /// Operator cancel of a CONFIRMED or DOWNLOADING task
    pub async fn cancel(&self, id: TaskId) -> Result<Task> {
        let guard = self.registry.lock(id).await;
        let task = self.registry.get(id).await?;
        match task.status {
            TaskStatus::Downloading => {
                self.monitor.untrack(id);
                if let Some(transfer_id) = &task.transfer_id {
                    self.remove_transfer(id, transfer_id).await;
                }
                let result = self.registry.mark_error(&guard, "cancelled by operator").await;
                self.release_lease(id);
                result
            }
            TaskStatus::Confirmed => {
                let result = self.registry.mark_error(&guard, "cancelled by operator").await;
                self.release_lease(id);
                result
            }
            from => Err(TaskError::InvalidTransition {
                id: id.get(),
                from,
                to: TaskStatus::Error,
            }
            .into()),
        }
    }

    /// Delete the relay now and fail every task that depended on it
    ///
    /// DOWNLOADING tasks and CONFIRMED tasks that already held a reference
    /// move to ERROR. CONFIRMED tasks still waiting on provisioning fail
    /// through their cancelled acquire.
    pub async fn emergency_destroy(&self) -> EmergencyDestroyReport {
        let mut report = self.relay.emergency_destroy().await;

        let mut targets: BTreeSet<TaskId> = report.failed_tasks.iter().copied().collect();
        let holders = targets.clone();
        match self.registry.with_status(TaskStatus::Downloading).await {
            Ok(tasks) => targets.extend(tasks.into_iter().map(|t| t.id)),
            Err(e) => tracing::error!(error = %e, "failed to list downloading tasks"),
        }

        let mut failed = Vec::new();
        for id in targets {
            let guard = self.registry.lock(id).await;
            let task = match self.registry.get(id).await {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(task_id = %id, error = %e, "task vanished during emergency destroy");
                    continue;
                }
            };
            let affected = task.status == TaskStatus::Downloading
                || (task.status == TaskStatus::Confirmed && holders.contains(&id));
            // Handles are stale after the destroy; just forget them
            self.leases().remove(&id);
            if !affected {
                continue;
            }

            self.monitor.untrack(id);
            if let Some(transfer_id) = &task.transfer_id {
                self.remove_transfer(id, transfer_id).await;
            }
            match self.registry.mark_error(&guard, "relay destroyed by operator").await {
                Ok(_) => failed.push(id),
                Err(e) => tracing::error!(task_id = %id, error = %e, "failed to fail task"),
            }
        }

        report.failed_tasks = failed;
        tracing::warn!(
            failed_tasks = report.failed_tasks.len(),
            destroyed = report.destroyed_instances.len(),
            pending = report.destroy_pending.len(),
            "emergency destroy finished"
        );
        self.emit(Event::EmergencyDestroy {
            failed_tasks: report.failed_tasks.clone(),
        });
        report
    }

    /// Aggregated view for the operator dashboard
    ///
    /// An unreachable transfer daemon leaves `transfer` empty rather than
    /// failing the whole snapshot.
    pub async fn dashboard(&self) -> Result<DashboardSnapshot> {
        let counts = self.registry.counts().await?;
        let relay = self.relay.status();
        let transfer = match self.transfer.global_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::debug!(error = %e, "transfer daemon unavailable for dashboard");
                None
            }
        };
        let alerts = self.db.open_alerts().await?;

        let since = month_start(Utc::now());
        let (mut monthly_minutes, mut monthly_cost) = self
            .db
            .lease_usage_since(since.timestamp(), relay.lease_id)
            .await?;
        if relay.created_at.is_some_and(|created| created >= since) {
            monthly_minutes += relay.billable_minutes;
            monthly_cost += relay.estimated_cost;
        }

        Ok(DashboardSnapshot {
            counts,
            relay,
            transfer,
            monthly_cost,
            monthly_minutes,
            alerts,
        })
    }

    /// Current relay lease view
    pub fn relay_status(&self) -> RelayStatus {
        self.relay.status()
    }

    /// Probe the active relay
    pub async fn proxy_check(&self) -> Result<ProbeReport> {
        self.relay.proxy_check().await
    }

    /// Unresolved alerts
    pub async fn alerts(&self) -> Result<Vec<RelayAlert>> {
        self.db.open_alerts().await
    }

    /// Mark an alert handled
    pub async fn resolve_alert(&self, id: i64) -> Result<()> {
        if self.db.resolve_alert(id).await? {
            Ok(())
        } else {
            Err(Error::NotFound(format!("alert {id}")))
        }
    }

    /// Watched source channels
    pub async fn channels(&self) -> Result<Vec<Channel>> {
        self.db.list_channels().await
    }

    /// Replace the channel list
    pub async fn replace_channels(&self, channels: Vec<Channel>) -> Result<Vec<Channel>> {
        let channels = self.db.replace_channels(channels).await?;
        self.signal_settings_reload().await;
        Ok(channels)
    }

    /// Add one channel
    pub async fn add_channel(&self, channel: Channel) -> Result<Channel> {
        if channel.id.trim().is_empty() {
            return Err(Error::InvalidInput("channel id must not be empty".into()));
        }
        let channel = self.db.add_channel(channel).await?;
        self.signal_settings_reload().await;
        Ok(channel)
    }

    /// Rename or toggle one channel
    pub async fn update_channel(
        &self,
        id: &str,
        name: Option<String>,
        enabled: Option<bool>,
    ) -> Result<Channel> {
        let channel = self.db.update_channel(id, name, enabled).await?;
        self.signal_settings_reload().await;
        Ok(channel)
    }

    /// Stop watching a channel
    pub async fn remove_channel(&self, id: &str) -> Result<()> {
        self.db.remove_channel(id).await?;
        self.signal_settings_reload().await;
        Ok(())
    }

    /// Touch the reload flag the ingestion process watches
    async fn signal_settings_reload(&self) {
        let Some(path) = &self.config.settings.reload_flag_path else {
            return;
        };
        let stamp = Utc::now().to_rfc3339();
        if let Err(e) = tokio::fs::write(path, stamp).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to write settings reload flag");
        }
    }
}
