//! Startup reconciliation
//!
//! Runs once before background loops start. The ledger, the provider and the
//! transfer daemon are compared against the task table so that every open
//! lease ends up adopted, closed, or queued for deletion, and every
//! DOWNLOADING task is either monitored again or failed.

use crate::db::{LeaseRow, lease_status};
use crate::error::Result;
use crate::transfer::TransferState;
use crate::types::{Task, TaskId, TaskStatus};
use chrono::Utc;
use std::collections::HashSet;

use super::Orchestrator;

impl Orchestrator {
    /// Reconcile persisted state with the outside world
    pub(crate) async fn recover(&self) -> Result<()> {
        if self.db.was_unclean_shutdown().await? {
            tracing::warn!("previous run did not shut down cleanly; reconciling state");
        }
        self.db.set_clean_start().await?;

        let downloading = self.registry.with_status(TaskStatus::Downloading).await?;
        self.recover_leases(&downloading).await?;
        self.sweep_unknown_instances().await;

        let (destroyed, pending) = self.relay.retry_orphans().await;
        if !destroyed.is_empty() || !pending.is_empty() {
            tracing::info!(
                destroyed = destroyed.len(),
                pending = pending.len(),
                "startup orphan cleanup"
            );
        }

        self.recover_downloads(downloading).await?;

        let confirmed = self.registry.with_status(TaskStatus::Confirmed).await?;
        for task in &confirmed {
            self.dispatch(task.id);
        }

        tracing::info!(
            requeued = confirmed.len(),
            monitored = self.monitor.tracked().len(),
            "recovery complete"
        );
        Ok(())
    }

    /// Decide the fate of every lease the ledger still considers open
    async fn recover_leases(&self, downloading: &[Task]) -> Result<()> {
        for row in self.db.open_leases().await? {
            let lease_id = row.lease_id();
            let Some(instance_id) = row.instance_id.clone() else {
                // Never got as far as creating an instance
                self.db
                    .close_lease(
                        lease_id,
                        lease_status::FAILED,
                        Some(Utc::now().timestamp()),
                        0,
                        Some("interrupted before instance creation"),
                    )
                    .await?;
                continue;
            };

            let instance = match self.provider.get_instance(&instance_id).await {
                Ok(instance) => instance,
                Err(e) => {
                    tracing::warn!(lease_id = %lease_id, instance_id = %instance_id, error = %e, "cannot look up relay instance; scheduling deletion");
                    self.relay
                        .register_orphan(Some(lease_id), instance_id, row.created());
                    continue;
                }
            };

            let Some(instance) = instance else {
                tracing::info!(lease_id = %lease_id, instance_id = %instance_id, "relay instance already gone");
                self.db
                    .close_lease(
                        lease_id,
                        lease_status::DESTROYED,
                        Some(Utc::now().timestamp()),
                        row.billable_minutes,
                        None,
                    )
                    .await?;
                self.db.resolve_alerts_for_instance(&instance_id).await?;
                continue;
            };

            let holders: Vec<TaskId> = downloading
                .iter()
                .filter(|t| t.lease_id == Some(lease_id))
                .map(|t| t.id)
                .collect();

            if row.status == lease_status::ACTIVE
                && instance.is_ready()
                && !holders.is_empty()
                && self.try_adopt(&row, instance.ipv4.clone(), &holders)
            {
                continue;
            }

            tracing::info!(lease_id = %lease_id, instance_id = %instance_id, "relay from previous run is unused; scheduling deletion");
            self.relay
                .register_orphan(Some(lease_id), instance_id, row.created());
        }
        Ok(())
    }

    fn try_adopt(&self, row: &LeaseRow, ipv4: Option<String>, holders: &[TaskId]) -> bool {
        let Some(address) = row.address.clone().or(ipv4) else {
            return false;
        };
        match self.relay.adopt(row, address, holders) {
            Ok(handles) => {
                for handle in handles {
                    self.hold_lease(handle);
                }
                true
            }
            Err(e) => {
                tracing::warn!(lease_id = row.id, error = %e, "could not adopt relay");
                false
            }
        }
    }

    /// Queue for deletion instances carrying our label that the ledger knows nothing about
    ///
    /// Runs at startup and on every maintenance tick. The provider is listed
    /// before the ledger is read, so an instance whose lease closed in between
    /// is looked up again before it is treated as unknown.
    pub(crate) async fn sweep_unknown_instances(&self) {
        let prefix = &self.config.relay.label_prefix;
        let instances = match self.provider.list_instances(prefix).await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::warn!(error = %e, "could not list relay instances for orphan sweep");
                return;
            }
        };
        if instances.is_empty() {
            return;
        }

        let (known_ids, known_labels): (HashSet<String>, HashSet<String>) =
            match self.db.open_leases().await {
                Ok(rows) => (
                    rows.iter().filter_map(|r| r.instance_id.clone()).collect(),
                    rows.iter().map(|r| format!("{prefix}{}", r.id)).collect(),
                ),
                Err(e) => {
                    tracing::warn!(error = %e, "could not read lease ledger for orphan sweep");
                    return;
                }
            };

        for instance in instances {
            if known_ids.contains(&instance.id) || known_labels.contains(&instance.label) {
                continue;
            }
            match self.provider.get_instance(&instance.id).await {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(instance_id = %instance.id, error = %e, "could not re-check relay instance");
                    continue;
                }
            }
            if !self
                .relay
                .register_orphan(None, instance.id.clone(), Utc::now())
            {
                continue;
            }

            tracing::warn!(instance_id = %instance.id, label = %instance.label, "found relay instance missing from ledger");
            let message = format!(
                "instance {} ({}) is not in the lease ledger; deleting it",
                instance.id, instance.label
            );
            if let Err(e) = self
                .db
                .insert_alert("orphan_found", &message, Some(&instance.id))
                .await
            {
                tracing::warn!(error = %e, "failed to record orphan alert");
            }
        }
    }

    /// Resume monitoring or fail each task left DOWNLOADING
    async fn recover_downloads(&self, downloading: Vec<Task>) -> Result<()> {
        if downloading.is_empty() {
            return Ok(());
        }

        let with_transfer: Vec<(TaskId, String)> = downloading
            .iter()
            .filter_map(|t| t.transfer_id.clone().map(|gid| (t.id, gid)))
            .collect();
        let ids: Vec<String> = with_transfer.iter().map(|(_, gid)| gid.clone()).collect();
        let statuses = match self.transfer.statuses(&ids).await {
            Ok(statuses) => Some(statuses),
            Err(e) => {
                tracing::warn!(error = %e, "transfer daemon unreachable during recovery");
                None
            }
        };

        for task in downloading {
            let id = task.id;
            let guard = self.registry.lock(id).await;
            let Some(transfer_id) = task.transfer_id.clone() else {
                self.fail(&guard, "no transfer recorded for download").await?;
                continue;
            };

            let status = statuses.as_ref().and_then(|all| {
                with_transfer
                    .iter()
                    .position(|(task_id, _)| *task_id == id)
                    .and_then(|i| all.get(i))
            });

            match status.map(|s| (s.state, s.error.clone())) {
                Some((TransferState::Complete, _)) => {
                    self.registry.mark_complete(&guard).await?;
                    self.release_lease(id);
                }
                Some((TransferState::Error | TransferState::Removed | TransferState::Missing, error)) => {
                    let detail = error.unwrap_or_else(|| "transfer lost across restart".to_string());
                    self.fail(&guard, &detail).await?;
                }
                Some(_) | None if self.holds_lease(id) => {
                    self.monitor.track(id, &transfer_id);
                }
                Some(_) => {
                    if let Err(e) = self.transfer.remove(&transfer_id).await {
                        tracing::warn!(task_id = %id, error = %e, "failed to remove transfer");
                    }
                    self.fail(&guard, "relay lost across restart").await?;
                }
                None => {
                    self.fail(&guard, "relay lost across restart").await?;
                }
            }
        }
        Ok(())
    }
}
