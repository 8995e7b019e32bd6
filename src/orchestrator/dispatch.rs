//! Operator decisions and the confirmation worker pool.

use crate::error::{Error, RelayError, Result};
use crate::registry::TaskGuard;
use crate::relay::RelayRoute;
use crate::retry::with_retry;
use crate::storage::Readiness;
use crate::types::{Decision, Task, TaskId, TaskStatus};
use std::sync::atomic::Ordering;

use super::Orchestrator;

impl Orchestrator {
    /// Apply the operator's decision to a PENDING task
    ///
    /// A confirmed task is queued for the worker pool and the call returns
    /// right away with the task in CONFIRMED.
    pub async fn decide(&self, id: TaskId, decision: Decision) -> Result<Task> {
        if decision == Decision::Confirm && !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let guard = self.registry.lock(id).await;
        let task = self.registry.decide(&guard, decision).await?;
        drop(guard);

        if task.status == TaskStatus::Confirmed {
            self.dispatch(id);
        }
        Ok(task)
    }

    /// Queue a CONFIRMED task for the workers
    pub(crate) fn dispatch(&self, id: TaskId) {
        if self.work.tx.send(id).is_err() {
            tracing::warn!(task_id = %id, "work queue closed; task stays CONFIRMED until restart");
        }
    }

    /// Start the worker pool feeding off the work queue
    pub(crate) fn start_dispatcher(&self) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let Some(mut rx) = orchestrator.work.rx.lock().await.take() else {
                tracing::warn!("dispatcher already running");
                return;
            };

            loop {
                let id = tokio::select! {
                    next = rx.recv() => match next {
                        Some(id) => id,
                        None => break,
                    },
                    _ = orchestrator.cancel.cancelled() => break,
                };

                // Blocks while every worker is busy
                let permit = match orchestrator.work.workers.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let worker = orchestrator.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = worker.process_confirmed(id).await {
                        tracing::error!(task_id = %id, error = %e, "confirmation processing failed");
                    }
                });
            }
            tracing::debug!("dispatcher stopped");
        });
    }

    /// Drive one CONFIRMED task to DOWNLOADING, or to ERROR
    ///
    /// The relay is ACTIVE before anything is submitted. Submission and the
    /// transfer both go through it. The task's guard is only held between the
    /// slow steps, so an operator cancel lands promptly; each step re-checks
    /// that the task is still CONFIRMED before going on.
    pub(crate) async fn process_confirmed(&self, id: TaskId) -> Result<()> {
        let Some((guard, task)) = self.still_confirmed(id).await? else {
            return Ok(());
        };
        drop(guard);

        let handle = match self.relay.acquire(id).await {
            Ok(handle) => handle,
            Err(Error::Relay(RelayError::Cancelled))
                if !self.accepting_new.load(Ordering::SeqCst) =>
            {
                tracing::info!(task_id = %id, "relay acquire cancelled by shutdown; task stays CONFIRMED");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "could not obtain relay");
                return self.fail_if_confirmed(id, &e.task_detail()).await;
            }
        };
        let lease_id = handle.lease_id();
        let route = handle.route().clone();
        match self.still_confirmed(id).await {
            // From here on a cancel drops the reference itself
            Ok(Some(_guard)) => self.hold_lease(handle),
            Ok(None) => {
                self.relay.release(&handle);
                return Ok(());
            }
            Err(e) => {
                self.relay.release(&handle);
                return Err(e);
            }
        }

        let submitted = with_retry(&self.config.orchestrator.submit_retry, || {
            let storage = self.storage.clone();
            let uri = task.uri.clone();
            let route = route.clone();
            async move { storage.submit(&uri, &route).await }
        })
        .await;
        let job = match submitted {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "offline submission failed");
                return self.fail_if_confirmed(id, &e.task_detail()).await;
            }
        };

        match self.wait_for_offline_job(id, &job.id, &route).await {
            Ok(()) => {}
            Err(Error::ShuttingDown) => {
                tracing::info!(task_id = %id, offline_task_id = %job.id, "shutdown while waiting on storage; task stays CONFIRMED");
                self.release_lease(id);
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(task_id = %id, offline_task_id = %job.id, error = %e, "offline job did not become ready");
                return self.fail_if_confirmed(id, &e.task_detail()).await;
            }
        }

        let Some((guard, _)) = self.still_confirmed(id).await? else {
            self.release_lease(id);
            return Ok(());
        };

        let name = if job.name.is_empty() {
            task.title.clone()
        } else {
            job.name.clone()
        };
        let transfer_id = match self.transfer.add_download(&job.download_url, &name, &route).await {
            Ok(gid) => gid,
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "transfer daemon refused download");
                self.fail(&guard, &e.task_detail()).await?;
                return Ok(());
            }
        };

        if let Err(e) = self
            .registry
            .mark_downloading(&guard, lease_id, &job.id, &transfer_id)
            .await
        {
            tracing::error!(task_id = %id, error = %e, "failed to record download start");
            self.remove_transfer(id, &transfer_id).await;
            let detail = format!("could not record download start: {}", e.task_detail());
            if let Err(fail_err) = self.fail(&guard, &detail).await {
                tracing::error!(task_id = %id, error = %fail_err, "task left CONFIRMED until restart");
            }
            return Err(e);
        }

        self.monitor.track(id, &transfer_id);
        tracing::info!(
            task_id = %id,
            lease_id = %lease_id,
            offline_task_id = %job.id,
            transfer_id = %transfer_id,
            "download started"
        );
        Ok(())
    }

    /// Lock a task and return it if it is still CONFIRMED
    async fn still_confirmed(&self, id: TaskId) -> Result<Option<(TaskGuard, Task)>> {
        let guard = self.registry.lock(id).await;
        let task = self.registry.get(id).await?;
        if task.status == TaskStatus::Confirmed {
            return Ok(Some((guard, task)));
        }
        tracing::info!(task_id = %id, status = %task.status, "task no longer CONFIRMED; stopping");
        Ok(None)
    }

    /// Fail a task unless something else already moved it on
    async fn fail_if_confirmed(&self, id: TaskId, detail: &str) -> Result<()> {
        match self.still_confirmed(id).await? {
            Some((guard, _)) => self.fail(&guard, detail).await,
            None => {
                self.release_lease(id);
                Ok(())
            }
        }
    }

    /// Poll the storage service until the job's file can be downloaded
    ///
    /// Lookup errors are retried until `storage.ready_timeout`. Returns
    /// [`Error::ShuttingDown`] if the orchestrator stops first.
    async fn wait_for_offline_job(&self, id: TaskId, job_id: &str, route: &RelayRoute) -> Result<()> {
        let config = &self.config.storage;
        let waiting = async {
            loop {
                match self.storage.status(job_id, route).await {
                    Ok(status) => match status.readiness() {
                        Readiness::Ready => return Ok(()),
                        Readiness::Failed => {
                            return Err(Error::Storage(format!(
                                "offline job {job_id} failed in phase {}",
                                status.phase
                            )));
                        }
                        Readiness::Pending => {
                            tracing::debug!(task_id = %id, offline_task_id = %job_id, phase = %status.phase, progress = status.progress, "offline job not ready yet");
                        }
                    },
                    Err(Error::NotFound(_)) => {
                        return Err(Error::Storage(format!(
                            "offline job {job_id} disappeared"
                        )));
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %id, offline_task_id = %job_id, error = %e, "offline job status lookup failed");
                    }
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(Error::ShuttingDown),
                    _ = tokio::time::sleep(config.ready_poll_interval) => {}
                }
            }
        };

        match tokio::time::timeout(config.ready_timeout, waiting).await {
            Ok(result) => result,
            Err(_) => Err(Error::Storage(format!(
                "offline job {job_id} not ready after {}s",
                config.ready_timeout.as_secs()
            ))),
        }
    }

    /// Move a task to ERROR and drop its relay reference
    pub(crate) async fn fail(&self, guard: &TaskGuard, detail: &str) -> Result<()> {
        let result = self.registry.mark_error(guard, detail).await;
        self.release_lease(guard.id());
        result.map(|_| ())
    }
}
