//! Background loops and shutdown coordination.

use crate::error::Result;
use crate::types::Event;
use std::sync::atomic::Ordering;

use super::Orchestrator;

impl Orchestrator {
    /// Start the worker pool, the download monitor and relay maintenance
    ///
    /// Call once after construction. Loops run until [`Orchestrator::shutdown`].
    pub fn start(&self) {
        self.start_dispatcher();
        self.start_monitor_consumer();

        let monitor = self.monitor.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { monitor.run(cancel).await });

        self.start_maintenance();
        tracing::info!(
            workers = self.config.orchestrator.workers,
            poll_interval_ms = self.config.monitor.poll_interval.as_millis() as u64,
            "orchestrator started"
        );
    }

    /// Periodically delete stray relay instances and checkpoint the live lease's minutes
    fn start_maintenance(&self) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(orchestrator.config.orchestrator.maintenance_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        orchestrator.sweep_unknown_instances().await;
                        let (destroyed, pending) = orchestrator.relay.retry_orphans().await;
                        if !destroyed.is_empty() {
                            tracing::info!(destroyed = destroyed.len(), pending = pending.len(), "orphaned relays cleaned up");
                        }
                        if let Err(e) = orchestrator.relay.checkpoint_usage().await {
                            tracing::warn!(error = %e, "failed to checkpoint relay usage");
                        }
                    }
                    _ = orchestrator.cancel.cancelled() => {
                        tracing::debug!("maintenance loop stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Gracefully shut down the orchestrator
    ///
    /// 1. Stops accepting confirmations and stops background loops
    /// 2. Waits up to `orchestrator.shutdown_timeout` for in-flight confirmations
    /// 3. Deletes the relay if nothing holds it (a busy relay is adopted on next start)
    /// 4. Marks the shutdown clean
    ///
    /// Tasks stay where they are: CONFIRMED tasks are re-queued and DOWNLOADING
    /// tasks are re-monitored on the next start.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.accepting_new.store(false, Ordering::SeqCst);
        self.cancel.cancel();

        let workers = u32::try_from(self.config.orchestrator.workers).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(
            self.config.orchestrator.shutdown_timeout,
            self.work.workers.acquire_many(workers),
        )
        .await;
        match drained {
            Ok(Ok(_permits)) => tracing::info!("in-flight confirmations finished"),
            Ok(Err(_)) => tracing::warn!("worker pool closed during shutdown"),
            Err(_) => tracing::warn!("timeout waiting for in-flight confirmations, proceeding with shutdown"),
        }

        if let Err(e) = self.relay.checkpoint_usage().await {
            tracing::warn!(error = %e, "failed to checkpoint relay usage during shutdown");
        }
        self.relay.shutdown().await;

        if let Err(e) = self.db.set_clean_shutdown().await {
            tracing::error!(error = %e, "Failed to mark clean shutdown in database");
        }

        self.emit(Event::Shutdown);
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}
