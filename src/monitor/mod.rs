//! Download monitor
//!
//! Polls the transfer daemon for every tracked download in one batched call per
//! cycle, classifies each result and reports classification changes to the
//! orchestrator. Progress itself goes straight to the event bus.

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::transfer::{TransferDaemon, TransferState, TransferStatus};
use crate::types::{Event, TaskId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Buffer of classification events waiting for the orchestrator
pub const MONITOR_CHANNEL_BUFFER: usize = 256;

/// How a tracked download looks right now
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Queued or connecting; no progress seen yet
    Waiting,
    /// Bytes are arriving
    Active,
    /// No progress for longer than the grace period
    Stalled,
    /// Transfer finished
    Complete,
    /// Transfer failed, was removed, or the daemon forgot it
    Errored,
}

impl Phase {
    /// Complete and errored downloads are dropped from tracking
    pub fn is_final(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Errored)
    }
}

/// What the monitor remembers about one download between polls
#[derive(Clone, Debug)]
pub struct Progress {
    /// Bytes completed at the last observed advance
    pub completed_bytes: u64,
    /// When progress last advanced (or tracking began)
    pub last_advance: Instant,
    /// Classification after the previous poll
    pub phase: Phase,
}

/// Classify one polled status against what was seen before
///
/// A download only becomes stalled once `grace` has passed since its last
/// advance, whether or not it ever started.
pub fn classify(status: &TransferStatus, prev: &Progress, now: Instant, grace: Duration) -> Phase {
    match status.state {
        TransferState::Complete => Phase::Complete,
        TransferState::Error | TransferState::Removed | TransferState::Missing => Phase::Errored,
        TransferState::Active | TransferState::Waiting | TransferState::Paused => {
            if status.completed_bytes > prev.completed_bytes {
                Phase::Active
            } else if now.saturating_duration_since(prev.last_advance) >= grace {
                Phase::Stalled
            } else if prev.phase == Phase::Active {
                Phase::Active
            } else {
                Phase::Waiting
            }
        }
    }
}

fn failure_reason(status: &TransferStatus) -> String {
    match (&status.error, status.state) {
        (Some(message), _) => message.clone(),
        (None, TransferState::Removed) => "transfer removed from daemon".to_string(),
        (None, TransferState::Missing) => "transfer unknown to daemon".to_string(),
        (None, _) => "transfer failed".to_string(),
    }
}

/// Classification change reported to the orchestrator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorEvent {
    /// Task the download belongs to
    pub task_id: TaskId,
    /// Daemon-side transfer id
    pub transfer_id: String,
    /// New classification
    pub kind: MonitorEventKind,
}

/// Payload of a [`MonitorEvent`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitorEventKind {
    /// Progress started, or resumed after a stall
    Active,
    /// No progress within the grace period
    Stalled {
        /// Seconds since the last advance
        stalled_secs: u64,
    },
    /// Transfer finished
    Complete,
    /// Transfer failed
    Errored {
        /// Daemon error or a description of what went missing
        reason: String,
    },
}

struct Tracked {
    transfer_id: String,
    progress: Progress,
}

/// Polls the transfer daemon for downloads the orchestrator handed over
pub struct DownloadMonitor {
    config: MonitorConfig,
    transfer: Arc<dyn TransferDaemon>,
    tracked: Mutex<HashMap<TaskId, Tracked>>,
    monitor_tx: mpsc::Sender<MonitorEvent>,
    event_tx: broadcast::Sender<Event>,
}

impl DownloadMonitor {
    /// Create a monitor and the receiver for its classification events
    pub fn new(
        config: MonitorConfig,
        transfer: Arc<dyn TransferDaemon>,
        event_tx: broadcast::Sender<Event>,
    ) -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (monitor_tx, monitor_rx) = mpsc::channel(MONITOR_CHANNEL_BUFFER);
        let monitor = Self {
            config,
            transfer,
            tracked: Mutex::new(HashMap::new()),
            monitor_tx,
            event_tx,
        };
        (monitor, monitor_rx)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Tracked>> {
        self.tracked.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start watching a download; replaces any earlier registration of the task
    pub fn track(&self, task_id: TaskId, transfer_id: &str) {
        tracing::debug!(task_id = %task_id, transfer_id = %transfer_id, "monitoring download");
        self.lock().insert(
            task_id,
            Tracked {
                transfer_id: transfer_id.to_string(),
                progress: Progress {
                    completed_bytes: 0,
                    last_advance: Instant::now(),
                    phase: Phase::Waiting,
                },
            },
        );
    }

    /// Stop watching a download; returns false if it was not tracked
    pub fn untrack(&self, task_id: TaskId) -> bool {
        self.lock().remove(&task_id).is_some()
    }

    /// Tasks currently watched
    pub fn tracked(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Current classification of a tracked task
    pub fn phase(&self, task_id: TaskId) -> Option<Phase> {
        self.lock().get(&task_id).map(|t| t.progress.phase)
    }

    /// One polling cycle; returns how many classification events were sent
    ///
    /// A daemon that cannot be reached leaves every classification untouched.
    pub async fn poll_once(&self) -> Result<usize> {
        let snapshot: Vec<(TaskId, String)> = self
            .lock()
            .iter()
            .map(|(id, t)| (*id, t.transfer_id.clone()))
            .collect();
        if snapshot.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = snapshot.iter().map(|(_, gid)| gid.clone()).collect();
        let statuses = match self.transfer.statuses(&ids).await {
            Ok(statuses) => statuses,
            Err(e) => {
                tracing::warn!(tracked = snapshot.len(), error = %e, "transfer daemon poll failed");
                return Err(e);
            }
        };

        let now = Instant::now();
        let grace = self.config.stall_grace;
        let mut outgoing = Vec::new();
        {
            let mut tracked = self.lock();
            for ((task_id, transfer_id), status) in snapshot.into_iter().zip(statuses) {
                // Untracked or re-registered while the poll was in flight
                let Some(entry) = tracked.get_mut(&task_id) else {
                    continue;
                };
                if entry.transfer_id != transfer_id {
                    continue;
                }

                let prev = entry.progress.clone();
                let phase = classify(&status, &prev, now, grace);
                if status.completed_bytes > prev.completed_bytes {
                    entry.progress.completed_bytes = status.completed_bytes;
                    entry.progress.last_advance = now;
                    let _ = self.event_tx.send(Event::DownloadProgress {
                        id: task_id,
                        completed_bytes: status.completed_bytes,
                        total_bytes: status.total_bytes,
                        speed_bps: status.speed_bps,
                    });
                }
                entry.progress.phase = phase;

                if phase != prev.phase {
                    let kind = match phase {
                        Phase::Waiting => None,
                        Phase::Active => Some(MonitorEventKind::Active),
                        Phase::Stalled => Some(MonitorEventKind::Stalled {
                            stalled_secs: now
                                .saturating_duration_since(prev.last_advance)
                                .as_secs(),
                        }),
                        Phase::Complete => Some(MonitorEventKind::Complete),
                        Phase::Errored => Some(MonitorEventKind::Errored {
                            reason: failure_reason(&status),
                        }),
                    };
                    if let Some(kind) = kind {
                        tracing::debug!(task_id = %task_id, from = ?prev.phase, to = ?phase, "download classification changed");
                        outgoing.push(MonitorEvent {
                            task_id,
                            transfer_id,
                            kind,
                        });
                    }
                }
                if phase.is_final() {
                    tracked.remove(&task_id);
                }
            }
        }

        let sent = outgoing.len();
        for event in outgoing {
            if self.monitor_tx.send(event).await.is_err() {
                tracing::warn!("monitor event receiver dropped");
                break;
            }
        }
        Ok(sent)
    }

    /// Poll at the configured interval until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Failures are logged inside; the next tick retries
                    let _ = self.poll_once().await;
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("download monitor stopped");
                    break;
                }
            }
        }
    }
}
