//! Deferred removal of deleted blobs.
//!
//! [`StorageService::delete`](crate::StorageService::delete) only records a [`StorageDelete`]
//! marker. The [`StorageCleanupScheduler`] periodically picks up markers whose grace period has
//! passed and removes the chunks they point to.
//!
//! Only one process of a deployment should run the scheduler. Running it in several processes
//! is still safe, since removing chunks that were already removed is a no-op.

use std::future::Future;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::backend::common::SharedBackend;
use crate::datamodel::StorageDelete;
use crate::error::Result;

/// The default period between two sweeps: 15 minutes.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Outcome of a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Number of deletion markers that were fully processed.
    pub purged: usize,
    /// Number of deletion markers or orphans that failed and remain pending.
    pub failed: usize,
    /// Number of partially written blobs that were removed.
    pub orphans: usize,
    /// `true` if the sweep did not run because another sweep was still in progress.
    pub skipped: bool,
}

/// Periodic sweep that physically removes blobs after their deletion grace period.
#[derive(Debug)]
pub struct StorageCleanupScheduler {
    backend: SharedBackend,
    interval: Duration,
    orphan_ttl: Option<Duration>,
    running: Mutex<()>,
}

impl StorageCleanupScheduler {
    /// Creates a scheduler that sweeps `backend` every `interval`.
    pub fn new(backend: SharedBackend, interval: Duration) -> Self {
        Self {
            backend,
            interval: interval.max(Duration::from_millis(1)),
            orphan_ttl: None,
            running: Mutex::new(()),
        }
    }

    /// Also removes blobs that never received a final chunk and were last written more than
    /// `ttl` ago.
    ///
    /// Such blobs are left behind by writes that failed halfway. This is disabled by default.
    pub fn with_orphan_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.orphan_ttl = ttl;
        self
    }

    /// Returns the period between two sweeps.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs a single sweep, treating `now` as the current time.
    ///
    /// Failures of individual entries are logged and counted in the report. Those entries stay
    /// pending and are retried by the next sweep. Only a failure to list the due deletions fails
    /// the whole sweep.
    pub async fn run_once(&self, now: SystemTime) -> Result<SweepReport> {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::debug!("cleanup sweep already in progress, skipping");
            return Ok(SweepReport {
                skipped: true,
                ..Default::default()
            });
        };

        let start = Instant::now();
        let mut report = SweepReport::default();

        let due = self.backend.due_deletions(now).await?;
        for deletion in due {
            match self.purge(&deletion).await {
                Ok(()) => report.purged += 1,
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        storage_id = %deletion.storage_id,
                        "failed to purge deleted blob"
                    );
                    report.failed += 1;
                }
            }
        }

        if let Some(ttl) = self.orphan_ttl {
            self.sweep_orphans(now, ttl, &mut report).await;
        }

        tracing::info!(
            purged = report.purged,
            failed = report.failed,
            orphans = report.orphans,
            elapsed = ?start.elapsed(),
            backend = self.backend.name(),
            "cleanup sweep finished"
        );
        Ok(report)
    }

    /// Sweeps periodically until `shutdown` resolves.
    ///
    /// The first sweep runs immediately. A sweep in progress is completed before shutting down.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(interval = ?self.interval, "starting cleanup scheduler");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            if let Err(err) = self.run_once(SystemTime::now()).await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "cleanup sweep failed"
                );
            }
        }
        tracing::info!("cleanup scheduler stopped");
    }

    async fn purge(&self, deletion: &StorageDelete) -> Result<()> {
        let removed = self.backend.delete_chunks(&deletion.storage_id).await?;
        self.backend.delete_deletion(&deletion.id).await?;
        tracing::debug!(storage_id = %deletion.storage_id, removed, "purged deleted blob");
        Ok(())
    }

    async fn sweep_orphans(&self, now: SystemTime, ttl: Duration, report: &mut SweepReport) {
        let Some(cutoff) = now.checked_sub(ttl) else {
            return;
        };

        let uuids = match self.backend.partial_uuids(cutoff).await {
            Ok(uuids) => uuids,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to list partially written blobs"
                );
                report.failed += 1;
                return;
            }
        };

        for uuid in uuids {
            match self.backend.delete_chunks(&uuid).await {
                Ok(removed) => {
                    tracing::warn!(storage_id = %uuid, removed, "removed partially written blob");
                    report.orphans += 1;
                }
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        storage_id = %uuid,
                        "failed to remove partially written blob"
                    );
                    report.failed += 1;
                }
            }
        }
    }
}
