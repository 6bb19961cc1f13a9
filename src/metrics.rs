use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackupMetrics {
    pub backups_started: u64,
    pub backups_completed: u64,
    pub backups_aborted: u64,
    pub admission_waits: u64,
    pub admission_cancellations: u64,
    pub stage_failures: u64,
    pub lock_timeouts: u64,
    pub advisory_flush_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    backups_started: AtomicU64,
    backups_completed: AtomicU64,
    backups_aborted: AtomicU64,
    admission_waits: AtomicU64,
    admission_cancellations: AtomicU64,
    stage_failures: AtomicU64,
    lock_timeouts: AtomicU64,
    advisory_flush_failures: AtomicU64,
}

impl MetricsRecorder {
    pub(crate) fn backup_started(&self, waited: bool) {
        self.backups_started.fetch_add(1, Ordering::Relaxed);
        if waited {
            self.admission_waits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A teardown counts as completed only when the backup got through
    /// `BLOCK_COMMIT`.
    pub(crate) fn backup_ended(&self, completed: bool) {
        let counter = if completed {
            &self.backups_completed
        } else {
            &self.backups_aborted
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn admission_cancelled(&self) {
        self.admission_cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stage_failed(&self, lock_timeout: bool) {
        self.stage_failures.fetch_add(1, Ordering::Relaxed);
        if lock_timeout {
            self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn advisory_flush_failed(&self) {
        self.advisory_flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BackupMetrics {
        BackupMetrics {
            backups_started: self.backups_started.load(Ordering::Relaxed),
            backups_completed: self.backups_completed.load(Ordering::Relaxed),
            backups_aborted: self.backups_aborted.load(Ordering::Relaxed),
            admission_waits: self.admission_waits.load(Ordering::Relaxed),
            admission_cancellations: self.admission_cancellations.load(Ordering::Relaxed),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            advisory_flush_failures: self.advisory_flush_failures.load(Ordering::Relaxed),
        }
    }
}
