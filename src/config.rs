use crate::error::BackupError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration for a backup coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Upper bound for every backup lock acquire or upgrade. Sessions may
    /// override it individually.
    pub lock_wait_timeout_ms: u64,
    /// Emit per-stage elapsed time at info level.
    pub log_stage_timings: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout_ms: 86_400_000,
            log_stage_timings: true,
        }
    }
}

impl BackupConfig {
    /// Short lock waits for operator-driven backups where a stuck stage
    /// should surface quickly instead of queueing behind long statements.
    pub fn interactive() -> Self {
        Self {
            lock_wait_timeout_ms: 30_000,
            ..Self::default()
        }
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_stage_timings(mut self, on: bool) -> Self {
        self.log_stage_timings = on;
        self
    }

    pub fn validate(&self) -> Result<(), BackupError> {
        if self.lock_wait_timeout_ms == 0 {
            return Err(BackupError::InvalidConfig {
                message: "lock_wait_timeout_ms must be > 0".into(),
            });
        }
        Ok(())
    }
}
