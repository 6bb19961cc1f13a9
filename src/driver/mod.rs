mod alter_copy;
mod stages;
#[cfg(test)]
mod tests;

use crate::admission::{AdmissionGate, BackupStatus};
use crate::config::BackupConfig;
use crate::error::BackupError;
use crate::hooks::{EngineRegistry, TableFlusher};
use crate::lock::LockManager;
use crate::metrics::{BackupMetrics, MetricsRecorder};
use crate::session::{BackupSession, KillHandle};
use crate::stage::BackupStage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Drives sessions through the backup stages.
///
/// One coordinator exists per server process. It owns the admission state
/// that allows a single backup at a time; creating it is the startup step and
/// dropping it the shutdown step.
pub struct BackupCoordinator {
    config: BackupConfig,
    admission: AdmissionGate,
    locks: Arc<dyn LockManager>,
    flusher: Arc<dyn TableFlusher>,
    engines: EngineRegistry,
    metrics: MetricsRecorder,
}

impl BackupCoordinator {
    pub fn new(
        config: BackupConfig,
        locks: Arc<dyn LockManager>,
        flusher: Arc<dyn TableFlusher>,
    ) -> Result<Self, BackupError> {
        config.validate()?;
        Ok(Self {
            config,
            admission: AdmissionGate::default(),
            locks,
            flusher,
            engines: EngineRegistry::default(),
            metrics: MetricsRecorder::default(),
        })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    pub fn status(&self) -> BackupStatus {
        self.admission.status()
    }

    pub fn metrics(&self) -> BackupMetrics {
        self.metrics.snapshot()
    }

    /// Moves `session` forward to `stage`, running every stage in between.
    ///
    /// `END` is accepted from any position and skips the intermediate
    /// stages. When a handler fails the session is left at the last stage
    /// whose handler completed and the error names the requested stage.
    /// `START` failures are returned unwrapped.
    pub fn advance(
        &self,
        session: &mut BackupSession,
        stage: BackupStage,
    ) -> Result<(), BackupError> {
        let current = session.current_stage;
        let expected = match current {
            BackupStage::Finished => BackupStage::Start,
            other => other.next(),
        };
        if stage == BackupStage::Finished {
            return Err(BackupError::WrongStage {
                expected,
                actual: stage,
            });
        }

        let mut next = match (current, stage) {
            (BackupStage::Finished, BackupStage::Start) => BackupStage::Start,
            (BackupStage::Finished, BackupStage::End) => {
                debug!(session = %session.id(), "no backup to end");
                return Ok(());
            }
            (BackupStage::Finished, _) => return Err(BackupError::NotRunning),
            (_, BackupStage::End) => BackupStage::End,
            (current, requested) if requested <= current => {
                return Err(BackupError::WrongStage {
                    expected,
                    actual: requested,
                });
            }
            (current, _) => current.next(),
        };

        loop {
            session.current_stage = next;
            let started = Instant::now();
            debug!(session = %session.id(), stage = %next, "entering backup stage");
            if let Err(cause) = self.run_stage(session, next) {
                session.current_stage = next.previous();
                self.metrics
                    .stage_failed(matches!(cause, BackupError::LockTimeout { .. }));
                warn!(
                    session = %session.id(),
                    stage = %next,
                    requested = %stage,
                    error = %cause,
                    "backup stage failed"
                );
                if next == BackupStage::Start {
                    return Err(cause);
                }
                return Err(BackupError::StageFailed {
                    stage,
                    cause: Box::new(cause),
                });
            }
            if self.config.log_stage_timings {
                let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
                info!(
                    session = %session.id(),
                    stage = %next,
                    elapsed_us,
                    "backup stage complete"
                );
            }
            if next == stage {
                return Ok(());
            }
            next = next.next();
        }
    }

    /// Tears down whatever backup `session` is running. Safe to call on any
    /// session at any time, including on disconnect.
    pub fn end(&self, session: &mut BackupSession) {
        self.teardown(session);
    }

    /// Cancels the session behind `kill`: an admission wait returns
    /// `Cancelled` and a lock wait returns `LockWaitKilled`.
    pub fn kill(&self, kill: &KillHandle) {
        kill.mark_killed();
        self.admission.wake_all();
        self.locks.wake_waiters();
    }

    fn run_stage(
        &self,
        session: &mut BackupSession,
        stage: BackupStage,
    ) -> Result<(), BackupError> {
        match stage {
            BackupStage::Start => self.start(session),
            BackupStage::Flush => self.flush(session),
            BackupStage::BlockDdl => self.block_ddl(session),
            BackupStage::BlockCommit => self.block_commit(session),
            BackupStage::End => {
                self.teardown(session);
                Ok(())
            }
            BackupStage::Finished => Err(BackupError::Internal(
                "FINISHED has no stage handler".into(),
            )),
        }
    }

    fn lock_timeout(&self, session: &BackupSession) -> Duration {
        session.lock_wait_timeout_or(self.config.lock_wait_timeout())
    }
}
