use super::BackupCoordinator;
use crate::admission::Admitted;
use crate::error::BackupError;
use crate::hooks::{FlushFilter, FlushOutcome};
use crate::lock::{BackupLockMode, LockContext};
use crate::session::{BackupSession, SessionId};
use crate::stage::BackupStage;
use tracing::{debug, info, warn};

impl BackupCoordinator {
    /// Waits for any previous backup to finish, then lets engines prepare
    /// (block redo purge, optionally checkpoint).
    pub(super) fn start(&self, session: &mut BackupSession) -> Result<(), BackupError> {
        if session.read_only_protected() {
            return Err(BackupError::ReadOnlyProtected);
        }
        if session.locked_tables_mode() {
            return Err(BackupError::ActiveTableLock);
        }

        let kill = session.kill_handle();
        match self.admission.enter(session.id(), &kill) {
            Ok(admitted) => self.metrics.backup_started(admitted == Admitted::AfterWait),
            Err(err) => {
                self.metrics.admission_cancelled();
                return Err(err);
            }
        }
        info!(session = %session.id(), engines = self.engines.len(), "backup started");
        self.engines.prepare_all();
        Ok(())
    }

    /// Takes the backup lock in its weakest mode, which blocks new writes to
    /// non-transactional tables without waiting for running ones, then
    /// flushes unused non-transactional tables.
    pub(super) fn flush(&self, session: &mut BackupSession) -> Result<(), BackupError> {
        debug_assert!(session.flush_lock.is_none());
        let kill = session.kill_handle();
        let ctx = LockContext {
            owner: session.id(),
            kill: &kill,
            timeout: self.lock_timeout(session),
        };
        let ticket = self.locks.acquire(&ctx, BackupLockMode::Flush)?;
        self.admission.publish_flush_ticket(Some(ticket.id()));
        session.flush_lock = Some(ticket);

        self.flush_tables(session.id(), FlushFilter::UnusedNonTransactional);
        Ok(())
    }

    /// Waits for running non-transactional writes, flushes those tables, then
    /// blocks new DDL. DDL stays allowed while we wait on the writers.
    pub(super) fn block_ddl(&self, session: &mut BackupSession) -> Result<(), BackupError> {
        self.upgrade_flush_lock(session, BackupLockMode::WaitFlush)?;

        // Tables that could not be flushed are fine; only an error raised on
        // the session fails the stage.
        let outcome = self.flush_tables(session.id(), FlushFilter::NonTransactional);
        if let Some(reason) = outcome.session_error() {
            return Err(BackupError::FlushFailed {
                reason: reason.to_string(),
            });
        }

        self.upgrade_flush_lock(session, BackupLockMode::WaitDdl)
    }

    /// Blocks commits and writes to log and statistics tables, then flushes
    /// the system tables.
    pub(super) fn block_commit(&self, session: &mut BackupSession) -> Result<(), BackupError> {
        self.upgrade_flush_lock(session, BackupLockMode::WaitCommit)?;
        self.flush_tables(session.id(), FlushFilter::SystemAndLog);
        Ok(())
    }

    /// No-op for a session without a running backup.
    pub(super) fn teardown(&self, session: &mut BackupSession) {
        if session.current_stage == BackupStage::Finished {
            return;
        }
        session.current_stage = BackupStage::Finished;

        let mut completed = false;
        if let Some(ticket) = session.flush_lock.take() {
            completed = ticket.mode() == BackupLockMode::WaitCommit;
            self.locks.release(ticket);
        }
        self.engines.end_all();
        self.admission.leave();
        self.metrics.backup_ended(completed);
        info!(session = %session.id(), completed, "backup ended");
    }

    fn upgrade_flush_lock(
        &self,
        session: &mut BackupSession,
        mode: BackupLockMode,
    ) -> Result<(), BackupError> {
        let kill = session.kill_handle();
        let ctx = LockContext {
            owner: session.id(),
            kill: &kill,
            timeout: self.lock_timeout(session),
        };
        let ticket = session
            .flush_lock
            .as_mut()
            .ok_or_else(|| BackupError::Internal(format!("no backup lock to upgrade to {mode}")))?;
        self.locks.upgrade(&ctx, ticket, mode)?;
        debug!(session = %ctx.owner, %mode, "backup lock upgraded");
        Ok(())
    }

    fn flush_tables(&self, session: SessionId, filter: FlushFilter) -> FlushOutcome {
        let outcome = self.flusher.flush_and_close(filter);
        match &outcome {
            FlushOutcome::Flushed { tables } => {
                debug!(%session, ?filter, tables, "tables flushed");
            }
            FlushOutcome::Partial { flushed, skipped } => {
                self.metrics.advisory_flush_failed();
                warn!(%session, ?filter, flushed, ?skipped, "some tables were not flushed");
            }
            FlushOutcome::Failed { reason } => {
                self.metrics.advisory_flush_failed();
                warn!(%session, ?filter, %reason, "table flush failed");
            }
        }
        outcome
    }
}
