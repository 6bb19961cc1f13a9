use super::BackupCoordinator;
use crate::error::BackupError;
use crate::lock::{BackupLockMode, LockContext};
use crate::session::BackupSession;
use tracing::debug;

impl BackupCoordinator {
    /// Lets the copy phase of an ALTER run under `BLOCK_DDL` by weakening the
    /// session's DDL backup lock to `AlterCopy`.
    ///
    /// No-op when the session holds no such lock (LOCK TABLES), or holds it in
    /// a non-DDL mode such as `Dml` for non-transactional tables.
    pub fn relax_alter_copy_lock(&self, session: &mut BackupSession) {
        let owner = session.id();
        let Some(ticket) = session.alter_copy_lock.as_mut() else {
            return;
        };
        if ticket.mode() != BackupLockMode::Ddl {
            return;
        }
        self.locks.downgrade(ticket, BackupLockMode::AlterCopy);
        debug!(session = %owner, "alter copy lock relaxed");
    }

    /// Upgrades a relaxed ALTER lock back to `Ddl` before the final rename.
    ///
    /// Waits for a running `BLOCK_DDL` or later stage to end, bounded by the
    /// lock wait timeout. The caller must abort the ALTER on error.
    pub fn restore_alter_copy_lock(&self, session: &mut BackupSession) -> Result<(), BackupError> {
        let kill = session.kill_handle();
        let ctx = LockContext {
            owner: session.id(),
            kill: &kill,
            timeout: self.lock_timeout(session),
        };
        let Some(ticket) = session.alter_copy_lock.as_mut() else {
            return Ok(());
        };
        if ticket.mode() != BackupLockMode::AlterCopy {
            return Ok(());
        }
        self.locks.upgrade(&ctx, ticket, BackupLockMode::Ddl)?;
        debug!(session = %ctx.owner, "alter copy lock restored");
        Ok(())
    }
}
