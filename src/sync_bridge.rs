use crate::driver::BackupCoordinator;
use crate::error::BackupError;
use crate::session::{BackupSession, KillHandle};
use crate::stage::BackupStage;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::error;

/// A session shared between an async command layer and the blocking thread
/// that drives its stages.
pub type SharedSession = Arc<Mutex<BackupSession>>;

pub fn shared_session(session: BackupSession) -> SharedSession {
    Arc::new(Mutex::new(session))
}

/// Runs the blocking stage protocol on tokio's blocking pool.
///
/// Stage transitions can wait for a previous backup or for a lock for a long
/// time, so they must not run on an async worker thread.
#[derive(Clone)]
pub struct AsyncBackupDriver {
    inner: Arc<BackupCoordinator>,
}

impl AsyncBackupDriver {
    pub fn new(inner: Arc<BackupCoordinator>) -> Self {
        Self { inner }
    }

    pub fn coordinator(&self) -> &Arc<BackupCoordinator> {
        &self.inner
    }

    pub async fn advance(
        &self,
        session: SharedSession,
        stage: BackupStage,
    ) -> Result<(), BackupError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.advance(&mut session.lock(), stage))
            .await
            .map_err(|e| BackupError::Internal(format!("backup stage task failed: {e}")))?
    }

    pub async fn end(&self, session: SharedSession) {
        let inner = Arc::clone(&self.inner);
        if let Err(e) =
            tokio::task::spawn_blocking(move || inner.end(&mut session.lock())).await
        {
            error!("backup teardown task failed: {e}");
        }
    }

    /// Does not block; the cancelled call returns on its own task.
    pub fn kill(&self, kill: &KillHandle) {
        self.inner.kill(kill);
    }
}
