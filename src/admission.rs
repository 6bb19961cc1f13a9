use crate::error::BackupError;
use crate::lock::TicketId;
use crate::session::{KillHandle, SessionId};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Snapshot of the process-wide backup admission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackupStatus {
    pub running: bool,
    pub owner: Option<SessionId>,
    pub active_flush_ticket: Option<TicketId>,
}

/// Whether admission had to wait for a previous backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admitted {
    Immediately,
    AfterWait,
}

/// Single-backup-at-a-time gate.
///
/// `running` is only read or written under `state`; waiters sleep on `cv`.
#[derive(Default)]
pub(crate) struct AdmissionGate {
    state: Mutex<BackupStatus>,
    cv: Condvar,
}

impl AdmissionGate {
    /// Blocks until no backup is running or `kill` fires.
    pub(crate) fn enter(
        &self,
        session: SessionId,
        kill: &KillHandle,
    ) -> Result<Admitted, BackupError> {
        let mut state = self.state.lock();
        let mut admitted = Admitted::Immediately;
        while state.running && !kill.is_killed() {
            if admitted == Admitted::Immediately {
                debug!(%session, owner = ?state.owner, "waiting for running backup to finish");
                admitted = Admitted::AfterWait;
            }
            self.cv.wait(&mut state);
        }
        if kill.is_killed() {
            // We may have consumed a wakeup meant for another waiter.
            self.cv.notify_one();
            return Err(BackupError::Cancelled);
        }
        state.running = true;
        state.owner = Some(session);
        state.active_flush_ticket = None;
        Ok(admitted)
    }

    pub(crate) fn leave(&self) {
        let mut state = self.state.lock();
        *state = BackupStatus::default();
        drop(state);
        self.cv.notify_one();
    }

    pub(crate) fn publish_flush_ticket(&self, ticket: Option<TicketId>) {
        self.state.lock().active_flush_ticket = ticket;
    }

    /// Wakes every waiter so killed sessions observe their flag.
    pub(crate) fn wake_all(&self) {
        let state = self.state.lock();
        drop(state);
        self.cv.notify_all();
    }

    pub(crate) fn status(&self) -> BackupStatus {
        *self.state.lock()
    }
}
