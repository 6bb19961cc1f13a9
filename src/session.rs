use crate::lock::LockTicket;
use crate::stage::BackupStage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Shared kill flag for one session.
///
/// Clones observe the same flag, so a handle can be given to another thread
/// that cancels the session while it is blocked. Setting the flag alone does
/// not wake anything; go through `BackupCoordinator::kill`.
#[derive(Debug, Clone, Default)]
pub struct KillHandle {
    killed: Arc<AtomicBool>,
}

impl KillHandle {
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_killed(&self) {
        self.killed.store(true, Ordering::Release);
    }

    /// Clears a previous kill so the session can issue new statements.
    pub fn reset(&self) {
        self.killed.store(false, Ordering::Release);
    }
}

/// Per-session backup context.
///
/// Owned by the session and passed to the driver by `&mut`. The backup lock
/// ticket lives here rather than in global state so that only the session
/// driving the backup can upgrade or release it.
#[derive(Debug)]
pub struct BackupSession {
    id: SessionId,
    pub(crate) current_stage: BackupStage,
    pub(crate) flush_lock: Option<LockTicket>,
    pub(crate) alter_copy_lock: Option<LockTicket>,
    read_only_protected: bool,
    locked_tables_mode: bool,
    lock_wait_timeout: Option<Duration>,
    kill: KillHandle,
}

impl BackupSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            current_stage: BackupStage::Finished,
            flush_lock: None,
            alter_copy_lock: None,
            read_only_protected: false,
            locked_tables_mode: false,
            lock_wait_timeout: None,
            kill: KillHandle::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn current_stage(&self) -> BackupStage {
        self.current_stage
    }

    pub fn flush_lock(&self) -> Option<&LockTicket> {
        self.flush_lock.as_ref()
    }

    pub fn kill_handle(&self) -> KillHandle {
        self.kill.clone()
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_killed()
    }

    /// The session holds a global read lock or runs with read-only
    /// protection; a backup cannot start from it.
    pub fn set_read_only_protected(&mut self, on: bool) {
        self.read_only_protected = on;
    }

    pub fn read_only_protected(&self) -> bool {
        self.read_only_protected
    }

    /// The session is inside an explicit multi-statement table lock.
    pub fn set_locked_tables_mode(&mut self, on: bool) {
        self.locked_tables_mode = on;
    }

    pub fn locked_tables_mode(&self) -> bool {
        self.locked_tables_mode
    }

    /// Overrides the configured lock wait timeout for this session only.
    pub fn set_lock_wait_timeout(&mut self, timeout: Option<Duration>) {
        self.lock_wait_timeout = timeout;
    }

    pub(crate) fn lock_wait_timeout_or(&self, default: Duration) -> Duration {
        self.lock_wait_timeout.unwrap_or(default)
    }

    /// Installs the backup-namespace ticket that DDL execution holds for an
    /// ALTER, so the alter-copy helper can relax and restore it.
    pub fn install_alter_copy_lock(&mut self, ticket: LockTicket) -> Option<LockTicket> {
        self.alter_copy_lock.replace(ticket)
    }

    pub fn take_alter_copy_lock(&mut self) -> Option<LockTicket> {
        self.alter_copy_lock.take()
    }

    pub fn alter_copy_lock(&self) -> Option<&LockTicket> {
        self.alter_copy_lock.as_ref()
    }
}
