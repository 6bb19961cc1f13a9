pub mod manager;

use crate::session::{KillHandle, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use manager::InProcessLockManager;

/// Modes in the backup lock namespace.
///
/// Statement modes are taken by ordinary sessions for the duration of a
/// statement; the four `Flush..WaitCommit` modes are the strengths the backup
/// driver escalates its single ticket through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupLockMode {
    /// Write to a non-transactional table.
    Dml,
    /// Write to a transactional table.
    TransDml,
    /// Write to a system, statistics or log table.
    SysDml,
    /// CREATE/DROP/RENAME/TRUNCATE and the start/finalize phase of ALTER.
    Ddl,
    /// Bulk-copy phase of an ALTER running during a backup.
    AlterCopy,
    Commit,
    Flush,
    WaitFlush,
    WaitDdl,
    WaitCommit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockFamily {
    Statement(BackupLockMode),
    Ddl,
    Backup,
}

impl BackupLockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupLockMode::Dml => "BACKUP_DML",
            BackupLockMode::TransDml => "BACKUP_TRANS_DML",
            BackupLockMode::SysDml => "BACKUP_SYS_DML",
            BackupLockMode::Ddl => "BACKUP_DDL",
            BackupLockMode::AlterCopy => "BACKUP_ALTER_COPY",
            BackupLockMode::Commit => "BACKUP_COMMIT",
            BackupLockMode::Flush => "BACKUP_FLUSH",
            BackupLockMode::WaitFlush => "BACKUP_WAIT_FLUSH",
            BackupLockMode::WaitDdl => "BACKUP_WAIT_DDL",
            BackupLockMode::WaitCommit => "BACKUP_WAIT_COMMIT",
        }
    }

    fn family_rank(self) -> (LockFamily, u8) {
        match self {
            BackupLockMode::AlterCopy => (LockFamily::Ddl, 0),
            BackupLockMode::Ddl => (LockFamily::Ddl, 1),
            BackupLockMode::Flush => (LockFamily::Backup, 0),
            BackupLockMode::WaitFlush => (LockFamily::Backup, 1),
            BackupLockMode::WaitDdl => (LockFamily::Backup, 2),
            BackupLockMode::WaitCommit => (LockFamily::Backup, 3),
            other => (LockFamily::Statement(other), 0),
        }
    }

    pub fn is_backup_stage_mode(self) -> bool {
        matches!(self.family_rank().0, LockFamily::Backup)
    }

    /// Whether a ticket can move between `self` and `other` in place.
    pub fn same_family(self, other: BackupLockMode) -> bool {
        self.family_rank().0 == other.family_rank().0
    }

    /// `self` is at least as strong as `other` within the same family.
    pub fn covers(self, other: BackupLockMode) -> bool {
        let (family, rank) = self.family_rank();
        let (other_family, other_rank) = other.family_rank();
        family == other_family && rank >= other_rank
    }

    /// Whether a request for `self` must wait while another owner holds
    /// `granted`.
    pub fn waits_for(self, granted: BackupLockMode) -> bool {
        use BackupLockMode::*;
        let backup_held = granted.is_backup_stage_mode();
        match self {
            Dml | Flush => backup_held,
            TransDml | AlterCopy => false,
            SysDml | Commit => granted == WaitCommit,
            Ddl => matches!(granted, WaitDdl | WaitCommit),
            WaitFlush => backup_held || granted == Dml,
            WaitDdl => backup_held || matches!(granted, Dml | Ddl),
            WaitCommit => backup_held || matches!(granted, Dml | SysDml | Ddl | Commit),
        }
    }
}

impl fmt::Display for BackupLockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TicketId(pub u64);

/// A granted lock in the backup namespace.
///
/// Not `Clone`: releasing consumes the ticket, so a released ticket cannot be
/// upgraded or released again. Only the lock manager mints tickets or changes
/// their mode.
#[derive(Debug, PartialEq, Eq)]
pub struct LockTicket {
    id: TicketId,
    owner: SessionId,
    mode: BackupLockMode,
}

impl LockTicket {
    pub(crate) fn new(id: TicketId, owner: SessionId, mode: BackupLockMode) -> Self {
        Self { id, owner, mode }
    }

    pub fn id(&self) -> TicketId {
        self.id
    }

    pub fn owner(&self) -> SessionId {
        self.owner
    }

    pub fn mode(&self) -> BackupLockMode {
        self.mode
    }

    /// Records the mode the lock manager granted after an upgrade or
    /// downgrade.
    pub(crate) fn set_granted_mode(&mut self, mode: BackupLockMode) {
        self.mode = mode;
    }
}

/// Who is asking and how long they are prepared to wait.
#[derive(Debug, Clone, Copy)]
pub struct LockContext<'a> {
    pub owner: SessionId,
    pub kill: &'a KillHandle,
    pub timeout: Duration,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock wait timeout exceeded for {mode}")]
    Timeout { mode: BackupLockMode },
    #[error("lock wait for {mode} aborted: session killed")]
    Killed { mode: BackupLockMode },
    #[error("cannot upgrade {from} to {to}")]
    InvalidUpgrade {
        from: BackupLockMode,
        to: BackupLockMode,
    },
    #[error("unknown lock ticket {0:?}")]
    UnknownTicket(TicketId),
    #[error("lock manager poisoned - rejecting requests")]
    Poisoned,
}

/// Lock manager collaborator for the backup namespace.
///
/// Operations on a ticket whose id, owner and mode do not match a live grant
/// are rejected (`upgrade`) or ignored (`downgrade`, `release`).
pub trait LockManager: Send + Sync {
    fn acquire(
        &self,
        ctx: &LockContext<'_>,
        mode: BackupLockMode,
    ) -> Result<LockTicket, LockError>;

    /// Strengthens `ticket` in place without releasing it. Requesting a mode
    /// the ticket already covers is a no-op.
    fn upgrade(
        &self,
        ctx: &LockContext<'_>,
        ticket: &mut LockTicket,
        mode: BackupLockMode,
    ) -> Result<(), LockError>;

    /// Weakens `ticket` in place. Never blocks.
    fn downgrade(&self, ticket: &mut LockTicket, mode: BackupLockMode);

    fn release(&self, ticket: LockTicket);

    /// Wakes blocked requests so they re-check their kill flag.
    fn wake_waiters(&self) {}
}
