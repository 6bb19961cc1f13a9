use super::{BackupLockMode, LockContext, LockError, LockManager, LockTicket, TicketId};
use crate::session::SessionId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy)]
struct Grant {
    owner: SessionId,
    mode: BackupLockMode,
}

#[derive(Default)]
struct LockTable {
    granted: HashMap<TicketId, Grant>,
    next_id: u64,
}

impl LockTable {
    /// The grant `ticket` stands for, if its owner and mode still match.
    fn grant_for(&mut self, ticket: &LockTicket) -> Option<&mut Grant> {
        self.granted
            .get_mut(&ticket.id())
            .filter(|grant| grant.owner == ticket.owner() && grant.mode == ticket.mode())
    }

    fn blocked(
        &self,
        owner: SessionId,
        upgrading: Option<TicketId>,
        mode: BackupLockMode,
    ) -> bool {
        self.granted.iter().any(|(id, grant)| {
            Some(*id) != upgrading && grant.owner != owner && mode.waits_for(grant.mode)
        })
    }
}

/// In-process lock table for the backup namespace.
///
/// Requests wait on a condition variable until no other owner holds an
/// incompatible mode, the deadline passes, or the requesting session is
/// killed.
pub struct InProcessLockManager {
    state: Mutex<LockTable>,
    cv: Condvar,
    /// Set when a thread panicked while holding the table. All later
    /// requests are rejected since grants may be inconsistent.
    poisoned: AtomicBool,
}

impl Default for InProcessLockManager {
    fn default() -> Self {
        Self {
            state: Mutex::new(LockTable::default()),
            cv: Condvar::default(),
            poisoned: AtomicBool::new(false),
        }
    }
}

impl InProcessLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter_fail_safe(&self, context: &str) -> LockError {
        self.poisoned.store(true, Ordering::Release);
        error!("backup lock table poisoned {context} - entering fail-safe mode");
        LockError::Poisoned
    }

    fn lock_table(&self) -> Result<MutexGuard<'_, LockTable>, LockError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(LockError::Poisoned);
        }
        self.state
            .lock()
            .map_err(|_| self.enter_fail_safe("on lock"))
    }

    fn wait_grantable(
        &self,
        ctx: &LockContext<'_>,
        upgrading: Option<TicketId>,
        mode: BackupLockMode,
    ) -> Result<MutexGuard<'_, LockTable>, LockError> {
        // No deadline when the timeout does not fit in an Instant.
        let deadline = Instant::now().checked_add(ctx.timeout);
        let mut table = self.lock_table()?;
        let mut logged = false;
        loop {
            if ctx.kill.is_killed() {
                return Err(LockError::Killed { mode });
            }
            if !table.blocked(ctx.owner, upgrading, mode) {
                return Ok(table);
            }
            if !logged {
                debug!(owner = %ctx.owner, %mode, "waiting for backup lock");
                logged = true;
            }
            table = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LockError::Timeout { mode });
                    }
                    self.cv
                        .wait_timeout(table, deadline - now)
                        .map_err(|_| self.enter_fail_safe("during wait"))?
                        .0
                }
                None => self
                    .cv
                    .wait(table)
                    .map_err(|_| self.enter_fail_safe("during wait"))?,
            };
        }
    }

    /// Every granted ticket with its owner and mode, ordered by ticket id.
    pub fn granted_modes(&self) -> Vec<(SessionId, BackupLockMode)> {
        let Ok(table) = self.lock_table() else {
            return Vec::new();
        };
        let mut grants: Vec<_> = table.granted.iter().collect();
        grants.sort_by_key(|(id, _)| **id);
        grants
            .into_iter()
            .map(|(_, grant)| (grant.owner, grant.mode))
            .collect()
    }

    pub fn mode_of(&self, ticket: TicketId) -> Option<BackupLockMode> {
        self.lock_table()
            .ok()
            .and_then(|table| table.granted.get(&ticket).map(|grant| grant.mode))
    }

    pub fn granted_count(&self) -> usize {
        self.lock_table().map(|t| t.granted.len()).unwrap_or(0)
    }
}

impl LockManager for InProcessLockManager {
    fn acquire(
        &self,
        ctx: &LockContext<'_>,
        mode: BackupLockMode,
    ) -> Result<LockTicket, LockError> {
        let mut table = self.wait_grantable(ctx, None, mode)?;
        table.next_id += 1;
        let id = TicketId(table.next_id);
        table.granted.insert(
            id,
            Grant {
                owner: ctx.owner,
                mode,
            },
        );
        Ok(LockTicket::new(id, ctx.owner, mode))
    }

    fn upgrade(
        &self,
        ctx: &LockContext<'_>,
        ticket: &mut LockTicket,
        mode: BackupLockMode,
    ) -> Result<(), LockError> {
        let from = ticket.mode();
        if !from.same_family(mode) {
            return Err(LockError::InvalidUpgrade { from, to: mode });
        }
        if from.covers(mode) {
            return Ok(());
        }
        // Checked before waiting so a stale ticket fails fast.
        let known = self.lock_table()?.grant_for(ticket).is_some();
        if ctx.owner != ticket.owner() || !known {
            return Err(LockError::UnknownTicket(ticket.id()));
        }
        let mut table = self.wait_grantable(ctx, Some(ticket.id()), mode)?;
        let grant = table
            .grant_for(ticket)
            .ok_or(LockError::UnknownTicket(ticket.id()))?;
        grant.mode = mode;
        ticket.set_granted_mode(mode);
        Ok(())
    }

    fn downgrade(&self, ticket: &mut LockTicket, mode: BackupLockMode) {
        let from = ticket.mode();
        if !from.same_family(mode) || !from.covers(mode) || from == mode {
            return;
        }
        let Ok(mut table) = self.lock_table() else {
            return;
        };
        let Some(grant) = table.grant_for(ticket) else {
            warn!(
                ticket = ?ticket.id(),
                owner = %ticket.owner(),
                "downgrade of unknown backup lock ignored"
            );
            return;
        };
        grant.mode = mode;
        ticket.set_granted_mode(mode);
        drop(table);
        self.cv.notify_all();
    }

    fn release(&self, ticket: LockTicket) {
        let Ok(mut table) = self.lock_table() else {
            return;
        };
        if table.grant_for(&ticket).is_none() {
            warn!(
                ticket = ?ticket.id(),
                owner = %ticket.owner(),
                "release of unknown backup lock ignored"
            );
            return;
        }
        table.granted.remove(&ticket.id());
        drop(table);
        self.cv.notify_all();
    }

    fn wake_waiters(&self) {
        // Taking the table lock orders this wakeup after any waiter's kill
        // check, so the wakeup cannot be lost.
        if let Ok(table) = self.lock_table() {
            drop(table);
        }
        self.cv.notify_all();
    }
}
