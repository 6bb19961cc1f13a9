use super::BackupCoordinator;
use crate::admission::BackupStatus;
use crate::config::BackupConfig;
use crate::error::BackupError;
use crate::hooks::{EngineBackupHook, FlushFilter, FlushOutcome, TableFlusher};
use crate::lock::{BackupLockMode, InProcessLockManager, LockContext, LockManager, LockTicket};
use crate::session::{BackupSession, KillHandle, SessionId};
use crate::stage::BackupStage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct RecordingFlusher {
    calls: Mutex<Vec<FlushFilter>>,
    outcomes: Mutex<HashMap<FlushFilter, FlushOutcome>>,
}

impl RecordingFlusher {
    fn calls(&self) -> Vec<FlushFilter> {
        self.calls.lock().clone()
    }

    fn set_outcome(&self, filter: FlushFilter, outcome: FlushOutcome) {
        self.outcomes.lock().insert(filter, outcome);
    }
}

impl TableFlusher for RecordingFlusher {
    fn flush_and_close(&self, filter: FlushFilter) -> FlushOutcome {
        self.calls.lock().push(filter);
        self.outcomes
            .lock()
            .get(&filter)
            .cloned()
            .unwrap_or(FlushOutcome::Flushed { tables: 3 })
    }
}

#[derive(Default)]
struct RecordingEngine {
    events: Mutex<Vec<&'static str>>,
}

impl EngineBackupHook for RecordingEngine {
    fn name(&self) -> &str {
        "recording"
    }

    fn on_backup_prepare(&self) {
        self.events.lock().push("prepare");
    }

    fn on_backup_end(&self) {
        self.events.lock().push("end");
    }
}

struct Harness {
    coordinator: BackupCoordinator,
    locks: Arc<InProcessLockManager>,
    flusher: Arc<RecordingFlusher>,
    engine: Arc<RecordingEngine>,
}

fn harness(timeout_ms: u64) -> Harness {
    let locks = Arc::new(InProcessLockManager::new());
    let flusher = Arc::new(RecordingFlusher::default());
    let engine = Arc::new(RecordingEngine::default());
    let coordinator = BackupCoordinator::new(
        BackupConfig::default().with_lock_wait_timeout(Duration::from_millis(timeout_ms)),
        locks.clone(),
        flusher.clone(),
    )
    .expect("coordinator");
    coordinator.engines().add(engine.clone());
    Harness {
        coordinator,
        locks,
        flusher,
        engine,
    }
}

fn statement_lock(locks: &InProcessLockManager, owner: u64, mode: BackupLockMode) -> LockTicket {
    let kill = KillHandle::default();
    locks
        .acquire(
            &LockContext {
                owner: SessionId(owner),
                kill: &kill,
                timeout: Duration::from_millis(50),
            },
            mode,
        )
        .expect("statement lock")
}

fn ticket_mode(session: &BackupSession) -> Option<BackupLockMode> {
    session.flush_lock().map(LockTicket::mode)
}

#[test]
fn stages_escalate_a_single_ticket() {
    let h = harness(100);
    let mut s = BackupSession::new(SessionId(1));

    h.coordinator
        .advance(&mut s, BackupStage::Start)
        .expect("start");
    assert_eq!(s.current_stage(), BackupStage::Start);
    assert!(s.flush_lock().is_none());
    assert_eq!(h.coordinator.status().owner, Some(SessionId(1)));

    h.coordinator
        .advance(&mut s, BackupStage::Flush)
        .expect("flush");
    let ticket_id = s.flush_lock().expect("ticket").id();
    assert_eq!(ticket_mode(&s), Some(BackupLockMode::Flush));
    assert_eq!(h.coordinator.status().active_flush_ticket, Some(ticket_id));

    h.coordinator
        .advance(&mut s, BackupStage::BlockDdl)
        .expect("block ddl");
    assert_eq!(ticket_mode(&s), Some(BackupLockMode::WaitDdl));

    h.coordinator
        .advance(&mut s, BackupStage::BlockCommit)
        .expect("block commit");
    assert_eq!(ticket_mode(&s), Some(BackupLockMode::WaitCommit));
    assert_eq!(s.flush_lock().expect("ticket").id(), ticket_id);
    assert_eq!(h.locks.granted_count(), 1);

    h.coordinator.advance(&mut s, BackupStage::End).expect("end");
    assert_eq!(s.current_stage(), BackupStage::Finished);
    assert!(s.flush_lock().is_none());
    assert_eq!(h.locks.granted_count(), 0);
    assert_eq!(h.coordinator.status(), BackupStatus::default());

    assert_eq!(
        h.flusher.calls(),
        vec![
            FlushFilter::UnusedNonTransactional,
            FlushFilter::NonTransactional,
            FlushFilter::SystemAndLog,
        ]
    );
    assert_eq!(*h.engine.events.lock(), vec!["prepare", "end"]);
    let metrics = h.coordinator.metrics();
    assert_eq!(metrics.backups_started, 1);
    assert_eq!(metrics.backups_completed, 1);
    assert_eq!(metrics.backups_aborted, 0);
}

#[test]
fn advancing_several_stages_runs_each_handler_in_order() {
    let h = harness(100);
    let mut s = BackupSession::new(SessionId(1));
    h.coordinator
        .advance(&mut s, BackupStage::Start)
        .expect("start");
    h.coordinator
        .advance(&mut s, BackupStage::BlockCommit)
        .expect("jump to block commit");
    assert_eq!(s.current_stage(), BackupStage::BlockCommit);
    assert_eq!(h.flusher.calls().len(), 3);
    assert_eq!(ticket_mode(&s), Some(BackupLockMode::WaitCommit));
    h.coordinator.end(&mut s);
}

#[test]
fn end_mid_sequence_skips_remaining_handlers() {
    let h = harness(100);
    let mut s = BackupSession::new(SessionId(1));
    h.coordinator
        .advance(&mut s, BackupStage::Start)
        .expect("start");
    h.coordinator
        .advance(&mut s, BackupStage::Flush)
        .expect("flush");
    h.coordinator.advance(&mut s, BackupStage::End).expect("end");

    assert_eq!(s.current_stage(), BackupStage::Finished);
    assert_eq!(h.flusher.calls(), vec![FlushFilter::UnusedNonTransactional]);
    assert!(!h.coordinator.status().running);
    assert_eq!(h.locks.granted_count(), 0);
    assert_eq!(h.coordinator.metrics().backups_aborted, 1);
}

#[test]
fn stage_before_start_is_not_running() {
    let h = harness(100);
    let mut s = BackupSession::new(SessionId(1));
    for stage in [
        BackupStage::Flush,
        BackupStage::BlockDdl,
        BackupStage::BlockCommit,
    ] {
        assert_eq!(
            h.coordinator.advance(&mut s, stage),
            Err(BackupError::NotRunning)
        );
        assert_eq!(s.current_stage(), BackupStage::Finished);
    }
    assert!(!h.coordinator.status().running);
    assert!(h.engine.events.lock().is_empty());
}

#[test]
fn end_without_backup_is_noop() {
    let h = harness(100);
    let mut s = BackupSession::new(SessionId(1));
    h.coordinator
        .advance(&mut s, BackupStage::End)
        .expect("end on idle session");
    h.coordinator.end(&mut s);
    assert_eq!(s.current_stage(), BackupStage::Finished);
    assert!(h.engine.events.lock().is_empty());
    assert_eq!(h.coordinator.metrics().backups_aborted, 0);
}

#[test]
fn end_twice_is_idempotent() {
    let h = harness(100);
    let mut s = BackupSession::new(SessionId(1));
    h.coordinator
        .advance(&mut s, BackupStage::Start)
        .expect("start");
    h.coordinator.end(&mut s);
    h.coordinator.end(&mut s);
    assert_eq!(*h.engine.events.lock(), vec!["prepare", "end"]);
    assert!(!h.coordinator.status().running);
}

#[test]
fn repeated_or_earlier_stage_is_wrong_stage() {
    let h = harness(100);
    let mut s = BackupSession::new(SessionId(1));
    h.coordinator
        .advance(&mut s, BackupStage::Start)
        .expect("start");
    h.coordinator
        .advance(&mut s, BackupStage::BlockDdl)
        .expect("block ddl");

    for stage in [BackupStage::Start, BackupStage::Flush, BackupStage::BlockDdl] {
        let err = h
            .coordinator
            .advance(&mut s, stage)
            .expect_err("wrong stage");
        assert_eq!(
            err,
            BackupError::WrongStage {
                expected: BackupStage::BlockCommit,
                actual: stage,
            }
        );
        assert_eq!(s.current_stage(), BackupStage::BlockDdl);
        assert_eq!(ticket_mode(&s), Some(BackupLockMode::WaitDdl));
    }
    assert_eq!(
        h.coordinator.advance(&mut s, BackupStage::Finished),
        Err(BackupError::WrongStage {
            expected: BackupStage::BlockCommit,
            actual: BackupStage::Finished,
        })
    );
    h.coordinator.end(&mut s);
}

#[test]
fn start_preconditions_fail_without_side_effects() {
    let h = harness(100);
    let mut s = BackupSession::new(SessionId(1));

    s.set_read_only_protected(true);
    s.set_locked_tables_mode(true);
    assert_eq!(
        h.coordinator.advance(&mut s, BackupStage::Start),
        Err(BackupError::ReadOnlyProtected)
    );
    s.set_read_only_protected(false);
    assert_eq!(
        h.coordinator.advance(&mut s, BackupStage::Start),
        Err(BackupError::ActiveTableLock)
    );
    assert_eq!(s.current_stage(), BackupStage::Finished);
    assert!(!h.coordinator.status().running);
    assert!(h.engine.events.lock().is_empty());

    s.set_locked_tables_mode(false);
    h.coordinator
        .advance(&mut s, BackupStage::Start)
        .expect("start once cleared");
    h.coordinator.end(&mut s);
}

#[test]
fn lock_timeout_reports_requested_stage_and_keeps_last_completed_stage() {
    let h = harness(30);
    let mut s = BackupSession::new(SessionId(1));
    h.coordinator
        .advance(&mut s, BackupStage::Start)
        .expect("start");
    let writer = statement_lock(&h.locks, 99, BackupLockMode::Dml);
    h.coordinator
        .advance(&mut s, BackupStage::Flush)
        .expect("flush does not wait for running writers");

    let err = h
        .coordinator
        .advance(&mut s, BackupStage::BlockCommit)
        .expect_err("writer still running");
    assert_eq!(err.failed_stage(), Some(BackupStage::BlockCommit));
    assert_eq!(
        *err.root_cause(),
        BackupError::LockTimeout {
            mode: BackupLockMode::WaitFlush
        }
    );
    assert_eq!(s.current_stage(), BackupStage::Flush);
    assert_eq!(ticket_mode(&s), Some(BackupLockMode::Flush));
    assert!(h.coordinator.status().running);
    assert_eq!(h.coordinator.metrics().lock_timeouts, 1);

    h.locks.release(writer);
    h.coordinator
        .advance(&mut s, BackupStage::BlockCommit)
        .expect("retry after writer finished");
    assert_eq!(ticket_mode(&s), Some(BackupLockMode::WaitCommit));
    h.coordinator.end(&mut s);
}

#[test]
fn running_ddl_fails_block_ddl_after_partial_escalation() {
    let h = harness(30);
    let mut s = BackupSession::new(SessionId(1));
    h.coordinator
        .advance(&mut s, BackupStage::Start)
        .expect("start");
    h.coordinator
        .advance(&mut s, BackupStage::Flush)
        .expect("flush");
    let ddl = statement_lock(&h.locks, 42, BackupLockMode::Ddl);

    let err = h
        .coordinator
        .advance(&mut s, BackupStage::BlockDdl)
        .expect_err("ddl running");
    assert_eq!(
        err,
        BackupError::StageFailed {
            stage: BackupStage::BlockDdl,
            cause: Box::new(BackupError::LockTimeout {
                mode: BackupLockMode::WaitDdl
            }),
        }
    );
    assert_eq!(s.current_stage(), BackupStage::Flush);
    assert_eq!(ticket_mode(&s), Some(BackupLockMode::WaitFlush));

    h.locks.release(ddl);
    h.coordinator
        .advance(&mut s, BackupStage::BlockDdl)
        .expect("retry");
    assert_eq!(ticket_mode(&s), Some(BackupLockMode::WaitDdl));
    h.coordinator.end(&mut s);
}

#[test]
fn flush_session_error_fails_block_ddl_but_partial_flush_does_not() {
    let h = harness(100);
    let mut s = BackupSession::new(SessionId(1));
    h.flusher.set_outcome(
        FlushFilter::NonTransactional,
        FlushOutcome::Partial {
            flushed: 2,
            skipped: vec!["app.busy".into()],
        },
    );
    h.flusher.set_outcome(
        FlushFilter::SystemAndLog,
        FlushOutcome::Failed {
            reason: "log table busy".into(),
        },
    );
    h.coordinator
        .advance(&mut s, BackupStage::Start)
        .expect("start");
    h.coordinator
        .advance(&mut s, BackupStage::BlockCommit)
        .expect("advisory flush problems do not fail stages");
    assert_eq!(h.coordinator.metrics().advisory_flush_failures, 2);
    h.coordinator.end(&mut s);

    h.flusher.set_outcome(
        FlushFilter::NonTransactional,
        FlushOutcome::Failed {
            reason: "out of memory".into(),
        },
    );
    h.coordinator
        .advance(&mut s, BackupStage::Start)
        .expect("start");
    let err = h
        .coordinator
        .advance(&mut s, BackupStage::BlockDdl)
        .expect_err("session error");
    assert_eq!(
        *err.root_cause(),
        BackupError::FlushFailed {
            reason: "out of memory".into()
        }
    );
    assert_eq!(s.current_stage(), BackupStage::Flush);
    h.coordinator.end(&mut s);
    assert_eq!(h.locks.granted_count(), 0);
}

#[test]
fn killed_lock_wait_surfaces_lock_wait_killed() {
    let h = Arc::new(harness(60_000));
    let writer = statement_lock(&h.locks, 99, BackupLockMode::Dml);
    let mut s = BackupSession::new(SessionId(1));
    h.coordinator
        .advance(&mut s, BackupStage::Start)
        .expect("start");
    h.coordinator
        .advance(&mut s, BackupStage::Flush)
        .expect("flush");
    let kill = s.kill_handle();

    let blocked = {
        let h = Arc::clone(&h);
        thread::spawn(move || {
            let res = h.coordinator.advance(&mut s, BackupStage::BlockDdl);
            (res, s)
        })
    };
    thread::sleep(Duration::from_millis(30));
    h.coordinator.kill(&kill);
    let (res, mut s) = blocked.join().expect("join");
    assert_eq!(
        res.expect_err("killed").root_cause(),
        &BackupError::LockWaitKilled {
            mode: BackupLockMode::WaitFlush
        }
    );
    assert_eq!(s.current_stage(), BackupStage::Flush);

    h.coordinator.end(&mut s);
    assert!(!h.coordinator.status().running);
    h.locks.release(writer);
}

#[test]
fn forged_ticket_cannot_release_the_backup_lock() {
    let h = harness(100);
    let mut s = BackupSession::new(SessionId(1));
    h.coordinator
        .advance(&mut s, BackupStage::Start)
        .expect("start");
    h.coordinator
        .advance(&mut s, BackupStage::BlockCommit)
        .expect("block commit");
    let published = h
        .coordinator
        .status()
        .active_flush_ticket
        .expect("published ticket");

    h.locks.release(LockTicket::new(
        published,
        SessionId(77),
        BackupLockMode::Dml,
    ));
    h.locks.release(LockTicket::new(
        published,
        SessionId(77),
        BackupLockMode::WaitCommit,
    ));

    assert_eq!(h.locks.mode_of(published), Some(BackupLockMode::WaitCommit));
    let kill = KillHandle::default();
    let err = h
        .locks
        .acquire(
            &LockContext {
                owner: SessionId(5),
                kill: &kill,
                timeout: Duration::from_millis(20),
            },
            BackupLockMode::Commit,
        )
        .expect_err("commits stay blocked under BLOCK_COMMIT");
    assert!(matches!(err, crate::lock::LockError::Timeout { .. }));

    h.coordinator.end(&mut s);
    assert_eq!(h.locks.granted_count(), 0);
}
