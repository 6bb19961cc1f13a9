use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Storage engine callbacks around a backup.
///
/// Engines use `on_backup_prepare` to block purge of redo files or take a
/// checkpoint, and `on_backup_end` to undo it. Neither can fail.
pub trait EngineBackupHook: Send + Sync {
    fn name(&self) -> &str;
    fn on_backup_prepare(&self);
    fn on_backup_end(&self);
}

/// The set of active engines a backup fans out to.
#[derive(Default)]
pub struct EngineRegistry {
    engines: Mutex<Vec<Arc<dyn EngineBackupHook>>>,
}

impl EngineRegistry {
    pub fn add(&self, engine: Arc<dyn EngineBackupHook>) {
        self.engines.lock().push(engine);
    }

    pub fn remove(&self, engine: &Arc<dyn EngineBackupHook>) {
        self.engines.lock().retain(|e| !Arc::ptr_eq(e, engine));
    }

    pub fn len(&self) -> usize {
        self.engines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Snapshot so a hook can touch the registry without deadlocking.
    fn snapshot(&self) -> Vec<Arc<dyn EngineBackupHook>> {
        self.engines.lock().clone()
    }

    pub(crate) fn prepare_all(&self) {
        for engine in self.snapshot() {
            debug!(engine = engine.name(), "engine backup prepare");
            engine.on_backup_prepare();
        }
    }

    pub(crate) fn end_all(&self) {
        for engine in self.snapshot() {
            debug!(engine = engine.name(), "engine backup end");
            engine.on_backup_end();
        }
    }
}

/// Which tables a flush request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlushFilter {
    /// Non-transactional tables and shares nobody has open.
    UnusedNonTransactional,
    /// All non-transactional tables; tables still in use are marked to be
    /// closed when released.
    NonTransactional,
    /// System, statistics and log tables.
    SystemAndLog,
}

/// Result of a flush request.
///
/// `Partial` is advisory: some tables could not be flushed but the stage may
/// proceed. `Failed` means the flush raised an error on the session itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed { tables: usize },
    Partial { flushed: usize, skipped: Vec<String> },
    Failed { reason: String },
}

impl FlushOutcome {
    /// The error raised on the session, if the flush failed outright.
    pub fn session_error(&self) -> Option<&str> {
        match self {
            FlushOutcome::Failed { reason } => Some(reason.as_str()),
            FlushOutcome::Flushed { .. } | FlushOutcome::Partial { .. } => None,
        }
    }
}

/// Table cache collaborator that flushes and closes tables.
pub trait TableFlusher: Send + Sync {
    fn flush_and_close(&self, filter: FlushFilter) -> FlushOutcome;
}

/// Flusher for deployments with no table cache of their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFlusher;

impl TableFlusher for NoopFlusher {
    fn flush_and_close(&self, _filter: FlushFilter) -> FlushOutcome {
        FlushOutcome::Flushed { tables: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        EngineBackupHook, EngineRegistry, FlushFilter, FlushOutcome, NoopFlusher, TableFlusher,
    };
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingEngine {
        prepared: AtomicUsize,
        ended: AtomicUsize,
    }

    impl EngineBackupHook for CountingEngine {
        fn name(&self) -> &str {
            "counting"
        }

        fn on_backup_prepare(&self) {
            self.prepared.fetch_add(1, Ordering::SeqCst);
        }

        fn on_backup_end(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn registry_broadcasts_to_every_engine() {
        let registry = EngineRegistry::default();
        let a = Arc::new(CountingEngine::default());
        let b = Arc::new(CountingEngine::default());
        registry.add(a.clone());
        registry.add(b.clone());
        registry.prepare_all();
        registry.end_all();
        for engine in [&a, &b] {
            assert_eq!(engine.prepared.load(Ordering::SeqCst), 1);
            assert_eq!(engine.ended.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn removed_engine_is_not_called() {
        let registry = EngineRegistry::default();
        let a = Arc::new(CountingEngine::default());
        let as_hook: Arc<dyn EngineBackupHook> = a.clone();
        registry.add(as_hook.clone());
        registry.remove(&as_hook);
        assert!(registry.is_empty());
        registry.prepare_all();
        assert_eq!(a.prepared.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn only_failed_outcome_is_a_session_error() {
        let flushed = NoopFlusher.flush_and_close(FlushFilter::SystemAndLog);
        assert_eq!(flushed.session_error(), None);
        let partial = FlushOutcome::Partial {
            flushed: 1,
            skipped: vec!["t1".into()],
        };
        assert_eq!(partial.session_error(), None);
        let failed = FlushOutcome::Failed {
            reason: "disk full".into(),
        };
        assert_eq!(failed.session_error(), Some("disk full"));
    }
}
