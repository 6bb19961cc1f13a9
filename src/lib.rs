//! Online backup stage coordination.
//!
//! An external backup tool walks a session through
//! `START -> FLUSH -> BLOCK_DDL -> BLOCK_COMMIT -> END`, copying files between
//! stages. Each stage escalates one long-lived lock in the backup namespace,
//! narrowing what other sessions may do, and only one backup may run at a
//! time.

pub mod admission;
pub mod config;
pub mod driver;
pub mod error;
pub mod hooks;
pub mod lock;
pub mod metrics;
pub mod session;
pub mod stage;
pub mod sync_bridge;

pub use admission::BackupStatus;
pub use config::BackupConfig;
pub use driver::BackupCoordinator;
pub use error::{BackupError, BackupErrorCode};
pub use hooks::{EngineBackupHook, EngineRegistry, FlushFilter, FlushOutcome, TableFlusher};
pub use lock::{BackupLockMode, InProcessLockManager, LockError, LockManager, LockTicket};
pub use metrics::BackupMetrics;
pub use session::{BackupSession, KillHandle, SessionId};
pub use stage::BackupStage;
pub use sync_bridge::{AsyncBackupDriver, SharedSession};
