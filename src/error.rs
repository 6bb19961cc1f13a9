use crate::lock::{BackupLockMode, LockError};
use crate::stage::BackupStage;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupErrorCode {
    NotRunning,
    WrongStage,
    StageFailed,
    LockTimeout,
    LockWaitKilled,
    Cancelled,
    ReadOnlyProtected,
    ActiveTableLock,
    FlushFailed,
    InvalidConfig,
    Internal,
}

impl BackupErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupErrorCode::NotRunning => "backup_not_running",
            BackupErrorCode::WrongStage => "backup_wrong_stage",
            BackupErrorCode::StageFailed => "backup_stage_failed",
            BackupErrorCode::LockTimeout => "lock_wait_timeout",
            BackupErrorCode::LockWaitKilled => "lock_wait_killed",
            BackupErrorCode::Cancelled => "cancelled",
            BackupErrorCode::ReadOnlyProtected => "read_only_protected",
            BackupErrorCode::ActiveTableLock => "active_table_lock",
            BackupErrorCode::FlushFailed => "flush_failed",
            BackupErrorCode::InvalidConfig => "invalid_config",
            BackupErrorCode::Internal => "internal",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackupError {
    #[error("backup stage is not running; BACKUP STAGE START must come first")]
    NotRunning,
    #[error("wrong backup stage: expected {expected} or later, got {actual}")]
    WrongStage {
        expected: BackupStage,
        actual: BackupStage,
    },
    #[error("backup stage {stage} failed: {cause}")]
    StageFailed {
        stage: BackupStage,
        #[source]
        cause: Box<BackupError>,
    },
    #[error("lock wait timeout exceeded for {mode}")]
    LockTimeout { mode: BackupLockMode },
    #[error("lock wait for {mode} aborted: session killed")]
    LockWaitKilled { mode: BackupLockMode },
    #[error("cancelled while waiting for a running backup to finish")]
    Cancelled,
    #[error("session is read-only protected")]
    ReadOnlyProtected,
    #[error("cannot run backup stages with LOCK TABLES or an active transaction")]
    ActiveTableLock,
    #[error("table flush failed: {reason}")]
    FlushFailed { reason: String },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl BackupError {
    pub fn code(&self) -> BackupErrorCode {
        match self {
            BackupError::NotRunning => BackupErrorCode::NotRunning,
            BackupError::WrongStage { .. } => BackupErrorCode::WrongStage,
            BackupError::StageFailed { .. } => BackupErrorCode::StageFailed,
            BackupError::LockTimeout { .. } => BackupErrorCode::LockTimeout,
            BackupError::LockWaitKilled { .. } => BackupErrorCode::LockWaitKilled,
            BackupError::Cancelled => BackupErrorCode::Cancelled,
            BackupError::ReadOnlyProtected => BackupErrorCode::ReadOnlyProtected,
            BackupError::ActiveTableLock => BackupErrorCode::ActiveTableLock,
            BackupError::FlushFailed { .. } => BackupErrorCode::FlushFailed,
            BackupError::InvalidConfig { .. } => BackupErrorCode::InvalidConfig,
            BackupError::Internal(_) => BackupErrorCode::Internal,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// The innermost error behind any `StageFailed` wrappers.
    pub fn root_cause(&self) -> &BackupError {
        match self {
            BackupError::StageFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// The requested stage a `StageFailed` error reports.
    pub fn failed_stage(&self) -> Option<BackupStage> {
        match self {
            BackupError::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<LockError> for BackupError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { mode } => BackupError::LockTimeout { mode },
            LockError::Killed { mode } => BackupError::LockWaitKilled { mode },
            other => BackupError::Internal(other.to_string()),
        }
    }
}
