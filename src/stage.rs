use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position of a session in the backup stage sequence.
///
/// Declaration order is the stage order. `Finished` is the resting value of a
/// session with no backup in flight; the driver handles it before any order
/// comparison, so it never participates in "is this stage later" checks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum BackupStage {
    Start,
    Flush,
    BlockDdl,
    BlockCommit,
    End,
    #[default]
    Finished,
}

impl BackupStage {
    /// The stages a client may request, in order.
    pub const REQUESTABLE: [BackupStage; 5] = [
        BackupStage::Start,
        BackupStage::Flush,
        BackupStage::BlockDdl,
        BackupStage::BlockCommit,
        BackupStage::End,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackupStage::Start => "START",
            BackupStage::Flush => "FLUSH",
            BackupStage::BlockDdl => "BLOCK_DDL",
            BackupStage::BlockCommit => "BLOCK_COMMIT",
            BackupStage::End => "END",
            BackupStage::Finished => "FINISHED",
        }
    }

    /// The stage following `self`. `End` and `Finished` both lead to `Finished`.
    pub fn next(self) -> BackupStage {
        match self {
            BackupStage::Start => BackupStage::Flush,
            BackupStage::Flush => BackupStage::BlockDdl,
            BackupStage::BlockDdl => BackupStage::BlockCommit,
            BackupStage::BlockCommit => BackupStage::End,
            BackupStage::End | BackupStage::Finished => BackupStage::Finished,
        }
    }

    /// The stage a session falls back to when the handler for `self` fails.
    pub fn previous(self) -> BackupStage {
        match self {
            BackupStage::Start | BackupStage::Finished => BackupStage::Finished,
            BackupStage::Flush => BackupStage::Start,
            BackupStage::BlockDdl => BackupStage::Flush,
            BackupStage::BlockCommit => BackupStage::BlockDdl,
            BackupStage::End => BackupStage::BlockCommit,
        }
    }

    pub fn is_running(self) -> bool {
        self != BackupStage::Finished
    }
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown backup stage '{0}'")]
pub struct ParseStageError(pub String);

impl FromStr for BackupStage {
    type Err = ParseStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackupStage::REQUESTABLE
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseStageError(s.to_string()))
    }
}
