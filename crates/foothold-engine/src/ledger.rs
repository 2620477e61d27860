//! Tamper ledger: every change made to a target, and how to undo it.
//!
//! Records are appended only after the mutating operation succeeded and are
//! persisted with the target's store document. Reverting runs the recorded
//! action through the platform:
//!
//! * success removes the record,
//! * a target that no longer matches (file already gone, line already removed)
//!   leaves the record in place marked `failed`,
//! * an unknown id is a no-op.

use crate::store::TargetStore;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use foothold_core::{Error, Result, Uid};
use foothold_platform::Platform;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TamperKind {
    CreatedFile,
    ReplacedFile,
    CreatedDirectory,
    PermissionChange,
    InstalledCredential,
}

impl fmt::Display for TamperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CreatedFile => "created file",
            Self::ReplacedFile => "replaced file",
            Self::CreatedDirectory => "created directory",
            Self::PermissionChange => "permission change",
            Self::InstalledCredential => "installed credential",
        };
        f.write_str(s)
    }
}

/// How to undo one change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RevertAction {
    RemoveFile { path: String },
    RemoveDirectory { path: String },
    RestoreMode { path: String, mode: u32 },
    /// Original content, base64.
    RestoreFile { path: String, content: String },
    RemoveLine { path: String, line: String },
}

impl RevertAction {
    pub fn restore_file(path: impl Into<String>, original: &[u8]) -> Self {
        Self::RestoreFile {
            path: path.into(),
            content: BASE64.encode(original),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TamperRecord {
    pub id: Uuid,
    pub path: String,
    pub kind: TamperKind,
    pub revert: Option<RevertAction>,
    /// Module that made the change.
    pub module: String,
    /// Uid the change was made as.
    pub uid: Option<Uid>,
    pub created_at: DateTime<Utc>,
    /// A revert was attempted and the target no longer matched.
    #[serde(default)]
    pub failed: bool,
}

impl TamperRecord {
    pub fn new(
        path: impl Into<String>,
        kind: TamperKind,
        revert: Option<RevertAction>,
        module: impl Into<String>,
        uid: Option<Uid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            kind,
            revert,
            module: module.into(),
            uid,
            created_at: Utc::now(),
            failed: false,
        }
    }

    pub fn is_revertible(&self) -> bool {
        self.revert.is_some()
    }
}

impl fmt::Display for TamperRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.path, self.module)?;
        if self.failed {
            write!(f, " [revert failed]")?;
        }
        Ok(())
    }
}

/// Result of `revert`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevertOutcome {
    /// Undone and removed from the ledger.
    Reverted,
    /// The target no longer matches the record; the record is kept, marked failed.
    Mismatch(String),
    /// The record declares no revert action.
    NotRevertible,
    /// No such record (never existed or already reverted).
    Unknown,
}

/// Undo the change recorded under `id`.
pub async fn revert(
    platform: &dyn Platform,
    store: &TargetStore,
    id: Uuid,
) -> Result<RevertOutcome> {
    let Some(record) = store.tamper_record(id).await else {
        return Ok(RevertOutcome::Unknown);
    };
    let Some(action) = &record.revert else {
        return Ok(RevertOutcome::NotRevertible);
    };

    match apply(platform, action).await {
        Ok(()) => {
            store.remove_tamper(id).await?;
            info!(id = %id, path = %record.path, "reverted tamper");
            Ok(RevertOutcome::Reverted)
        }
        Err(Mismatch(reason)) => {
            warn!(id = %id, path = %record.path, %reason, "target no longer matches tamper record");
            store.mark_tamper_failed(id).await?;
            Ok(RevertOutcome::Mismatch(reason))
        }
        Err(Failed(e)) => Err(e),
    }
}

enum ApplyError {
    Mismatch(String),
    Failed(Error),
}
use ApplyError::{Failed, Mismatch};

impl From<Error> for ApplyError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(p) => Mismatch(format!("{} no longer exists", p)),
            Error::NotADirectory(p) => Mismatch(format!("{} is not a directory", p)),
            other => Failed(other),
        }
    }
}

async fn apply(platform: &dyn Platform, action: &RevertAction) -> std::result::Result<(), ApplyError> {
    match action {
        RevertAction::RemoveFile { path } => {
            let st = platform.lstat(path).await?;
            if st.is_dir() {
                return Err(Mismatch(format!("{} is now a directory", path)));
            }
            platform.unlink(path, false).await?;
        }
        RevertAction::RemoveDirectory { path } => {
            platform.rmdir(path).await?;
        }
        RevertAction::RestoreMode { path, mode } => {
            platform.chmod(path, *mode).await?;
        }
        RevertAction::RestoreFile { path, content } => {
            let original = BASE64
                .decode(content)
                .map_err(|e| Failed(Error::Store(format!("corrupt tamper record: {}", e))))?;
            platform.write_bytes(path, &original).await?;
        }
        RevertAction::RemoveLine { path, line } => {
            let current = platform.read_bytes(path).await?;
            let text = String::from_utf8_lossy(&current);
            let Some(updated) = remove_line(&text, line) else {
                return Err(Mismatch(format!("line no longer present in {}", path)));
            };
            platform.write_bytes(path, updated.as_bytes()).await?;
        }
    }
    Ok(())
}

/// Drop the first line equal to `line`. `None` when there is no such line.
pub fn remove_line(text: &str, line: &str) -> Option<String> {
    let mut found = false;
    let mut out = String::with_capacity(text.len());
    for l in text.split_inclusive('\n') {
        if !found && l.trim_end_matches(['\n', '\r']) == line {
            found = true;
            continue;
        }
        out.push_str(l);
    }
    found.then_some(out)
}
