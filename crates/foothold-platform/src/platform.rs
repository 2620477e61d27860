//! The Platform trait: one remote OS session behind a single interface.
//!
//! Everything above this layer (modules, the fact engine, the ledger) talks to
//! a target only through `dyn Platform`. There is one implementation per
//! operating-system family; see [`crate::linux::Linux`].

use crate::file::RemoteFile;
use crate::identity::{Group, IdQuery, User};
use crate::process::{CompletedProcess, ProcessHandle, RunOptions, SpawnOptions};
use async_trait::async_trait;
use foothold_core::{Error, PlatformKind, Result, TargetId, Uid};
use serde::{Deserialize, Serialize};

/// How `open` should treat the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate.
    Write,
    /// Create or append.
    Append,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Other,
}

/// Result of `stat` / `lstat`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Full `st_mode`, type bits included.
    pub mode: u32,
    pub size: u64,
    pub uid: Uid,
    pub gid: u32,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    pub file_type: FileType,
}

impl Stat {
    /// Permission bits including setuid/setgid/sticky.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    pub fn is_setuid(&self) -> bool {
        self.mode & 0o4000 != 0
    }

    pub fn file_type_from_mode(mode: u32) -> FileType {
        match mode & 0o170000 {
            0o100000 => FileType::File,
            0o040000 => FileType::Directory,
            0o120000 => FileType::Symlink,
            _ => FileType::Other,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MkdirOptions {
    /// Create missing parents.
    pub parents: bool,
    /// Succeed when the directory already exists.
    pub exist_ok: bool,
}

impl MkdirOptions {
    pub fn recursive() -> Self {
        Self {
            parents: true,
            exist_ok: true,
        }
    }
}

/// Options for `sudo`.
#[derive(Clone, Debug, Default)]
pub struct SudoOptions {
    /// Run as this user (default root).
    pub user: Option<String>,
    pub group: Option<String>,
    /// Password for the *current* user. Without one sudo runs non-interactively.
    pub password: Option<String>,
    pub run: RunOptions,
}

/// One source file for `compile`.
#[derive(Clone, Debug)]
pub struct CompileSource {
    pub name: String,
    pub content: Vec<u8>,
}

impl CompileSource {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// One remote OS session.
///
/// All operations await remote I/O. Errors come in three families: channel
/// (`Error::Channel`, the session is gone), command (`CommandFailed`,
/// `Timeout`, `AuthenticationFailed`) and semantic (`NotFound`,
/// `AlreadyExists`, `PermissionDenied`, ...).
#[async_trait]
pub trait Platform: Send + Sync {
    fn kind(&self) -> PlatformKind;

    /// Description of the channel (`local`, `ssh://...`).
    fn describe(&self) -> String;

    // --- processes ---

    /// Run a command to completion.
    async fn run(&self, argv: &[&str], options: RunOptions) -> Result<CompletedProcess>;

    /// Start a command and return immediately.
    async fn spawn(&self, argv: &[&str], options: SpawnOptions) -> Result<ProcessHandle>;

    // --- files ---

    async fn open(&self, path: &str, mode: OpenMode) -> Result<RemoteFile>;
    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>>;
    async fn write_bytes(&self, path: &str, data: &[u8]) -> Result<()>;
    async fn stat(&self, path: &str) -> Result<Stat>;
    async fn lstat(&self, path: &str) -> Result<Stat>;
    async fn chmod(&self, path: &str, mode: u32) -> Result<()>;
    async fn chown(&self, path: &str, uid: Uid, gid: u32) -> Result<()>;
    async fn mkdir(&self, path: &str, options: MkdirOptions) -> Result<()>;
    async fn rmdir(&self, path: &str) -> Result<()>;
    async fn unlink(&self, path: &str, missing_ok: bool) -> Result<()>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    /// Create a symbolic link at `link` pointing to `target`.
    async fn symlink_to(&self, link: &str, target: &str) -> Result<()>;
    /// Create a hard link at `link` to `target`.
    async fn link_to(&self, link: &str, target: &str) -> Result<()>;
    async fn readlink(&self, path: &str) -> Result<String>;
    /// Entry names in a directory, without `.` and `..`.
    async fn listdir(&self, path: &str) -> Result<Vec<String>>;

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.lstat(path).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // --- identity ---

    /// Effective uid, cached until `refresh_uid`.
    async fn getuid(&self) -> Result<Uid>;
    /// Forget the cached uid (after sudo/su or any other privilege change).
    fn refresh_uid(&self);
    async fn whoami(&self) -> Result<String>;
    async fn getenv(&self, name: &str) -> Result<Option<String>>;
    /// Stable identity of the host.
    async fn fingerprint(&self) -> Result<TargetId>;
    async fn users(&self) -> Result<Vec<User>>;
    async fn groups(&self) -> Result<Vec<Group>>;

    async fn find_user(&self, query: IdQuery) -> Result<Option<User>> {
        Ok(self.users().await?.into_iter().find(|u| u.matches(&query)))
    }

    async fn find_group(&self, query: IdQuery) -> Result<Option<Group>> {
        Ok(self.groups().await?.into_iter().find(|g| g.matches(&query)))
    }

    // --- privilege change ---

    async fn sudo(&self, argv: &[&str], options: SudoOptions) -> Result<CompletedProcess>;
    async fn su(&self, user: &str, password: &str, argv: &[&str]) -> Result<CompletedProcess>;

    // --- tools ---

    /// Resolve a binary on the target's PATH. Not found is `Ok(None)`.
    async fn which(&self, name: &str) -> Result<Option<String>>;

    /// Build C sources into a runnable artifact at `output`.
    async fn compile(&self, sources: &[CompileSource], output: &str, flags: &[&str])
        -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_bits() {
        assert_eq!(Stat::file_type_from_mode(0o100755), FileType::File);
        assert_eq!(Stat::file_type_from_mode(0o040755), FileType::Directory);
        assert_eq!(Stat::file_type_from_mode(0o120777), FileType::Symlink);
        assert_eq!(Stat::file_type_from_mode(0o020666), FileType::Other);
    }

    #[test]
    fn setuid_bit() {
        let st = Stat {
            mode: 0o104755,
            size: 0,
            uid: 0,
            gid: 0,
            mtime: 0,
            file_type: FileType::File,
        };
        assert!(st.is_setuid());
        assert_eq!(st.permissions(), 0o4755);
    }
}
