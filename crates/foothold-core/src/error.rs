//! Error types for foothold
//!
//! Every layer returns `foothold_core::Result`. The variants fall into a few
//! families (see [`ErrorKind`]) so callers can decide whether to retry, abort
//! the session, or treat the failure as an expected outcome.

use crate::types::PlatformKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // --- module / invocation ---
    #[error("module {module} failed: {reason}")]
    ModuleFailed { module: String, reason: String },

    #[error("module {module} does not support {actual} (supports: {expected})")]
    IncorrectPlatform {
        module: String,
        expected: String,
        actual: PlatformKind,
    },

    #[error("{module}: missing required argument: {name}")]
    MissingArgument { module: String, name: String },

    #[error("argument {name}: expected {expected}, got {value:?}")]
    ArgumentFormat {
        name: String,
        expected: String,
        value: String,
    },

    #[error("argument {name}: {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("invalid module {module}: {reason}")]
    InvalidModule { module: String, reason: String },

    #[error("circular dependency: {}", chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    #[error("cancelled")]
    Cancelled,

    // --- remote command ---
    #[error("command failed with exit code {exit_code}: {command}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    #[error("command timed out after {secs}s: {command}")]
    Timeout {
        command: String,
        secs: u64,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    #[error("authentication failed for user {user}")]
    AuthenticationFailed { user: String },

    #[error("build failed: {0}")]
    BuildFailed(String),

    // --- transport ---
    #[error("channel error: {0}")]
    Channel(String),

    // --- remote filesystem ---
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("{path}: {message}")]
    Fs { path: String, message: String },

    // --- local ---
    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The transport to the target broke. Fatal to the session.
    Channel,
    /// A remote command ran but did not succeed.
    Command,
    /// The remote system answered, but not with what was asked for.
    Semantic,
    /// Rejected before any module code ran.
    Validation,
    /// A module reported an expected failure.
    Module,
    /// The operator (or a timeout upstream) stopped the work.
    Cancelled,
    /// Local storage, configuration or serialization.
    Local,
}

impl Error {
    pub fn module_failed(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ModuleFailed {
            module: module.into(),
            reason: reason.into(),
        }
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel(message.into())
    }

    pub fn argument_format(
        name: impl Into<String>,
        expected: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::ArgumentFormat {
            name: name.into(),
            expected: expected.into(),
            value: value.into(),
        }
    }

    pub fn invalid_argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_module(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidModule {
            module: module.into(),
            reason: reason.into(),
        }
    }

    pub fn fs(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fs {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Channel(_) => ErrorKind::Channel,
            Self::CommandFailed { .. }
            | Self::Timeout { .. }
            | Self::AuthenticationFailed { .. }
            | Self::BuildFailed(_) => ErrorKind::Command,
            Self::NotFound(_)
            | Self::AlreadyExists(_)
            | Self::PermissionDenied(_)
            | Self::NotADirectory(_)
            | Self::Fs { .. } => ErrorKind::Semantic,
            Self::IncorrectPlatform { .. }
            | Self::MissingArgument { .. }
            | Self::ArgumentFormat { .. }
            | Self::InvalidArgument { .. }
            | Self::UnknownModule(_)
            | Self::InvalidModule { .. }
            | Self::CircularDependency { .. } => ErrorKind::Validation,
            Self::ModuleFailed { .. } => ErrorKind::Module,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Store(_) | Self::Config(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Local,
        }
    }

    /// Whether the session that produced this error can no longer be used.
    pub fn is_fatal_to_session(&self) -> bool {
        self.kind() == ErrorKind::Channel
    }

    /// Partial output carried by command-level failures.
    pub fn partial_output(&self) -> Option<(&[u8], &[u8])> {
        match self {
            Self::CommandFailed { stdout, stderr, .. } | Self::Timeout { stdout, stderr, .. } => {
                Some((stdout, stderr))
            }
            _ => None,
        }
    }
}
