//! foothold platform: remote processes, files and identity over a transport

pub mod file;
pub mod identity;
pub mod linux;
pub mod mock;
pub mod path;
pub mod platform;
pub mod process;
pub mod transport;

pub use file::RemoteFile;
pub use identity::{Group, IdQuery, User};
pub use linux::Linux;
pub use mock::{MockResponse, MockTransport};
pub use path::RemotePath;
pub use platform::{
    CompileSource, FileType, MkdirOptions, OpenMode, Platform, Stat, SudoOptions,
};
pub use process::{
    shell_join, shell_quote, CompletedProcess, ProcessHandle, RunOptions, SpawnOptions,
};
pub use transport::{ExecRequest, LocalTransport, ProcessControl, RemoteProcess, Transport};
