//! Transport: the duplex channel to a command interpreter on the target.
//!
//! How the bytes reach the target (reverse shell, ssh, bind socket) is not
//! foothold's concern. A transport only knows how to start one command and
//! hand back its pipes plus a control handle. Everything above it (process
//! semantics, file operations, identity) lives in the platform layer.

use async_trait::async_trait;
use foothold_core::{Error, Result};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A command to start on the target.
#[derive(Clone, Debug, Default)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    /// Open a pipe to the command's stdin. Otherwise stdin is empty.
    pub stdin: bool,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
}

impl ExecRequest {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Default::default()
        }
    }

    pub fn with_stdin(mut self) -> Self {
        self.stdin = true;
        self
    }
}

/// Lifecycle control of one started command.
#[async_trait]
pub trait ProcessControl: Send {
    /// Wait for exit and return the exit code. Signals map to `128 + signo`.
    async fn wait(&mut self) -> Result<i32>;

    /// Ask the command to stop (SIGINT / Ctrl-C).
    async fn interrupt(&mut self) -> Result<()>;

    /// Force the command to stop.
    async fn kill(&mut self) -> Result<()>;

    /// Best-effort, non-blocking kill used from `Drop`.
    fn start_kill(&mut self);
}

/// A started command: its pipes and its control handle.
pub struct RemoteProcess {
    pub stdout: Option<BoxReader>,
    pub stderr: Option<BoxReader>,
    pub stdin: Option<BoxWriter>,
    pub control: Box<dyn ProcessControl>,
}

/// Pluggable channel to the target.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable description (`local`, `ssh://host`, ...).
    fn describe(&self) -> String;

    /// Start a command. A command the interpreter cannot find is not a
    /// transport failure: it exits 127 like it would in a shell.
    async fn exec(&self, request: ExecRequest) -> Result<RemoteProcess>;
}

// ---------------------------------------------------------------------------
// Local transport
// ---------------------------------------------------------------------------

/// Runs commands on the operator's own machine through `tokio::process`.
///
/// Useful for exercising the engine end to end and for local privilege
/// checks; the "remote" target is simply this host.
#[derive(Clone, Debug, Default)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn describe(&self) -> String {
        "local".into()
    }

    async fn exec(&self, request: ExecRequest) -> Result<RemoteProcess> {
        let Some((program, args)) = request.argv.split_first() else {
            return Err(Error::invalid_argument("argv", "empty command"));
        };
        debug!(argv = ?request.argv, "local exec");

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if request.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        for (k, v) in &request.env {
            command.env(k, v);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(not_found_process(program));
            }
            Err(e) => return Err(Error::channel(format!("failed to spawn {}: {}", program, e))),
        };

        Ok(RemoteProcess {
            stdout: child.stdout.take().map(|s| Box::new(s) as BoxReader),
            stderr: child.stderr.take().map(|s| Box::new(s) as BoxReader),
            stdin: child.stdin.take().map(|s| Box::new(s) as BoxWriter),
            control: Box::new(LocalControl { child }),
        })
    }
}

struct LocalControl {
    child: tokio::process::Child,
}

#[async_trait]
impl ProcessControl for LocalControl {
    async fn wait(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| Error::channel(format!("wait failed: {}", e)))?;
        Ok(exit_code(&status))
    }

    async fn interrupt(&mut self) -> Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(()); // already reaped
        };
        let status = tokio::process::Command::new("kill")
            .args(["-s", "INT", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::channel(format!("interrupt failed: {}", e)))?;
        if !status.success() {
            debug!(pid, "interrupt: process already gone");
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already exited.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(Error::channel(format!("kill failed: {}", e))),
        }
    }

    fn start_kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

/// What a shell does with an unknown command: print to stderr, exit 127.
fn not_found_process(program: &str) -> RemoteProcess {
    let message = format!("sh: {}: command not found\n", program);
    RemoteProcess {
        stdout: Some(Box::new(std::io::Cursor::new(Vec::new()))),
        stderr: Some(Box::new(std::io::Cursor::new(message.into_bytes()))),
        stdin: None,
        control: Box::new(ExitedControl(127)),
    }
}

/// Control for a command that has already finished.
pub(crate) struct ExitedControl(pub i32);

#[async_trait]
impl ProcessControl for ExitedControl {
    async fn wait(&mut self) -> Result<i32> {
        Ok(self.0)
    }
    async fn interrupt(&mut self) -> Result<()> {
        Ok(())
    }
    async fn kill(&mut self) -> Result<()> {
        Ok(())
    }
    fn start_kill(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn local_exec_captures_stdout() {
        let t = LocalTransport::new();
        let mut p = t
            .exec(ExecRequest::new(vec!["echo".into(), "hello".into()]))
            .await
            .unwrap();
        let mut out = String::new();
        p.stdout.take().unwrap().read_to_string(&mut out).await.unwrap();
        assert_eq!(out.trim(), "hello");
        assert_eq!(p.control.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn local_exec_missing_binary_exits_127() {
        let t = LocalTransport::new();
        let mut p = t
            .exec(ExecRequest::new(vec!["definitely-not-a-binary-xyz".into()]))
            .await
            .unwrap();
        let mut err = String::new();
        p.stderr.take().unwrap().read_to_string(&mut err).await.unwrap();
        assert!(err.contains("command not found"));
        assert_eq!(p.control.wait().await.unwrap(), 127);
    }

    #[tokio::test]
    async fn local_exec_empty_argv_rejected() {
        let t = LocalTransport::new();
        let err = t.exec(ExecRequest::new(vec![])).await.err().unwrap();
        assert!(!err.is_fatal_to_session());
    }
}
