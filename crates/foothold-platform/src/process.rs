//! Process execution on top of a transport: `run` options, completed output,
//! and the streaming [`ProcessHandle`] returned by `spawn`.
//!
//! Output pipes are always drained by independent reader tasks, so a command
//! that fills both stdout and stderr never blocks on a full pipe while we wait
//! on the other one. On timeout or cancellation the process is interrupted,
//! given a grace period, killed, and whatever output already arrived is kept.

use crate::transport::{BoxReader, BoxWriter, ProcessControl, RemoteProcess};
use foothold_core::{Error, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long readers may keep going after the process is gone. A grandchild
/// that inherited the pipes can hold them open indefinitely.
const DRAIN_AFTER_EXIT: Duration = Duration::from_secs(2);
const DRAIN_AFTER_KILL: Duration = Duration::from_millis(250);

/// Options for `Platform::run`.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub capture_stdout: bool,
    pub capture_stderr: bool,
    /// `None` uses the platform default.
    pub timeout: Option<Duration>,
    /// Non-zero exit becomes `Error::CommandFailed`.
    pub check: bool,
    pub input: Option<Vec<u8>>,
    pub cancel: Option<CancellationToken>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            capture_stdout: true,
            capture_stderr: true,
            timeout: None,
            check: false,
            input: None,
            cancel: None,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checked(mut self) -> Self {
        self.check = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn input(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.input = Some(data.into());
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn discard_stdout(mut self) -> Self {
        self.capture_stdout = false;
        self
    }

    pub fn discard_stderr(mut self) -> Self {
        self.capture_stderr = false;
        self
    }
}

/// Options for `Platform::spawn`.
#[derive(Clone, Debug, Default)]
pub struct SpawnOptions {
    /// Open a writable stdin.
    pub stdin: bool,
    pub cancel: Option<CancellationToken>,
}

impl SpawnOptions {
    pub fn with_stdin(mut self) -> Self {
        self.stdin = true;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Output of a command that ran to completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedProcess {
    pub argv: Vec<String>,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CompletedProcess {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Non-empty stdout lines, trimmed of trailing whitespace.
    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout_text()
            .lines()
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// Turn a non-zero exit into `Error::CommandFailed`.
    pub fn check(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::CommandFailed {
                command: shell_join(&self.argv),
                exit_code: self.exit_code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

enum WaitOutcome {
    Exited(i32),
    TimedOut,
    Cancelled,
}

/// One pipe being read to the end by its own task.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl Drain {
    fn start(reader: Option<BoxReader>, capture: bool) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = reader.map(|mut reader| {
            let buf = buf.clone();
            tokio::spawn(async move {
                let mut chunk = vec![0u8; 16 * 1024];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if capture {
                                if let Ok(mut b) = buf.lock() {
                                    b.extend_from_slice(&chunk[..n]);
                                }
                            }
                        }
                        Err(e) => {
                            debug!("pipe read ended: {}", e);
                            break;
                        }
                    }
                }
            })
        });
        Self { buf, task }
    }

    /// Wait for the reader up to `within`, then return what it collected.
    async fn finish(mut self, within: Duration) -> Vec<u8> {
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(within, task).await.is_err() {
                warn!("output pipe still open after process exit; abandoning reader");
                abort.abort();
            }
        }
        let data = match self.buf.lock() {
            Ok(mut b) => std::mem::take(&mut *b),
            Err(_) => Vec::new(),
        };
        data
    }
}

/// A running command started by `Platform::spawn`.
///
/// Dropping a handle whose process has not been waited for kills the process.
pub struct ProcessHandle {
    argv: Vec<String>,
    stdout: Option<BoxReader>,
    stderr: Option<BoxReader>,
    stdin: Option<BoxWriter>,
    control: Box<dyn ProcessControl>,
    grace: Duration,
    cancel: Option<CancellationToken>,
    exit_code: Option<i32>,
    stdout_lines: Option<tokio::io::Lines<BufReader<BoxReader>>>,
    stderr_lines: Option<tokio::io::Lines<BufReader<BoxReader>>>,
}

impl ProcessHandle {
    pub fn new(
        argv: Vec<String>,
        process: RemoteProcess,
        grace: Duration,
        cancel: Option<CancellationToken>,
    ) -> Self {
        Self {
            argv,
            stdout: process.stdout,
            stderr: process.stderr,
            stdin: process.stdin,
            control: process.control,
            grace,
            cancel,
            exit_code: None,
            stdout_lines: None,
            stderr_lines: None,
        }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Exit code, once the process has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Raw stdout byte stream. Taking it disables line iteration.
    pub fn take_stdout(&mut self) -> Option<BoxReader> {
        self.stdout.take()
    }

    /// Raw stderr byte stream. Taking it disables line iteration.
    pub fn take_stderr(&mut self) -> Option<BoxReader> {
        self.stderr.take()
    }

    pub fn take_stdin(&mut self) -> Option<BoxWriter> {
        self.stdin.take()
    }

    /// Lazily iterate stdout as a stream of lines.
    pub fn stdout_lines(&mut self) -> Option<LinesStream<BufReader<BoxReader>>> {
        self.stdout
            .take()
            .map(|r| LinesStream::new(BufReader::new(r).lines()))
    }

    /// Next line of stdout, `None` at end of stream.
    ///
    /// Reading one stream only is safe for commands with modest stderr; use
    /// [`communicate`](Self::communicate) when both streams may be large.
    pub async fn next_stdout_line(&mut self) -> Result<Option<String>> {
        if self.stdout_lines.is_none() {
            match self.stdout.take() {
                Some(r) => self.stdout_lines = Some(BufReader::new(r).lines()),
                None => return Ok(None),
            }
        }
        match self.stdout_lines.as_mut() {
            Some(lines) => lines.next_line().await.map_err(pipe_error),
            None => Ok(None),
        }
    }

    /// Next line of stderr, `None` at end of stream.
    pub async fn next_stderr_line(&mut self) -> Result<Option<String>> {
        if self.stderr_lines.is_none() {
            match self.stderr.take() {
                Some(r) => self.stderr_lines = Some(BufReader::new(r).lines()),
                None => return Ok(None),
            }
        }
        match self.stderr_lines.as_mut() {
            Some(lines) => lines.next_line().await.map_err(pipe_error),
            None => Ok(None),
        }
    }

    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<()> {
        match self.stdin.as_mut() {
            Some(w) => {
                w.write_all(data).await.map_err(pipe_error)?;
                w.flush().await.map_err(pipe_error)
            }
            None => Err(Error::channel("stdin is not open")),
        }
    }

    /// Close stdin so the command sees end of input.
    pub async fn close_stdin(&mut self) -> Result<()> {
        if let Some(mut w) = self.stdin.take() {
            w.shutdown().await.map_err(pipe_error)?;
        }
        Ok(())
    }

    /// Wait for exit without draining output.
    pub async fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let code = self.control.wait().await?;
        self.exit_code = Some(code);
        Ok(code)
    }

    /// Interrupt, wait out the grace period, then kill. Returns the exit code.
    pub async fn terminate(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        if let Err(e) = self.control.interrupt().await {
            debug!("interrupt failed: {}", e);
        }
        let code = match tokio::time::timeout(self.grace, self.control.wait()).await {
            Ok(Ok(code)) => code,
            _ => {
                debug!(argv = ?self.argv, "process ignored interrupt; killing");
                self.control.kill().await?;
                self.control.wait().await?
            }
        };
        self.exit_code = Some(code);
        Ok(code)
    }

    /// Feed `input`, drain both output streams concurrently and wait for exit.
    pub async fn communicate(mut self, input: Option<Vec<u8>>) -> Result<CompletedProcess> {
        let cancel = self.cancel.clone();
        self.communicate_inner(input, None, cancel, true, true).await
    }

    /// `communicate` bounded by a timeout. On expiry the process is terminated
    /// and `Error::Timeout` carries the partial output.
    pub async fn communicate_timeout(
        mut self,
        input: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<CompletedProcess> {
        let cancel = self.cancel.clone();
        self.communicate_inner(input, Some(timeout), cancel, true, true)
            .await
    }

    pub(crate) async fn communicate_inner(
        &mut self,
        input: Option<Vec<u8>>,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
        capture_stdout: bool,
        capture_stderr: bool,
    ) -> Result<CompletedProcess> {
        let out = Drain::start(self.stdout.take(), capture_stdout);
        let err = Drain::start(self.stderr.take(), capture_stderr);

        let stdin = self.stdin.take();
        let feeder = tokio::spawn(async move {
            if let Some(mut w) = stdin {
                if let Some(data) = input {
                    if let Err(e) = w.write_all(&data).await {
                        debug!("stdin write ended early: {}", e);
                    }
                }
                let _ = w.shutdown().await;
            }
        });

        let outcome = self.wait_bounded(timeout, cancel.as_ref()).await;
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                feeder.abort();
                return Err(e);
            }
        };

        match outcome {
            WaitOutcome::Exited(code) => {
                self.exit_code = Some(code);
                let _ = feeder.await;
                Ok(CompletedProcess {
                    argv: self.argv.clone(),
                    exit_code: code,
                    stdout: out.finish(DRAIN_AFTER_EXIT).await,
                    stderr: err.finish(DRAIN_AFTER_EXIT).await,
                })
            }
            WaitOutcome::TimedOut | WaitOutcome::Cancelled => {
                feeder.abort();
                self.terminate().await?;
                let stdout = out.finish(DRAIN_AFTER_KILL).await;
                let stderr = err.finish(DRAIN_AFTER_KILL).await;
                if matches!(outcome, WaitOutcome::Cancelled) {
                    return Err(Error::Cancelled);
                }
                let secs = timeout.map(|d| d.as_secs()).unwrap_or_default();
                warn!(argv = ?self.argv, secs, "command timed out");
                Err(Error::Timeout {
                    command: shell_join(&self.argv),
                    secs,
                    stdout,
                    stderr,
                })
            }
        }
    }

    async fn wait_bounded(
        &mut self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<WaitOutcome> {
        let control = &mut self.control;
        let timed = async move {
            match timeout {
                Some(d) => tokio::time::timeout(d, control.wait()).await.ok(),
                None => Some(control.wait().await),
            }
        };
        let cancelled = async move {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            r = timed => match r {
                Some(Ok(code)) => Ok(WaitOutcome::Exited(code)),
                Some(Err(e)) => Err(e),
                None => Ok(WaitOutcome::TimedOut),
            },
            _ = cancelled => Ok(WaitOutcome::Cancelled),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            self.control.start_kill();
        }
    }
}

fn pipe_error(e: std::io::Error) -> Error {
    Error::channel(format!("pipe: {}", e))
}

/// Quote one word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Render an argv as a single shell command line.
pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("ls"), "ls");
        assert_eq!(shell_quote("/etc/passwd"), "/etc/passwd");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_join(&["echo", "hello world"]), "echo 'hello world'");
    }

    #[test]
    fn completed_process_check() {
        let ok = CompletedProcess {
            argv: vec!["true".into()],
            exit_code: 0,
            stdout: b"a\n\nb  \n".to_vec(),
            stderr: vec![],
        };
        assert_eq!(ok.stdout_lines(), vec!["a", "b"]);
        assert!(ok.clone().check().is_ok());

        let bad = CompletedProcess { exit_code: 2, ..ok };
        match bad.check() {
            Err(Error::CommandFailed { exit_code, command, .. }) => {
                assert_eq!(exit_code, 2);
                assert_eq!(command, "true");
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }
}
