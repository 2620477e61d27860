//! Scripted transport for tests.
//!
//! Commands are matched by their argv joined with single spaces. Exact rules
//! win over prefix rules; among rules of the same kind the one registered last
//! wins. Anything unmatched behaves like a missing binary (exit 127).

use crate::transport::{BoxReader, BoxWriter, ExecRequest, ProcessControl, RemoteProcess, Transport};
use async_trait::async_trait;
use foothold_core::{Error, Result};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// What a scripted command does.
#[derive(Clone, Debug, Default)]
pub struct MockResponse {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    /// Keep running this long before exiting.
    pub delay: Option<Duration>,
    /// Survive SIGINT; only `kill` ends the delay.
    pub ignore_interrupt: bool,
    /// Fail at `exec` as if the channel dropped.
    pub channel_error: bool,
}

impl MockResponse {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn channel_error() -> Self {
        Self {
            channel_error: true,
            ..Default::default()
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_exit(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn ignoring_interrupt(mut self) -> Self {
        self.ignore_interrupt = true;
        self
    }
}

struct Rule {
    pattern: String,
    prefix: bool,
    response: MockResponse,
}

/// One recorded `exec`.
#[derive(Clone, Debug)]
pub struct MockCall {
    pub command: String,
    stdin: Arc<Mutex<Vec<u8>>>,
}

impl MockCall {
    /// Everything written to the command's stdin so far.
    pub fn stdin(&self) -> Vec<u8> {
        self.stdin.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

#[derive(Default)]
pub struct MockTransport {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script an exact command line.
    pub fn on(&self, command: &str, response: MockResponse) -> &Self {
        self.push(command, false, response)
    }

    /// Script every command line starting with `prefix`.
    pub fn on_prefix(&self, prefix: &str, response: MockResponse) -> &Self {
        self.push(prefix, true, response)
    }

    /// Identity and fingerprint answers for an ordinary Linux host.
    pub fn with_host(&self, hostname: &str, uid: u32, user: &str) -> &Self {
        self.on("id -u", MockResponse::ok(format!("{}\n", uid)));
        self.on("id -un", MockResponse::ok(format!("{}\n", user)));
        self.on_prefix(
            "/bin/sh -c cat /etc/machine-id",
            MockResponse::ok(format!("{}-machine-id\n{}\nx86_64\n", hostname, hostname)),
        )
    }

    fn push(&self, pattern: &str, prefix: bool, response: MockResponse) -> &Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                pattern: pattern.to_string(),
                prefix,
                response,
            });
        }
        self
    }

    fn lookup(&self, command: &str) -> Option<MockResponse> {
        let rules = self.rules.lock().ok()?;
        rules
            .iter()
            .rev()
            .find(|r| !r.prefix && r.pattern == command)
            .or_else(|| {
                rules
                    .iter()
                    .rev()
                    .find(|r| r.prefix && command.starts_with(&r.pattern))
            })
            .map(|r| r.response.clone())
    }

    /// Command lines executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|c| c.iter().map(|c| c.command.clone()).collect())
            .unwrap_or_default()
    }

    /// How many executed command lines start with `prefix`.
    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// The most recent call whose command line starts with `prefix`.
    pub fn last_call(&self, prefix: &str) -> Option<MockCall> {
        self.calls
            .lock()
            .ok()?
            .iter()
            .rev()
            .find(|c| c.command.starts_with(prefix))
            .cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn describe(&self) -> String {
        "mock".into()
    }

    async fn exec(&self, request: ExecRequest) -> Result<RemoteProcess> {
        if request.argv.is_empty() {
            return Err(Error::invalid_argument("argv", "empty command"));
        }
        let command = request.argv.join(" ");
        let stdin_buf = Arc::new(Mutex::new(Vec::new()));
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(MockCall {
                command: command.clone(),
                stdin: stdin_buf.clone(),
            });
        }

        let response = self.lookup(&command).unwrap_or_else(|| {
            MockResponse::exit(127)
                .with_stderr(format!("sh: {}: command not found\n", request.argv[0]))
        });
        if response.channel_error {
            return Err(Error::channel(format!("mock channel dropped during `{}`", command)));
        }

        let stdin = request
            .stdin
            .then(|| Box::new(CaptureWriter(stdin_buf)) as BoxWriter);
        Ok(RemoteProcess {
            stdout: Some(Box::new(std::io::Cursor::new(response.stdout)) as BoxReader),
            stderr: Some(Box::new(std::io::Cursor::new(response.stderr)) as BoxReader),
            stdin,
            control: Box::new(MockControl {
                exit_code: response.exit_code,
                delay: response.delay,
                ignore_interrupt: response.ignore_interrupt,
                stop: CancellationToken::new(),
                stopped_with: None,
            }),
        })
    }
}

struct MockControl {
    exit_code: i32,
    delay: Option<Duration>,
    ignore_interrupt: bool,
    stop: CancellationToken,
    stopped_with: Option<i32>,
}

impl MockControl {
    fn stop(&mut self, code: i32) {
        if self.stopped_with.is_none() {
            self.stopped_with = Some(code);
        }
        self.stop.cancel();
    }
}

#[async_trait]
impl ProcessControl for MockControl {
    async fn wait(&mut self) -> Result<i32> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.cancelled() => {}
            }
        }
        Ok(self.stopped_with.unwrap_or(self.exit_code))
    }

    async fn interrupt(&mut self) -> Result<()> {
        if !self.ignore_interrupt {
            self.stop(130);
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.stop(137);
        Ok(())
    }

    fn start_kill(&mut self) {
        self.stop(137);
    }
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for CaptureWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if let Ok(mut b) = self.0.lock() {
            b.extend_from_slice(buf);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
