//! RemoteFile: a byte stream over a file on the target.
//!
//! Backed by a command (`cat`, `cat >`) whose pipe is the stream. `close()`
//! finishes the transfer and reports errors; dropping without closing kills
//! the backing command, so the remote side is released on every exit path.

use crate::platform::OpenMode;
use crate::process::ProcessHandle;
use crate::transport::{BoxReader, BoxWriter};
use foothold_core::{Error, Result};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub struct RemoteFile {
    path: String,
    mode: OpenMode,
    handle: ProcessHandle,
    reader: Option<BoxReader>,
    writer: Option<BoxWriter>,
}

impl RemoteFile {
    pub(crate) fn new(path: String, mode: OpenMode, mut handle: ProcessHandle) -> Self {
        let (reader, writer) = match mode {
            OpenMode::Read => (handle.take_stdout(), None),
            OpenMode::Write | OpenMode::Append => (None, handle.take_stdin()),
        };
        Self {
            path,
            mode,
            handle,
            reader,
            writer,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Finish the transfer and surface any error the remote side reported.
    pub async fn close(mut self) -> Result<()> {
        if let Some(mut w) = self.writer.take() {
            w.shutdown()
                .await
                .map_err(|e| Error::channel(format!("{}: {}", self.path, e)))?;
        }
        // Unread remainder in read mode: discard it so the command can exit.
        if let Some(mut r) = self.reader.take() {
            let mut sink = Vec::new();
            let _ = r.read_to_end(&mut sink).await;
        }
        let mut stderr = String::new();
        if let Some(mut e) = self.handle.take_stderr() {
            let _ = e.read_to_string(&mut stderr).await;
        }
        let code = self.handle.wait().await?;
        if code == 0 {
            Ok(())
        } else {
            Err(classify_fs_error(&self.path, &stderr))
        }
    }
}

impl AsyncRead for RemoteFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.reader.as_mut() {
            Some(r) => Pin::new(r).poll_read(cx, buf),
            None => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "file not opened for reading",
            ))),
        }
    }
}

impl AsyncWrite for RemoteFile {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.writer.as_mut() {
            Some(w) => Pin::new(w).poll_write(cx, buf),
            None => Poll::Ready(Err(not_writable())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.writer.as_mut() {
            Some(w) => Pin::new(w).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.writer.as_mut() {
            Some(w) => Pin::new(w).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

fn not_writable() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "file not opened for writing",
    )
}

/// Map a coreutils-style error message to a semantic error.
pub fn classify_fs_error(path: &str, stderr: &str) -> Error {
    let msg = stderr.trim();
    if msg.contains("No such file or directory") {
        Error::NotFound(path.to_string())
    } else if msg.contains("Permission denied") || msg.contains("Operation not permitted") {
        Error::PermissionDenied(path.to_string())
    } else if msg.contains("File exists") {
        Error::AlreadyExists(path.to_string())
    } else if msg.contains("Not a directory") {
        Error::NotADirectory(path.to_string())
    } else if msg.is_empty() {
        Error::fs(path, "operation failed")
    } else {
        Error::fs(path, msg.lines().last().unwrap_or(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_messages() {
        assert!(matches!(
            classify_fs_error("/x", "cat: /x: No such file or directory\n"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            classify_fs_error("/x", "mkdir: cannot create directory '/x': File exists"),
            Error::AlreadyExists(_)
        ));
        assert!(matches!(
            classify_fs_error("/x", "rm: cannot remove '/x': Permission denied"),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(classify_fs_error("/x", ""), Error::Fs { .. }));
    }
}
