//! Path objects bound to a platform.

use crate::file::RemoteFile;
use crate::platform::{MkdirOptions, OpenMode, Platform, Stat};
use foothold_core::Result;
use std::fmt;
use std::ops::Div;
use std::sync::Arc;

/// A POSIX path on the target. Filesystem helpers forward to the platform
/// the path was created from.
#[derive(Clone)]
pub struct RemotePath {
    platform: Arc<dyn Platform>,
    path: String,
}

impl RemotePath {
    pub fn new(platform: Arc<dyn Platform>, path: impl Into<String>) -> Self {
        Self {
            platform,
            path: normalize(&path.into()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn is_absolute(&self) -> bool {
        self.path.starts_with('/')
    }

    pub fn join(&self, part: &str) -> Self {
        let path = if part.starts_with('/') {
            part.to_string()
        } else if self.path.ends_with('/') {
            format!("{}{}", self.path, part)
        } else {
            format!("{}/{}", self.path, part)
        };
        Self::new(self.platform.clone(), path)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.path == "/" {
            return None;
        }
        match self.path.rfind('/') {
            Some(0) => Some(Self::new(self.platform.clone(), "/")),
            Some(i) => Some(Self::new(self.platform.clone(), &self.path[..i])),
            None => None,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        match self.path.rsplit('/').next() {
            Some("") | None => None,
            Some(name) => Some(name),
        }
    }

    pub async fn exists(&self) -> Result<bool> {
        self.platform.exists(&self.path).await
    }

    pub async fn stat(&self) -> Result<Stat> {
        self.platform.stat(&self.path).await
    }

    pub async fn is_dir(&self) -> Result<bool> {
        Ok(self.stat().await?.is_dir())
    }

    pub async fn read_bytes(&self) -> Result<Vec<u8>> {
        self.platform.read_bytes(&self.path).await
    }

    pub async fn read_text(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.read_bytes().await?).into_owned())
    }

    pub async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        self.platform.write_bytes(&self.path, data).await
    }

    pub async fn write_text(&self, text: &str) -> Result<()> {
        self.write_bytes(text.as_bytes()).await
    }

    pub async fn open(&self, mode: OpenMode) -> Result<RemoteFile> {
        self.platform.open(&self.path, mode).await
    }

    pub async fn mkdir(&self, options: MkdirOptions) -> Result<()> {
        self.platform.mkdir(&self.path, options).await
    }

    pub async fn chmod(&self, mode: u32) -> Result<()> {
        self.platform.chmod(&self.path, mode).await
    }

    pub async fn unlink(&self, missing_ok: bool) -> Result<()> {
        self.platform.unlink(&self.path, missing_ok).await
    }

    pub async fn listdir(&self) -> Result<Vec<RemotePath>> {
        Ok(self
            .platform
            .listdir(&self.path)
            .await?
            .iter()
            .map(|name| self.join(name))
            .collect())
    }
}

impl Div<&str> for &RemotePath {
    type Output = RemotePath;

    fn div(self, rhs: &str) -> RemotePath {
        self.join(rhs)
    }
}

impl Div<&str> for RemotePath {
    type Output = RemotePath;

    fn div(self, rhs: &str) -> RemotePath {
        self.join(rhs)
    }
}

impl PartialEq for RemotePath {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl fmt::Debug for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemotePath({:?})", self.path)
    }
}

/// Collapse duplicate separators and drop a trailing one.
fn normalize(path: &str) -> String {
    if path.is_empty() {
        return ".".into();
    }
    let absolute = path.starts_with('/');
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".into(),
        (false, false) => joined,
    }
}
