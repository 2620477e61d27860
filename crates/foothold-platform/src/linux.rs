//! Linux platform: POSIX userland over any [`Transport`].

use crate::file::{classify_fs_error, RemoteFile};
use crate::identity::{parse_group, parse_passwd, Group, User};
use crate::platform::{
    CompileSource, MkdirOptions, OpenMode, Platform, Stat, SudoOptions,
};
use crate::process::{shell_join, shell_quote, CompletedProcess, ProcessHandle, RunOptions, SpawnOptions};
use crate::transport::{ExecRequest, Transport};
use async_trait::async_trait;
use foothold_core::config::PlatformConfig;
use foothold_core::{Error, PlatformKind, Result, TargetId, Uid};
use ring::digest;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Messages sudo prints when it refuses the credentials it was given.
const SUDO_AUTH_FAILURES: &[&str] = &[
    "incorrect password",
    "Sorry, try again",
    "a password is required",
    "is not in the sudoers file",
    "may not run sudo",
];

const SU_AUTH_FAILURES: &[&str] = &["Authentication failure", "incorrect password"];

/// Compilers tried by `compile`, in order.
const COMPILERS: &[&str] = &["gcc", "cc", "clang"];

pub struct Linux {
    transport: Arc<dyn Transport>,
    config: PlatformConfig,
    uid: Mutex<Option<Uid>>,
}

impl Linux {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, PlatformConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: PlatformConfig) -> Self {
        Self {
            transport,
            config,
            uid: Mutex::new(None),
        }
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.config.kill_grace_ms)
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.config.default_timeout_secs)
    }

    /// Run a shell snippet with positional arguments (`$1`, `$2`, ...).
    async fn sh(&self, script: &str, args: &[&str], options: RunOptions) -> Result<CompletedProcess> {
        let mut argv = vec![self.config.shell.as_str(), "-c", script, "sh"];
        argv.extend_from_slice(args);
        self.run(&argv, options).await
    }

    /// Run a filesystem command; a non-zero exit becomes a semantic error.
    async fn fs_op(&self, path: &str, argv: &[&str]) -> Result<()> {
        let out = self.run(argv, RunOptions::new()).await?;
        if out.success() {
            Ok(())
        } else {
            Err(classify_fs_error(path, &out.stderr_text()))
        }
    }

    async fn stat_inner(&self, path: &str, follow: bool) -> Result<Stat> {
        let mut argv = vec!["stat"];
        if follow {
            argv.push("-L");
        }
        argv.extend_from_slice(&["-c", "%f %s %u %g %Y", "--", path]);
        let out = self.run(&argv, RunOptions::new()).await?;
        if !out.success() {
            return Err(classify_fs_error(path, &out.stderr_text()));
        }
        parse_stat(path, &out.stdout_text())
    }

    async fn privileged_run(
        &self,
        argv: Vec<String>,
        options: RunOptions,
        failures: &[&str],
        user: &str,
    ) -> Result<CompletedProcess> {
        let check = options.check;
        let argv_ref: Vec<&str> = argv.iter().map(String::as_str).collect();
        let out = self
            .run(&argv_ref, RunOptions { check: false, ..options })
            .await?;
        let stderr = out.stderr_text();
        if !out.success() && failures.iter().any(|m| stderr.contains(m)) {
            warn!(user, "authentication failed");
            return Err(Error::AuthenticationFailed {
                user: user.to_string(),
            });
        }
        // The effective user may have changed underneath us.
        self.refresh_uid();
        if check {
            out.check()
        } else {
            Ok(out)
        }
    }
}

#[async_trait]
impl Platform for Linux {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Linux
    }

    fn describe(&self) -> String {
        format!("linux via {}", self.transport.describe())
    }

    async fn run(&self, argv: &[&str], options: RunOptions) -> Result<CompletedProcess> {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let timeout = options.timeout.unwrap_or_else(|| self.default_timeout());
        let mut request = ExecRequest::new(argv.clone());
        request.stdin = options.input.is_some();
        debug!(command = %shell_join(&argv), "run");

        let process = self.transport.exec(request).await?;
        let mut handle = ProcessHandle::new(argv, process, self.grace(), options.cancel.clone());
        let out = handle
            .communicate_inner(
                options.input,
                Some(timeout),
                options.cancel,
                options.capture_stdout,
                options.capture_stderr,
            )
            .await?;
        if options.check {
            out.check()
        } else {
            Ok(out)
        }
    }

    async fn spawn(&self, argv: &[&str], options: SpawnOptions) -> Result<ProcessHandle> {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let mut request = ExecRequest::new(argv.clone());
        request.stdin = options.stdin;
        debug!(command = %shell_join(&argv), "spawn");
        let process = self.transport.exec(request).await?;
        Ok(ProcessHandle::new(argv, process, self.grace(), options.cancel))
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<RemoteFile> {
        let script = match mode {
            OpenMode::Read => {
                // Fail early instead of at close time.
                let st = self.stat(path).await?;
                if st.is_dir() {
                    return Err(Error::fs(path, "is a directory"));
                }
                r#"exec cat -- "$1""#
            }
            OpenMode::Write => r#"exec cat > "$1""#,
            OpenMode::Append => r#"exec cat >> "$1""#,
        };
        let argv = [self.config.shell.as_str(), "-c", script, "sh", path];
        let options = if mode == OpenMode::Read {
            SpawnOptions::default()
        } else {
            SpawnOptions::default().with_stdin()
        };
        let handle = self.spawn(&argv, options).await?;
        Ok(RemoteFile::new(path.to_string(), mode, handle))
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let out = self.run(&["cat", "--", path], RunOptions::new()).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(classify_fs_error(path, &out.stderr_text()))
        }
    }

    async fn write_bytes(&self, path: &str, data: &[u8]) -> Result<()> {
        let out = self
            .sh(r#"cat > "$1""#, &[path], RunOptions::new().input(data.to_vec()))
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(classify_fs_error(path, &out.stderr_text()))
        }
    }

    async fn stat(&self, path: &str) -> Result<Stat> {
        self.stat_inner(path, true).await
    }

    async fn lstat(&self, path: &str) -> Result<Stat> {
        self.stat_inner(path, false).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let mode = format!("{:o}", mode);
        self.fs_op(path, &["chmod", &mode, "--", path]).await
    }

    async fn chown(&self, path: &str, uid: Uid, gid: u32) -> Result<()> {
        let owner = format!("{}:{}", uid, gid);
        self.fs_op(path, &["chown", &owner, "--", path]).await
    }

    async fn mkdir(&self, path: &str, options: MkdirOptions) -> Result<()> {
        if options.parents {
            if !options.exist_ok && self.exists(path).await? {
                return Err(Error::AlreadyExists(path.to_string()));
            }
            return self.fs_op(path, &["mkdir", "-p", "--", path]).await;
        }
        match self.fs_op(path, &["mkdir", "--", path]).await {
            Err(Error::AlreadyExists(_)) if options.exist_ok => Ok(()),
            other => other,
        }
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        self.fs_op(path, &["rmdir", "--", path]).await
    }

    async fn unlink(&self, path: &str, missing_ok: bool) -> Result<()> {
        match self.fs_op(path, &["rm", "--", path]).await {
            Err(Error::NotFound(_)) if missing_ok => Ok(()),
            other => other,
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.fs_op(from, &["mv", "--", from, to]).await
    }

    async fn symlink_to(&self, link: &str, target: &str) -> Result<()> {
        self.fs_op(link, &["ln", "-s", "--", target, link]).await
    }

    async fn link_to(&self, link: &str, target: &str) -> Result<()> {
        self.fs_op(link, &["ln", "--", target, link]).await
    }

    async fn readlink(&self, path: &str) -> Result<String> {
        let st = self.lstat(path).await?;
        if !st.is_symlink() {
            return Err(Error::fs(path, "not a symbolic link"));
        }
        let out = self.run(&["readlink", "--", path], RunOptions::new()).await?;
        if !out.success() {
            return Err(classify_fs_error(path, &out.stderr_text()));
        }
        Ok(out.stdout_text().trim_end_matches('\n').to_string())
    }

    async fn listdir(&self, path: &str) -> Result<Vec<String>> {
        let st = self.stat(path).await?;
        if !st.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        let out = self.run(&["ls", "-1A", "--", path], RunOptions::new()).await?;
        if !out.success() {
            return Err(classify_fs_error(path, &out.stderr_text()));
        }
        Ok(out
            .stdout_text()
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn getuid(&self) -> Result<Uid> {
        if let Ok(guard) = self.uid.lock() {
            if let Some(uid) = *guard {
                return Ok(uid);
            }
        }
        let out = self.run(&["id", "-u"], RunOptions::new().checked()).await?;
        let text = out.stdout_text();
        let uid: Uid = text
            .trim()
            .parse()
            .map_err(|_| Error::fs("id -u", format!("unexpected output: {:?}", text.trim())))?;
        if let Ok(mut guard) = self.uid.lock() {
            *guard = Some(uid);
        }
        Ok(uid)
    }

    fn refresh_uid(&self) {
        if let Ok(mut guard) = self.uid.lock() {
            *guard = None;
        }
    }

    async fn whoami(&self) -> Result<String> {
        let out = self.run(&["id", "-un"], RunOptions::new().checked()).await?;
        Ok(out.stdout_text().trim().to_string())
    }

    async fn getenv(&self, name: &str) -> Result<Option<String>> {
        let out = self.run(&["printenv", name], RunOptions::new()).await?;
        if out.success() {
            Ok(Some(out.stdout_text().trim_end_matches('\n').to_string()))
        } else {
            Ok(None)
        }
    }

    async fn fingerprint(&self) -> Result<TargetId> {
        let out = self
            .sh(
                "cat /etc/machine-id 2>/dev/null; uname -n; uname -m",
                &[],
                RunOptions::new(),
            )
            .await?;
        let material = out.stdout_text();
        if material.trim().is_empty() {
            return Err(Error::channel("target returned no identifying data"));
        }
        let id = TargetId::new(hex_digest(material.trim().as_bytes()));
        info!(target_id = id.short(), "fingerprinted target");
        Ok(id)
    }

    async fn users(&self) -> Result<Vec<User>> {
        let data = self.read_bytes("/etc/passwd").await?;
        Ok(parse_passwd(&String::from_utf8_lossy(&data)))
    }

    async fn groups(&self) -> Result<Vec<Group>> {
        let data = self.read_bytes("/etc/group").await?;
        Ok(parse_group(&String::from_utf8_lossy(&data)))
    }

    async fn sudo(&self, argv: &[&str], options: SudoOptions) -> Result<CompletedProcess> {
        let target = options.user.clone().unwrap_or_else(|| "root".into());
        let mut full: Vec<String> = vec!["sudo".into()];
        let mut run = options.run;
        match &options.password {
            Some(password) => {
                full.extend(["-S".into(), "-p".into(), String::new()]);
                let mut input = format!("{}\n", password).into_bytes();
                if let Some(extra) = run.input.take() {
                    input.extend(extra);
                }
                run.input = Some(input);
            }
            None => full.push("-n".into()),
        }
        if let Some(user) = &options.user {
            full.extend(["-u".into(), user.clone()]);
        }
        if let Some(group) = &options.group {
            full.extend(["-g".into(), group.clone()]);
        }
        full.push("--".into());
        full.extend(argv.iter().map(|s| s.to_string()));
        self.privileged_run(full, run, SUDO_AUTH_FAILURES, &target).await
    }

    async fn su(&self, user: &str, password: &str, argv: &[&str]) -> Result<CompletedProcess> {
        let full = vec![
            "su".to_string(),
            user.to_string(),
            "-c".to_string(),
            shell_join(argv),
        ];
        let run = RunOptions::new().input(format!("{}\n", password));
        self.privileged_run(full, run, SU_AUTH_FAILURES, user).await
    }

    async fn which(&self, name: &str) -> Result<Option<String>> {
        let script = format!("command -v {}", shell_quote(name));
        let out = self
            .run(&[self.config.shell.as_str(), "-c", &script], RunOptions::new())
            .await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(out
            .stdout_lines()
            .into_iter()
            .next()
            .filter(|p| p.starts_with('/')))
    }

    async fn compile(
        &self,
        sources: &[CompileSource],
        output: &str,
        flags: &[&str],
    ) -> Result<String> {
        if sources.is_empty() {
            return Err(Error::BuildFailed("no sources given".into()));
        }
        let mut compiler = None;
        for candidate in COMPILERS {
            if let Some(path) = self.which(candidate).await? {
                compiler = Some(path);
                break;
            }
        }
        let Some(compiler) = compiler else {
            return Err(Error::BuildFailed("no C compiler on target".into()));
        };

        let workdir = self
            .run(&["mktemp", "-d"], RunOptions::new().checked())
            .await?
            .stdout_text()
            .trim()
            .to_string();
        let mut paths = Vec::with_capacity(sources.len());
        for src in sources {
            let path = format!("{}/{}", workdir, src.name);
            self.write_bytes(&path, &src.content).await?;
            paths.push(path);
        }

        let mut argv: Vec<&str> = vec![compiler.as_str(), "-o", output];
        argv.extend(paths.iter().map(String::as_str));
        argv.extend_from_slice(flags);
        let result = self.run(&argv, RunOptions::new()).await;
        let _ = self.run(&["rm", "-rf", "--", &workdir], RunOptions::new()).await;

        let out = result?;
        if !out.success() {
            return Err(Error::BuildFailed(out.stderr_text().trim().to_string()));
        }
        info!(output, compiler = %compiler, "compiled artifact");
        Ok(output.to_string())
    }
}

fn parse_stat(path: &str, text: &str) -> Result<Stat> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    let bad = || Error::fs(path, format!("unexpected stat output: {:?}", text.trim()));
    if fields.len() < 5 {
        return Err(bad());
    }
    let mode = u32::from_str_radix(fields[0], 16).map_err(|_| bad())?;
    Ok(Stat {
        mode,
        size: fields[1].parse().map_err(|_| bad())?,
        uid: fields[2].parse().map_err(|_| bad())?,
        gid: fields[3].parse().map_err(|_| bad())?,
        mtime: fields[4].parse().map_err(|_| bad())?,
        file_type: Stat::file_type_from_mode(mode),
    })
}

fn hex_digest(data: &[u8]) -> String {
    digest::digest(&digest::SHA256, data)
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FileType;

    #[test]
    fn stat_output_parses() {
        let st = parse_stat("/usr/bin/passwd", "81ed 68208 0 0 1700000000\n").unwrap();
        assert_eq!(st.mode, 0o100755);
        assert_eq!(st.file_type, FileType::File);
        assert_eq!(st.size, 68208);

        let st = parse_stat("/usr/bin/su", "89ed 55672 0 0 1700000000").unwrap();
        assert!(st.is_setuid());
    }

    #[test]
    fn stat_garbage_is_fs_error() {
        assert!(matches!(
            parse_stat("/x", "stat: missing operand"),
            Err(Error::Fs { .. })
        ));
    }

    #[test]
    fn digest_is_stable_hex() {
        let a = hex_digest(b"host-a");
        assert_eq!(a.len(), 64);
        assert_eq!(a, hex_digest(b"host-a"));
        assert_ne!(a, hex_digest(b"host-b"));
    }
}
