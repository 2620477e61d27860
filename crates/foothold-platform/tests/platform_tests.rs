//! Tests for foothold-platform: process execution, file operations and
//! identity, against the local machine and a scripted transport

use foothold_core::config::PlatformConfig;
use foothold_core::Error;
use foothold_platform::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn local() -> Linux {
    Linux::new(Arc::new(LocalTransport::new()))
}

fn mocked() -> (Arc<MockTransport>, Linux) {
    let mock = Arc::new(MockTransport::new());
    let linux = Linux::with_config(
        mock.clone(),
        PlatformConfig {
            kill_grace_ms: 50,
            ..PlatformConfig::default()
        },
    );
    (mock, linux)
}

// ===========================================================================
// Processes
// ===========================================================================

#[tokio::test]
async fn run_captures_both_streams() {
    let out = local()
        .run(&["sh", "-c", "echo out; echo err >&2; exit 3"], RunOptions::new())
        .await
        .unwrap();
    assert_eq!(out.exit_code, 3);
    assert_eq!(out.stdout_text(), "out\n");
    assert_eq!(out.stderr_text(), "err\n");
}

#[tokio::test]
async fn run_checked_raises_command_failed() {
    let err = local()
        .run(&["sh", "-c", "echo nope >&2; exit 1"], RunOptions::new().checked())
        .await
        .unwrap_err();
    match err {
        Error::CommandFailed { exit_code, stderr, .. } => {
            assert_eq!(exit_code, 1);
            assert_eq!(stderr, b"nope\n");
        }
        other => panic!("expected CommandFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn large_output_on_both_streams_does_not_deadlock() {
    let script = "head -c 70000 /dev/zero; head -c 70000 /dev/zero >&2";
    let out = tokio::time::timeout(
        Duration::from_secs(20),
        local().run(&["sh", "-c", script], RunOptions::new()),
    )
    .await
    .expect("run deadlocked")
    .unwrap();
    assert_eq!(out.stdout.len(), 70000);
    assert_eq!(out.stderr.len(), 70000);
}

#[tokio::test]
async fn communicate_feeds_stdin_and_drains_large_output() {
    let linux = local();
    let script = "cat; head -c 70000 /dev/zero >&2";
    let handle = linux
        .spawn(&["sh", "-c", script], SpawnOptions::default().with_stdin())
        .await
        .unwrap();
    let input = vec![b'x'; 70000];
    let out = handle.communicate(Some(input)).await.unwrap();
    assert_eq!(out.stdout.len(), 70000);
    assert_eq!(out.stderr.len(), 70000);
    assert!(out.success());
}

#[tokio::test]
async fn timeout_keeps_partial_output() {
    let started = Instant::now();
    let err = local()
        .run(
            &["sh", "-c", "echo partial; exec sleep 10"],
            RunOptions::new().timeout(Duration::from_millis(500)),
        )
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(8));
    match &err {
        Error::Timeout { stdout, .. } => assert_eq!(stdout, b"partial\n"),
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert!(!err.is_fatal_to_session());
}

#[tokio::test]
async fn timeout_escalates_to_kill_when_interrupt_is_ignored() {
    let (mock, linux) = mocked();
    mock.on(
        "stubborn",
        MockResponse::ok("so far")
            .with_delay(Duration::from_secs(60))
            .ignoring_interrupt(),
    );
    let started = Instant::now();
    let err = linux
        .run(&["stubborn"], RunOptions::new().timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(err.partial_output().unwrap().0, b"so far");
}

#[tokio::test]
async fn cancel_token_stops_run() {
    let (mock, linux) = mocked();
    mock.on("sleep 60", MockResponse::ok("").with_delay(Duration::from_secs(60)));
    let token = tokio_util::sync::CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = linux
        .run(&["sleep", "60"], RunOptions::new().cancel(token))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn spawned_lines_stream_lazily() {
    let linux = local();
    let mut handle = linux
        .spawn(&["sh", "-c", "echo one; echo two"], SpawnOptions::default())
        .await
        .unwrap();
    assert_eq!(handle.next_stdout_line().await.unwrap().as_deref(), Some("one"));
    assert_eq!(handle.next_stdout_line().await.unwrap().as_deref(), Some("two"));
    assert_eq!(handle.next_stdout_line().await.unwrap(), None);
    assert_eq!(handle.wait().await.unwrap(), 0);
}

#[tokio::test]
async fn missing_binary_is_exit_127_not_channel_error() {
    let out = local()
        .run(&["definitely-not-a-binary-xyz"], RunOptions::new())
        .await
        .unwrap();
    assert_eq!(out.exit_code, 127);
}

// ===========================================================================
// Files (local machine, inside a temp dir)
// ===========================================================================

#[tokio::test]
async fn file_roundtrip_and_metadata() {
    let tmp = tempfile::tempdir().unwrap();
    let linux = local();
    let path = tmp.path().join("note.txt");
    let path = path.to_str().unwrap();

    linux.write_bytes(path, b"hello\n").await.unwrap();
    assert_eq!(linux.read_bytes(path).await.unwrap(), b"hello\n");

    linux.chmod(path, 0o640).await.unwrap();
    let st = linux.stat(path).await.unwrap();
    assert!(st.is_file());
    assert_eq!(st.permissions(), 0o640);
    assert_eq!(st.size, 6);
}

#[tokio::test]
async fn missing_file_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let linux = local();
    let path = tmp.path().join("absent");
    let path = path.to_str().unwrap();

    assert!(matches!(linux.read_bytes(path).await, Err(Error::NotFound(_))));
    assert!(matches!(linux.stat(path).await, Err(Error::NotFound(_))));
    assert!(!linux.exists(path).await.unwrap());
    linux.unlink(path, true).await.unwrap();
    assert!(matches!(linux.unlink(path, false).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn directories_links_and_listing() {
    let tmp = tempfile::tempdir().unwrap();
    let linux = local();
    let base = tmp.path().to_str().unwrap().to_string();
    let nested = format!("{}/a/b", base);

    linux.mkdir(&nested, MkdirOptions::recursive()).await.unwrap();
    linux.mkdir(&nested, MkdirOptions::recursive()).await.unwrap();
    assert!(matches!(
        linux.mkdir(&nested, MkdirOptions::default()).await,
        Err(Error::AlreadyExists(_))
    ));

    let target = format!("{}/a/file", base);
    linux.write_bytes(&target, b"x").await.unwrap();
    let link = format!("{}/a/link", base);
    linux.symlink_to(&link, &target).await.unwrap();
    assert_eq!(linux.readlink(&link).await.unwrap(), target);
    assert!(linux.lstat(&link).await.unwrap().is_symlink());
    assert!(linux.stat(&link).await.unwrap().is_file());

    let mut names = linux.listdir(&format!("{}/a", base)).await.unwrap();
    names.sort();
    assert_eq!(names, vec!["b", "file", "link"]);

    let moved = format!("{}/a/moved", base);
    linux.rename(&target, &moved).await.unwrap();
    assert!(linux.exists(&moved).await.unwrap());
    assert!(matches!(
        linux.listdir(&moved).await,
        Err(Error::NotADirectory(_))
    ));
    linux.rmdir(&nested).await.unwrap();
}

#[tokio::test]
async fn streaming_write_then_read() {
    let tmp = tempfile::tempdir().unwrap();
    let linux = local();
    let path = tmp.path().join("stream.bin");
    let path = path.to_str().unwrap();

    let mut f = linux.open(path, OpenMode::Write).await.unwrap();
    f.write_all(b"first ").await.unwrap();
    f.close().await.unwrap();
    let mut f = linux.open(path, OpenMode::Append).await.unwrap();
    f.write_all(b"second").await.unwrap();
    f.close().await.unwrap();

    let mut f = linux.open(path, OpenMode::Read).await.unwrap();
    let mut text = String::new();
    f.read_to_string(&mut text).await.unwrap();
    f.close().await.unwrap();
    assert_eq!(text, "first second");
}

#[tokio::test]
async fn open_missing_for_read_fails_fast() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("nope");
    let err = local()
        .open(path.to_str().unwrap(), OpenMode::Read)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn remote_path_helpers() {
    let tmp = tempfile::tempdir().unwrap();
    let platform: Arc<dyn Platform> = Arc::new(local());
    let base = RemotePath::new(platform, tmp.path().to_str().unwrap());
    let file = &base / "sub" / "data";
    file.parent().unwrap().mkdir(MkdirOptions::recursive()).await.unwrap();
    file.write_bytes(b"payload").await.unwrap();
    assert_eq!(file.read_text().await.unwrap(), "payload");
    let entries = (&base / "sub").listdir().await.unwrap();
    assert_eq!(entries, vec![file.clone()]);
}

// ===========================================================================
// Tools
// ===========================================================================

#[tokio::test]
async fn which_finds_shell_and_misses_garbage() {
    let linux = local();
    let sh = linux.which("sh").await.unwrap().unwrap();
    assert!(sh.starts_with('/'));
    assert_eq!(linux.which("definitely-not-a-binary-xyz").await.unwrap(), None);
}

#[tokio::test]
async fn compile_without_compiler_is_build_failed() {
    let (_mock, linux) = mocked();
    let err = linux
        .compile(&[CompileSource::new("x.c", "int main(){}")], "/tmp/x", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BuildFailed(_)));
}

// ===========================================================================
// Identity and privilege (scripted)
// ===========================================================================

const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\nalice:x:1000:1000::/home/alice:/bin/bash\n";

#[tokio::test]
async fn uid_is_cached_until_refresh() {
    let (mock, linux) = mocked();
    mock.with_host("box", 1000, "alice");
    assert_eq!(linux.getuid().await.unwrap(), 1000);
    assert_eq!(linux.getuid().await.unwrap(), 1000);
    assert_eq!(mock.call_count("id -u"), 1);
    linux.refresh_uid();
    linux.getuid().await.unwrap();
    assert_eq!(mock.call_count("id -u"), 2);
}

#[tokio::test]
async fn fingerprint_is_stable_per_host() {
    let (mock_a, a) = mocked();
    mock_a.with_host("alpha", 0, "root");
    let (mock_b, b) = mocked();
    mock_b.with_host("beta", 0, "root");

    let first = a.fingerprint().await.unwrap();
    assert_eq!(first, a.fingerprint().await.unwrap());
    assert_ne!(first, b.fingerprint().await.unwrap());
    assert_eq!(first.as_str().len(), 64);
}

#[tokio::test]
async fn find_user_by_name_and_id() {
    let (mock, linux) = mocked();
    mock.on("cat -- /etc/passwd", MockResponse::ok(PASSWD));
    let alice = linux.find_user("alice".into()).await.unwrap().unwrap();
    assert_eq!(alice.uid, 1000);
    let root = linux.find_user(0u32.into()).await.unwrap().unwrap();
    assert_eq!(root.name, "root");
    assert!(linux.find_user("mallory".into()).await.unwrap().is_none());
}

#[tokio::test]
async fn sudo_sends_password_and_refreshes_uid() {
    let (mock, linux) = mocked();
    mock.with_host("box", 1000, "alice");
    mock.on("sudo -S -p  -- id", MockResponse::ok("uid=0(root)\n"));
    linux.getuid().await.unwrap();

    let out = linux
        .sudo(
            &["id"],
            SudoOptions {
                password: Some("hunter2".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(out.stdout_text(), "uid=0(root)\n");
    assert_eq!(mock.last_call("sudo").unwrap().stdin(), b"hunter2\n");

    linux.getuid().await.unwrap();
    assert_eq!(mock.call_count("id -u"), 2);
}

#[tokio::test]
async fn sudo_wrong_password_is_authentication_failed() {
    let (mock, linux) = mocked();
    mock.on_prefix(
        "sudo",
        MockResponse::exit(1).with_stderr("Sorry, try again.\nsudo: 1 incorrect password attempt\n"),
    );
    let err = linux
        .sudo(
            &["id"],
            SudoOptions {
                password: Some("wrong".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed { ref user } if user == "root"));
}

#[tokio::test]
async fn su_authentication_failure() {
    let (mock, linux) = mocked();
    mock.on_prefix("su bob", MockResponse::exit(1).with_stderr("su: Authentication failure\n"));
    let err = linux.su("bob", "nope", &["id"]).await.unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed { .. }));
}

#[tokio::test]
async fn channel_error_is_fatal() {
    let (mock, linux) = mocked();
    mock.on("id -u", MockResponse::channel_error());
    let err = linux.getuid().await.unwrap_err();
    assert!(err.is_fatal_to_session());
}
