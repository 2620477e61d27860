//! Tests for the built-in modules against scripted targets

use foothold_core::config::PlatformConfig;
use foothold_core::{Error, FootholdConfig};
use foothold_engine::{Args, Context, FactStore, Session, TamperKind, TypePattern};
use foothold_modules::create_default_registry;
use foothold_modules::modules::network::NetworkService;
use foothold_platform::{Linux, MockResponse, MockTransport, Platform};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const SS_OUTPUT: &str = "\
Netid State  Recv-Q Send-Q Local Address:Port Peer Address:Port Process
tcp   LISTEN 0      128    0.0.0.0:22         0.0.0.0:*         users:((\"sshd\",pid=801,fd=3))
";

const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
alice:x:1000:1000:Alice:/home/alice:/bin/bash
";

fn host() -> Arc<MockTransport> {
    let mock = Arc::new(MockTransport::new());
    mock.with_host("beta", 1000, "alice");
    mock
}

async fn open(mock: &Arc<MockTransport>) -> (Context, Arc<Session>) {
    let ctx = Context::with_store(
        FootholdConfig::in_memory(),
        create_default_registry().unwrap(),
        FactStore::in_memory(),
    );
    let platform: Arc<dyn Platform> = Arc::new(Linux::new(mock.clone()));
    let session = ctx.open_session(platform).await.unwrap();
    (ctx, session)
}

fn args(pairs: &[(&str, Value)]) -> Args {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn default_registry_has_every_module() {
    let registry = create_default_registry().unwrap();
    for name in [
        "enumerate.system.network",
        "enumerate.file.suid",
        "enumerate.system.processes",
        "enumerate.escalate.suid",
        "implant.authorized_key",
    ] {
        assert!(registry.contains(name), "missing {}", name);
    }
}

// ===========================================================================
// Network
// ===========================================================================

#[tokio::test]
async fn ss_listener_becomes_one_fact() {
    let mock = host();
    mock.on("/bin/sh -c command -v ss", MockResponse::ok("/usr/bin/ss\n"));
    mock.on("ss -tuln -p", MockResponse::ok(SS_OUTPUT));
    let (_ctx, session) = open(&mock).await;

    let out = session
        .run_collect("enumerate.system.network", Args::new())
        .await
        .unwrap();
    assert_eq!(out.facts.len(), 1);
    let service: NetworkService = out.facts[0].decode().unwrap();
    assert_eq!(service.local_port, "22");
    assert_eq!(service.remote, "*:*");
    assert_eq!(service.protocol, "tcp");
    assert_eq!(service.process.as_deref(), Some("sshd"));
    assert_eq!(service.pid, Some(801));

    session
        .run_collect("enumerate.system.network", Args::new())
        .await
        .unwrap();
    assert_eq!(mock.call_count("ss -tuln"), 1);
}

#[tokio::test]
async fn netstat_is_used_without_ss() {
    let mock = host();
    mock.on("/bin/sh -c command -v netstat", MockResponse::ok("/bin/netstat\n"));
    mock.on(
        "netstat -tulnp",
        MockResponse::ok(
            "Proto Recv-Q Send-Q Local Address Foreign Address State PID/Program name\n\
             tcp 0 0 127.0.0.1:5432 0.0.0.0:* LISTEN 99/postgres\n",
        ),
    );
    let (_ctx, session) = open(&mock).await;

    let facts = session.query("system.network.*").await.unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].data["local_port"], json!("5432"));
    assert_eq!(facts[0].data["process"], json!("postgres"));
}

#[tokio::test]
async fn failing_ss_falls_back_to_netstat() {
    let mock = host();
    mock.on("/bin/sh -c command -v ss", MockResponse::ok("/usr/bin/ss\n"));
    mock.on(
        "ss -tuln -p",
        MockResponse::exit(1).with_stderr("Cannot open netlink socket: Permission denied\n"),
    );
    mock.on("/bin/sh -c command -v netstat", MockResponse::ok("/bin/netstat\n"));
    mock.on(
        "netstat -tulnp",
        MockResponse::ok("tcp 0 0 0.0.0.0:22 0.0.0.0:* LISTEN 801/sshd\n"),
    );
    let (_ctx, session) = open(&mock).await;

    let out = session
        .run_collect("enumerate.system.network", Args::new())
        .await
        .unwrap();
    assert_eq!(out.facts.len(), 1);
    assert_eq!(out.facts[0].data["process"], json!("sshd"));
    assert_eq!(mock.call_count("ss -tuln"), 1);
    assert_eq!(mock.call_count("netstat -tulnp"), 1);
}

#[tokio::test]
async fn no_socket_tool_fails_the_module() {
    let mock = host();
    let (_ctx, session) = open(&mock).await;
    let err = session
        .run_collect("enumerate.system.network", Args::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModuleFailed { .. }));
}

// ===========================================================================
// Setuid and escalation
// ===========================================================================

fn with_suid_files(mock: &MockTransport) {
    mock.on_prefix(
        "find / -xdev -perm -4000",
        MockResponse::ok("0 4755 /usr/bin/find\n0 4755 /usr/bin/passwd\n1000 4755 /home/alice/bin/env\n")
            .with_stderr("find: '/root': Permission denied\n")
            .with_exit(1),
    );
}

#[tokio::test]
async fn suid_search_tolerates_permission_errors() {
    let mock = host();
    with_suid_files(&mock);
    let (_ctx, session) = open(&mock).await;

    let out = session
        .run_collect("enumerate.file.suid", Args::new())
        .await
        .unwrap();
    assert_eq!(out.facts.len(), 3);
    assert_eq!(out.facts[0].data["path"], json!("/usr/bin/find"));
}

#[tokio::test]
async fn suid_search_keeps_output_printed_before_a_timeout() {
    let mock = host();
    mock.on_prefix(
        "find / -xdev -perm -4000",
        MockResponse::ok("0 4755 /usr/bin/passwd\n0 4755 /usr/bin/su\n")
            .with_delay(Duration::from_secs(30)),
    );
    let ctx = Context::with_store(
        FootholdConfig::in_memory(),
        create_default_registry().unwrap(),
        FactStore::in_memory(),
    );
    let config = PlatformConfig {
        default_timeout_secs: 1,
        kill_grace_ms: 50,
        ..Default::default()
    };
    let platform: Arc<dyn Platform> = Arc::new(Linux::with_config(mock.clone(), config));
    let session = ctx.open_session(platform).await.unwrap();

    let out = session
        .run_collect("enumerate.file.suid", Args::new())
        .await
        .unwrap();
    assert_eq!(out.facts.len(), 2);
    assert_eq!(out.value["partial"], json!(true));
    assert_eq!(
        session
            .stored_facts(&TypePattern::new("file.suid").unwrap())
            .await
            .len(),
        2
    );
    assert!(session.is_valid());
}

#[tokio::test]
async fn escalation_uses_suid_facts_and_the_capability_table() {
    let mock = host();
    with_suid_files(&mock);
    let (_ctx, session) = open(&mock).await;

    let out = session
        .run_collect("enumerate.escalate.suid", Args::new())
        .await
        .unwrap();
    assert_eq!(out.facts.len(), 1);
    assert_eq!(out.facts[0].data["binary"], json!("find"));
    assert_eq!(out.facts[0].data["target_uid"], json!(0));
    assert_eq!(
        out.facts[0].data["command"],
        json!("/usr/bin/find . -exec /bin/sh -p \\; -quit")
    );

    // Cached for the session, and the suid search ran once.
    session
        .run_collect("enumerate.escalate.suid", Args::new())
        .await
        .unwrap();
    assert_eq!(mock.call_count("find / -xdev"), 1);
    assert_eq!(
        session
            .stored_facts(&TypePattern::new("file.suid").unwrap())
            .await
            .len(),
        3
    );
}

// ===========================================================================
// Processes
// ===========================================================================

#[tokio::test]
async fn processes_are_never_cached() {
    let mock = host();
    mock.on(
        "ps -eo pid,ppid,uid,args --no-headers",
        MockResponse::ok("    1     0     0 /sbin/init\n  200     1  1000 -bash\n"),
    );
    let (_ctx, session) = open(&mock).await;

    let out = session
        .run_collect("enumerate.system.processes", Args::new())
        .await
        .unwrap();
    assert_eq!(out.facts.len(), 2);
    session
        .run_collect("enumerate.system.processes", Args::new())
        .await
        .unwrap();
    assert_eq!(mock.call_count("ps -eo"), 2);
    assert!(session
        .stored_facts(&TypePattern::new("system.process").unwrap())
        .await
        .is_empty());
}

// ===========================================================================
// Implant
// ===========================================================================

#[tokio::test]
async fn authorized_key_install_and_remove() {
    let key = "ssh-ed25519 AAAATEST operator@box";
    let mock = host();
    mock.on("cat -- /etc/passwd", MockResponse::ok(PASSWD));
    mock.on_prefix(
        "stat",
        MockResponse::exit(1).with_stderr("stat: cannot statx: No such file or directory\n"),
    );
    mock.on_prefix("mkdir -p", MockResponse::ok(""));
    mock.on_prefix("chmod", MockResponse::ok(""));
    mock.on(
        "cat -- /home/alice/.ssh/authorized_keys",
        MockResponse::exit(1).with_stderr("cat: /home/alice/.ssh/authorized_keys: No such file or directory\n"),
    );
    mock.on_prefix("/bin/sh -c cat > \"$1\"", MockResponse::ok(""));
    let (_ctx, session) = open(&mock).await;

    let out = session
        .run_collect("implant.authorized_key", args(&[("key", json!(key))]))
        .await
        .unwrap();
    assert_eq!(out.facts.len(), 1);
    let fact = out.facts[0].clone();
    assert_eq!(fact.data["path"], json!("/home/alice/.ssh/authorized_keys"));
    let written = mock.last_call("/bin/sh -c cat > \"$1\"").unwrap();
    assert_eq!(written.stdin(), format!("{}\n", key).into_bytes());

    let tamper = session.tamper().await;
    assert_eq!(tamper.len(), 2);
    assert_eq!(tamper[0].kind, TamperKind::CreatedDirectory);
    assert_eq!(tamper[1].kind, TamperKind::InstalledCredential);

    // The key file exists now.
    mock.on_prefix("stat", MockResponse::ok("81a4 36 1000 1000 0\n"));
    mock.on_prefix("rm --", MockResponse::ok(""));
    mock.on_prefix("rmdir --", MockResponse::ok(""));
    session.remove_implant(&fact).await.unwrap();

    assert_eq!(mock.call_count("rm -- /home/alice/.ssh/authorized_keys"), 1);
    assert_eq!(mock.call_count("rmdir -- /home/alice/.ssh"), 1);
    assert!(session.tamper().await.is_empty());
    assert!(!session
        .facts()
        .await
        .iter()
        .any(|f| f.has_type("implant.authorized_key")));
}

#[tokio::test]
async fn authorized_key_requires_a_key() {
    let mock = host();
    let (_ctx, session) = open(&mock).await;
    let err = session
        .run("implant.authorized_key", Args::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingArgument { .. }));
}
