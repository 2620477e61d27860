//! Listening sockets, from `ss` or `netstat`.

use async_trait::async_trait;
use foothold_core::{Error, Fact, Result, Schedule};
use foothold_engine::{BoundArgs, Module, ModuleContext, ModuleDescriptor};
use foothold_platform::RunOptions;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const PROVIDES: &str = "system.network.service";

// First owning process in the `users:((...))` column.
static SS_USERS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"users:\(\("([^"]+)",pid=(\d+)"#).ok());

/// One listening (or unconnected datagram) socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkService {
    pub protocol: String,
    pub state: String,
    pub local_address: String,
    pub local_port: String,
    pub remote: String,
    pub process: Option<String>,
    pub pid: Option<u32>,
}

impl NetworkService {
    fn title(&self) -> String {
        let owner = match (&self.process, self.pid) {
            (Some(name), Some(pid)) => format!(" ({}[{}])", name, pid),
            (Some(name), None) => format!(" ({})", name),
            _ => String::new(),
        };
        format!(
            "{} {}:{} {}{}",
            self.protocol, self.local_address, self.local_port, self.state, owner
        )
    }
}

pub struct NetworkModule {
    descriptor: ModuleDescriptor,
}

impl NetworkModule {
    pub fn new() -> Self {
        Self {
            descriptor: ModuleDescriptor::enumerate("enumerate.system.network")
                .description("Listening TCP and UDP sockets with their owning process")
                .provides([PROVIDES])
                .schedule(Schedule::PerUser),
        }
    }
}

impl Default for NetworkModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for NetworkModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn run(&self, ctx: &ModuleContext, _args: &BoundArgs) -> Result<Value> {
        let mut services = None;
        if ctx.which("ss").await?.is_some() {
            let out = ctx.run_command(&["ss", "-tuln", "-p"], RunOptions::new()).await?;
            if out.success() {
                services = Some(parse_ss(&out.stdout_text()));
            } else {
                warn!(exit_code = out.exit_code, stderr = %out.stderr_text().trim(), "ss failed");
            }
        }
        let services = if let Some(services) = services {
            services
        } else if ctx.which("netstat").await?.is_some() {
            ctx.status("using netstat").await;
            let out = ctx
                .run_command(&["netstat", "-tulnp"], RunOptions::new().checked())
                .await?;
            parse_netstat(&out.stdout_text())
        } else {
            return Err(Error::module_failed(
                ctx.name(),
                "neither ss nor netstat is available",
            ));
        };

        debug!(count = services.len(), "parsed listening sockets");
        let mut emitted = 0usize;
        for service in &services {
            let fact = Fact::from_payload(ctx.name(), [PROVIDES], service)?.with_title(service.title());
            if ctx.emit_fact(fact).await? {
                emitted += 1;
            }
        }
        Ok(json!({ "sockets": emitted }))
    }
}

/// Split `addr:port`, dropping IPv6 brackets and interface suffixes.
fn split_endpoint(endpoint: &str) -> Option<(String, String)> {
    let (addr, port) = endpoint.rsplit_once(':')?;
    let addr = addr.trim_start_matches('[').trim_end_matches(']');
    let addr = addr.split('%').next().unwrap_or(addr);
    Some((addr.to_string(), port.to_string()))
}

fn remote_of(peer: &str) -> String {
    match split_endpoint(peer) {
        Some((_, port)) if port == "*" => "*:*".to_string(),
        Some((addr, port)) => format!("{}:{}", addr, port),
        None => peer.to_string(),
    }
}

fn normalize_protocol(proto: &str) -> String {
    proto.trim_end_matches('6').to_ascii_lowercase()
}

/// Parse `ss -tuln -p`.
pub fn parse_ss(output: &str) -> Vec<NetworkService> {
    let mut services = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 || fields[0] == "Netid" {
            continue;
        }
        let Some((local_address, local_port)) = split_endpoint(fields[4]) else {
            continue;
        };
        let rest = fields[6..].join(" ");
        let (process, pid) = match SS_USERS.as_ref().and_then(|re| re.captures(&rest)) {
            Some(caps) => (
                Some(caps[1].to_string()),
                caps[2].parse::<u32>().ok(),
            ),
            None => (None, None),
        };
        services.push(NetworkService {
            protocol: normalize_protocol(fields[0]),
            state: fields[1].to_string(),
            local_address,
            local_port,
            remote: remote_of(fields[5]),
            process,
            pid,
        });
    }
    services
}

/// Parse `netstat -tulnp`. UDP rows have no state column.
pub fn parse_netstat(output: &str) -> Vec<NetworkService> {
    let mut services = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        let protocol = normalize_protocol(fields[0]);
        if protocol != "tcp" && protocol != "udp" {
            continue;
        }
        let Some((local_address, local_port)) = split_endpoint(fields[3]) else {
            continue;
        };
        let (state, owner) = if protocol == "tcp" {
            (fields.get(5).copied().unwrap_or("LISTEN"), fields.get(6).copied())
        } else {
            ("UNCONN", fields.get(5).copied())
        };
        let (pid, process) = match owner.and_then(|o| o.split_once('/')) {
            Some((pid, name)) => (pid.parse::<u32>().ok(), Some(name.to_string())),
            None => (None, None),
        };
        services.push(NetworkService {
            protocol,
            state: state.to_string(),
            local_address,
            local_port,
            remote: remote_of(fields[4]),
            process,
            pid,
        });
    }
    services
}
