//! Setuid binaries on the target's filesystems.

use async_trait::async_trait;
use foothold_core::{Error, Fact, Result, Uid};
use foothold_engine::{BoundArgs, Module, ModuleContext, ModuleDescriptor};
use foothold_platform::RunOptions;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const PROVIDES: &str = "file.suid";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuidFile {
    pub path: String,
    pub owner: Uid,
    pub mode: u32,
}

impl SuidFile {
    /// Basename, used to look the binary up in the capability table.
    pub fn binary(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

pub struct SuidModule {
    descriptor: ModuleDescriptor,
}

impl SuidModule {
    pub fn new() -> Self {
        Self {
            descriptor: ModuleDescriptor::enumerate("enumerate.file.suid")
                .description("Files with the setuid bit set")
                .provides([PROVIDES]),
        }
    }
}

impl Default for SuidModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for SuidModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn run(&self, ctx: &ModuleContext, _args: &BoundArgs) -> Result<Value> {
        ctx.status("searching for setuid files").await;
        let result = ctx
            .run_command(
                &["find", "/", "-xdev", "-perm", "-4000", "-type", "f", "-printf", "%U %m %p\\n"],
                RunOptions::new(),
            )
            .await;
        let (stdout, partial) = match result {
            // find exits non-zero on unreadable directories; keep what it printed.
            Ok(out) if !out.success() => {
                if out.stdout.is_empty() {
                    return Err(Error::module_failed(ctx.name(), out.stderr_text().trim().to_string()));
                }
                warn!(exit_code = out.exit_code, "find reported errors, results are partial");
                (out.stdout, true)
            }
            Ok(out) => (out.stdout, false),
            Err(Error::Timeout { secs, stdout, .. }) => {
                warn!(secs, bytes = stdout.len(), "find timed out, keeping what it printed");
                ctx.status(format!("search timed out after {}s", secs)).await;
                (stdout, true)
            }
            Err(e) => return Err(e),
        };

        let files = parse_find(&String::from_utf8_lossy(&stdout));
        debug!(count = files.len(), "setuid files");
        for file in &files {
            let fact = Fact::from_payload(ctx.name(), [PROVIDES], file)?
                .with_title(format!("{} (uid {}, {:o})", file.path, file.owner, file.mode));
            ctx.emit_fact(fact).await?;
        }
        Ok(json!({ "files": files.len(), "partial": partial }))
    }
}

/// Parse `%U %m %p` lines. Paths may contain spaces.
pub fn parse_find(output: &str) -> Vec<SuidFile> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ' ');
            let owner = parts.next()?.parse().ok()?;
            let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
            let path = parts.next()?.to_string();
            Some(SuidFile { path, owner, mode })
        })
        .collect()
}
