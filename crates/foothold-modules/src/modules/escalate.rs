//! Privilege escalation through known setuid binaries.
//!
//! Combines `file.suid` facts with the capability table: every setuid binary
//! owned by someone else that the table knows a shell or file-read technique
//! for becomes an `escalate.suid` fact. Results depend on the current user, so
//! they are cached per uid and only for the session.

use super::suid::{self, SuidFile};
use async_trait::async_trait;
use foothold_core::{Fact, Result, Schedule, Scope, Uid};
use foothold_engine::{BoundArgs, Capability, Caveat, Method, Module, ModuleContext, ModuleDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const PROVIDES: &str = "escalate.suid";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationPath {
    pub binary: String,
    pub path: String,
    /// Uid the technique runs as.
    pub target_uid: Uid,
    pub capability: Capability,
    pub method: Method,
    pub command: String,
    pub caveats: Vec<Caveat>,
}

pub struct EscalateSuidModule {
    descriptor: ModuleDescriptor,
}

impl EscalateSuidModule {
    pub fn new() -> Self {
        Self {
            descriptor: ModuleDescriptor::enumerate("enumerate.escalate.suid")
                .description("Escalation techniques available through setuid binaries")
                .provides([PROVIDES])
                .schedule(Schedule::PerUser)
                .scope(Scope::Session),
        }
    }
}

impl Default for EscalateSuidModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for EscalateSuidModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn run(&self, ctx: &ModuleContext, _args: &BoundArgs) -> Result<Value> {
        let me = ctx.getuid().await?;
        let mut by_name: BTreeMap<String, SuidFile> = BTreeMap::new();
        for fact in ctx.query(suid::PROVIDES).await? {
            match fact.decode::<SuidFile>() {
                Ok(file) if file.owner != me => {
                    by_name.entry(file.binary().to_string()).or_insert(file);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "skipping malformed suid fact"),
            }
        }
        let present: BTreeMap<String, String> = by_name
            .iter()
            .map(|(name, file)| (name.clone(), file.path.clone()))
            .collect();
        debug!(candidates = present.len(), "setuid binaries owned by other users");

        let table = ctx.gtfobins();
        let mut found = 0usize;
        for capability in [Capability::Shell, Capability::FileRead] {
            for technique in table.resolve(capability, Method::Suid, &present) {
                let Some(file) = by_name.get(&technique.binary) else {
                    continue;
                };
                let path = EscalationPath {
                    binary: technique.binary.clone(),
                    path: technique.path.clone(),
                    target_uid: file.owner,
                    capability,
                    method: technique.method,
                    command: technique.command.clone(),
                    caveats: technique.caveats.clone(),
                };
                let title = format!("{:?} as uid {} via {}", capability, file.owner, technique.path);
                let fact = Fact::from_payload(ctx.name(), [PROVIDES], &path)?.with_title(title);
                if ctx.emit_fact(fact).await? {
                    found += 1;
                }
            }
        }
        Ok(json!({ "techniques": found }))
    }
}
