use async_trait::async_trait;
use foothold_core::{Fact, Result, Schedule, Scope, Uid};
use foothold_engine::{BoundArgs, Module, ModuleContext, ModuleDescriptor};
use foothold_platform::RunOptions;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PROVIDES: &str = "system.process";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub pid: u32,
    pub ppid: u32,
    pub uid: Uid,
    pub command: String,
}

/// Running processes. Always fresh, never stored.
pub struct ProcessesModule {
    descriptor: ModuleDescriptor,
}

impl ProcessesModule {
    pub fn new() -> Self {
        Self {
            descriptor: ModuleDescriptor::enumerate("enumerate.system.processes")
                .description("Running processes")
                .provides([PROVIDES])
                .schedule(Schedule::Always)
                .scope(Scope::None),
        }
    }
}

impl Default for ProcessesModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for ProcessesModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn run(&self, ctx: &ModuleContext, _args: &BoundArgs) -> Result<Value> {
        let out = ctx
            .run_command(
                &["ps", "-eo", "pid,ppid,uid,args", "--no-headers"],
                RunOptions::new().checked(),
            )
            .await?;
        let processes = parse_ps(&out.stdout_text());
        let total = processes.len() as u64;
        for (i, process) in processes.iter().enumerate() {
            let fact = Fact::from_payload(ctx.name(), [PROVIDES], process)?
                .with_title(format!("{} {}", process.pid, process.command));
            ctx.emit_fact(fact).await?;
            ctx.progress(i as u64 + 1, Some(total)).await;
        }
        Ok(json!({ "processes": total }))
    }
}

pub fn parse_ps(output: &str) -> Vec<Process> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse().ok()?;
            let ppid = parts.next()?.parse().ok()?;
            let uid = parts.next()?.parse().ok()?;
            let command = parts.collect::<Vec<_>>().join(" ");
            Some(Process { pid, ppid, uid, command })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ps() {
        let out = "    1     0     0 /sbin/init splash\n  812     1  1000 /usr/bin/python3 -m http.server\n";
        let procs = parse_ps(out);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[1].uid, 1000);
        assert_eq!(procs[1].command, "/usr/bin/python3 -m http.server");
    }
}
