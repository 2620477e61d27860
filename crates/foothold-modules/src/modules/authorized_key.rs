//! SSH public key implant.

use async_trait::async_trait;
use foothold_core::{Error, Fact, Result, Uid};
use foothold_engine::{
    ArgType, Argument, BoundArgs, Module, ModuleContext, ModuleDescriptor, RevertOutcome, TamperKind,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

pub const FACT_TYPE: &str = "implant.authorized_key";

/// Stored with the implant fact so removal can find its ledger entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstalledKey {
    pub user: String,
    pub uid: Uid,
    pub path: String,
    pub key: String,
    /// Ledger ids, in the order the changes were made.
    pub tamper: Vec<Uuid>,
}

pub struct AuthorizedKeyModule {
    descriptor: ModuleDescriptor,
}

impl AuthorizedKeyModule {
    pub fn new() -> Self {
        Self {
            descriptor: ModuleDescriptor::implant("implant.authorized_key")
                .description("Append a public key to a user's authorized_keys")
                .argument(Argument::new("key", ArgType::Str).help("public key line"))
                .argument(
                    Argument::new("user", ArgType::Str)
                        .default("")
                        .help("account to install for (default: current user)"),
                )
                .collapse_result(),
        }
    }
}

impl Default for AuthorizedKeyModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for AuthorizedKeyModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn run(&self, ctx: &ModuleContext, args: &BoundArgs) -> Result<Value> {
        let key = args.str("key").unwrap_or_default().trim().to_string();
        if key.is_empty() || key.contains('\n') {
            return Err(Error::invalid_argument("key", "expected a single public key line"));
        }
        let user = match args.str("user").filter(|u| !u.is_empty()) {
            Some(name) => ctx
                .find_user(name)
                .await?
                .ok_or_else(|| Error::invalid_argument("user", format!("no such user: {}", name)))?,
            None => ctx.current_user().await?,
        };
        if user.home.is_empty() {
            return Err(Error::module_failed(ctx.name(), format!("{} has no home directory", user.name)));
        }

        let platform = ctx.platform();
        let ssh_dir = format!("{}/.ssh", user.home.trim_end_matches('/'));
        let path = format!("{}/authorized_keys", ssh_dir);
        let mut tamper = Vec::new();

        if !ctx.guard(platform.exists(&ssh_dir).await)? {
            ctx.status(format!("creating {}", ssh_dir)).await;
            tamper.push(ctx.mkdir(&ssh_dir).await?.id);
            ctx.guard(platform.chmod(&ssh_dir, 0o700).await)?;
        } else if let Ok(existing) = platform.read_bytes(&path).await {
            if String::from_utf8_lossy(&existing).lines().any(|l| l.trim() == key) {
                return Err(Error::module_failed(ctx.name(), format!("key already present in {}", path)));
            }
        }

        tamper.push(ctx.append_line(&path, &key, TamperKind::InstalledCredential).await?.id);
        info!(user = %user.name, path = %path, "authorized key installed");

        let installed = InstalledKey {
            user: user.name.clone(),
            uid: user.uid,
            path: path.clone(),
            key,
            tamper,
        };
        let fact = Fact::from_payload(ctx.name(), [FACT_TYPE], &installed)?
            .with_title(format!("authorized key for {} in {}", user.name, path));
        ctx.emit_fact(fact.clone()).await?;
        Ok(fact.data)
    }

    async fn remove(&self, ctx: &ModuleContext, fact: &Fact) -> Result<()> {
        let installed: InstalledKey = fact.decode()?;
        // Undo in reverse: the key line first, then a directory we created.
        for (i, id) in installed.tamper.iter().rev().enumerate() {
            let outcome = ctx.revert(*id).await;
            match outcome {
                Ok(RevertOutcome::Reverted) | Ok(RevertOutcome::Unknown) => {}
                Ok(RevertOutcome::Mismatch(reason)) if i == 0 => {
                    warn!(path = %installed.path, %reason, "key already gone");
                }
                Ok(other) => warn!(id = %id, outcome = ?other, "could not revert"),
                Err(e) if i == 0 => return Err(e),
                Err(e) => warn!(id = %id, error = %e, "could not remove directory"),
            }
        }
        info!(user = %installed.user, "authorized key removed");
        Ok(())
    }
}
