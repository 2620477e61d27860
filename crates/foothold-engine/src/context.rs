//! Engine context and the per-invocation `ModuleContext`.
//!
//! `Context` owns everything shared across sessions: configuration, the fact
//! store, the module registry and the capability table. `ModuleContext` is
//! what a module body sees while it runs.

use crate::events::{ModuleEvent, ModuleOutput};
use crate::gtfobins::GtfoBins;
use crate::ledger::{self, RevertAction, RevertOutcome, TamperKind, TamperRecord};
use crate::module::{Args, ModuleDescriptor};
use crate::pattern::TypePattern;
use crate::registry::ModuleRegistry;
use crate::schedule::CacheKey;
use crate::session::{execute, Session};
use crate::store::FactStore;
use dashmap::DashMap;
use foothold_core::{Error, Fact, FootholdConfig, Result, Scope, TargetId, Uid};
use foothold_platform::{CompletedProcess, Group, IdQuery, MkdirOptions, Platform, RunOptions, User};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Context
// ============================================================================

pub struct Context {
    config: FootholdConfig,
    store: Arc<FactStore>,
    registry: Arc<ModuleRegistry>,
    gtfobins: Arc<GtfoBins>,
    sessions: DashMap<Uuid, Arc<Session>>,
}

impl Context {
    /// Build a context whose store follows `config.store`.
    pub fn new(config: FootholdConfig, registry: ModuleRegistry) -> Result<Self> {
        let store = FactStore::from_config(&config.store)?;
        Ok(Self::with_store(config, registry, store))
    }

    pub fn with_store(config: FootholdConfig, registry: ModuleRegistry, store: FactStore) -> Self {
        Self {
            config,
            store: Arc::new(store),
            registry: Arc::new(registry),
            gtfobins: Arc::new(GtfoBins::builtin()),
            sessions: DashMap::new(),
        }
    }

    pub fn with_gtfobins(mut self, table: GtfoBins) -> Self {
        self.gtfobins = Arc::new(table);
        self
    }

    pub fn config(&self) -> &FootholdConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<FactStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn gtfobins(&self) -> &Arc<GtfoBins> {
        &self.gtfobins
    }

    /// Fingerprint the platform's host and open a session against its store.
    pub async fn open_session(&self, platform: Arc<dyn Platform>) -> Result<Arc<Session>> {
        let target = platform.fingerprint().await?;
        let store = self.store.target(&target)?;
        let session = Arc::new(Session::new(
            platform.clone(),
            target.clone(),
            store,
            self.registry.clone(),
            self.gtfobins.clone(),
        ));
        info!(session = %session.id(), target_id = target.short(), platform = %platform.describe(), "session opened");
        self.sessions.insert(session.id(), session.clone());
        Ok(session)
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn session(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|e| e.value().clone())
    }

    /// Close and forget a session. Its session-scoped facts go with it.
    pub fn close_session(&self, id: Uuid) -> bool {
        match self.sessions.remove(&id) {
            Some((_, session)) => {
                session.close();
                info!(session = %id, "session closed");
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Event sink
// ============================================================================

#[derive(Default)]
struct Collected {
    facts: Vec<Fact>,
    results: Vec<Value>,
}

/// Where a running module's events go: the caller's event stream for
/// top-level runs, an in-memory collection for nested ones.
#[derive(Clone)]
pub(crate) struct Sink {
    events: Option<mpsc::Sender<ModuleEvent>>,
    collected: Option<Arc<Mutex<Collected>>>,
}

impl Sink {
    pub(crate) fn stream(tx: mpsc::Sender<ModuleEvent>) -> Self {
        Self {
            events: Some(tx),
            collected: None,
        }
    }

    pub(crate) fn discard() -> Self {
        Self {
            events: None,
            collected: None,
        }
    }

    fn collecting() -> Self {
        Self {
            events: None,
            collected: Some(Arc::new(Mutex::new(Collected::default()))),
        }
    }

    fn take(&self) -> (Vec<Fact>, Vec<Value>) {
        match &self.collected {
            Some(c) => match c.lock() {
                Ok(mut c) => (std::mem::take(&mut c.facts), std::mem::take(&mut c.results)),
                Err(_) => (Vec::new(), Vec::new()),
            },
            None => (Vec::new(), Vec::new()),
        }
    }

    async fn send(&self, event: ModuleEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver means the caller stopped listening; the run's
            // token is cancelled separately.
            let _ = tx.send(event).await;
        }
    }

    pub(crate) async fn fact(&self, fact: Fact) {
        if let Some(c) = &self.collected {
            if let Ok(mut c) = c.lock() {
                c.facts.push(fact.clone());
            }
        }
        self.send(ModuleEvent::Fact(fact)).await;
    }

    async fn result(&self, value: Value) {
        if let Some(c) = &self.collected {
            if let Ok(mut c) = c.lock() {
                c.results.push(value.clone());
            }
        }
        self.send(ModuleEvent::Result(value)).await;
    }
}

// ============================================================================
// ModuleContext
// ============================================================================

/// Handle a module body uses to talk to its session.
///
/// The session itself is not exposed: its public methods serialize
/// top-level runs and would wait on the run that is calling them. Nested
/// runs, queries and reverts go through the methods here instead.
pub struct ModuleContext {
    session: Arc<Session>,
    descriptor: ModuleDescriptor,
    key: Option<CacheKey>,
    run_id: Uuid,
    chain: Vec<String>,
    cancel: CancellationToken,
    sink: Sink,
}

impl ModuleContext {
    pub(crate) fn new(
        session: Arc<Session>,
        descriptor: ModuleDescriptor,
        key: Option<CacheKey>,
        run_id: Uuid,
        chain: Vec<String>,
        cancel: CancellationToken,
        sink: Sink,
    ) -> Self {
        Self {
            session,
            descriptor,
            key,
            run_id,
            chain,
            cancel,
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.session.platform
    }

    pub fn target(&self) -> &TargetId {
        self.session.target()
    }

    pub fn gtfobins(&self) -> &GtfoBins {
        &self.session.gtfobins
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Module names from the outermost invocation down to this one.
    pub fn call_chain(&self) -> &[String] {
        &self.chain
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.session.settle(Error::Cancelled));
        }
        Ok(())
    }

    // --- events ---

    pub async fn status(&self, message: impl Into<String>) {
        self.sink.send(ModuleEvent::Status(message.into())).await;
    }

    pub async fn progress(&self, current: u64, total: Option<u64>) {
        self.sink.send(ModuleEvent::Progress { current, total }).await;
    }

    /// Intermediate result of a base or implant module.
    pub async fn emit_result(&self, value: Value) {
        self.sink.result(value).await;
    }

    /// Record and deliver a fact. Enumeration modules may only emit types
    /// they declare, and their facts take the descriptor's scope. Returns
    /// `false` when the same discovery was already recorded.
    pub async fn emit_fact(&self, mut fact: Fact) -> Result<bool> {
        self.check_cancelled()?;
        fact.source = self.descriptor.name.clone();
        if self.descriptor.is_enumeration() {
            let declared = fact
                .types
                .iter()
                .all(|t| self.descriptor.provides.iter().any(|p| p == t));
            if !declared {
                return Err(Error::invalid_module(
                    &self.descriptor.name,
                    format!("emitted undeclared fact type in {:?}", fact.types),
                ));
            }
            fact.scope = self.descriptor.scope;
        }

        let key = self
            .key
            .clone()
            .unwrap_or_else(|| CacheKey::module(self.descriptor.name.clone()));
        let fresh = match fact.scope {
            Scope::Host => self.session.store.stage(self.run_id, key, fact.clone()).await,
            Scope::Session => self.session.add_local(key, fact.clone()).await,
            Scope::None => true,
        };
        if fresh {
            self.sink.fact(fact).await;
        } else {
            debug!(module = %self.descriptor.name, "duplicate fact dropped");
        }
        Ok(fresh)
    }

    // --- platform ---

    /// Run a command under this invocation's cancellation token.
    pub async fn run_command(&self, argv: &[&str], options: RunOptions) -> Result<CompletedProcess> {
        self.check_cancelled()?;
        let options = options.cancel(self.cancel.clone());
        debug!(module = %self.descriptor.name, argv = ?argv, "run");
        self.session
            .guard(self.session.platform.run(argv, options).await)
    }

    pub async fn which(&self, name: &str) -> Result<Option<String>> {
        self.check_cancelled()?;
        self.session.guard(self.session.platform.which(name).await)
    }

    pub async fn getuid(&self) -> Result<Uid> {
        self.session.guard(self.session.platform.getuid().await)
    }

    pub async fn find_user(&self, name: &str) -> Result<Option<User>> {
        self.session.find_user(name).await
    }

    pub async fn find_group(&self, query: impl Into<IdQuery>) -> Result<Option<Group>> {
        self.session.find_group(query).await
    }

    pub async fn current_user(&self) -> Result<User> {
        self.session.current_user().await
    }

    /// Guarded wrapper for any other platform call.
    pub fn guard<T>(&self, result: Result<T>) -> Result<T> {
        self.session.guard(result)
    }

    // --- nested modules ---

    /// Run another module as part of this one. Its facts are collected and
    /// returned rather than forwarded to this run's caller.
    pub async fn run(&self, name: &str, args: Args) -> Result<ModuleOutput> {
        self.check_cancelled()?;
        let module = self.session.registry.get(name)?;
        let bound = self.session.prepare(&module, args)?;
        let collapse = module.descriptor().collapse_result;
        let sink = Sink::collecting();
        let value = execute(
            self.session.clone(),
            module,
            bound,
            self.chain.clone(),
            self.cancel.child_token(),
            sink.clone(),
        )
        .await?;
        let (facts, results) = sink.take();
        Ok(ModuleOutput {
            module: name.to_string(),
            facts,
            results,
            value,
            collapse,
        })
    }

    /// Facts of a type, running compatible providers first. A provider that
    /// fails is skipped unless the failure is fatal or a cycle.
    pub async fn query(&self, pattern: &str) -> Result<Vec<Fact>> {
        let pattern = TypePattern::new(pattern)?;
        let kind = self.session.platform.kind();
        let mut transient = Vec::new();
        for module in self.session.registry.modules_providing(&pattern) {
            if !module.descriptor().supports(kind) {
                continue;
            }
            match self.run(module.name(), Args::new()).await {
                Ok(out) => transient.extend(
                    out.facts
                        .into_iter()
                        .filter(|f| f.scope == Scope::None && pattern.matches_fact(f)),
                ),
                Err(e)
                    if e.is_fatal_to_session()
                        || matches!(e, Error::Cancelled | Error::CircularDependency { .. }) =>
                {
                    return Err(e)
                }
                Err(e) => warn!(module = module.name(), error = %e, "provider failed during query"),
            }
        }
        let mut facts = self.session.stored_facts(&pattern).await;
        facts.extend(transient);
        Ok(facts)
    }

    /// Known facts matching `pattern`, without running providers.
    pub async fn facts(&self, pattern: &str) -> Result<Vec<Fact>> {
        let pattern = TypePattern::new(pattern)?;
        Ok(self.session.stored_facts(&pattern).await)
    }

    // --- tampering ---

    /// Write a file, recording how to undo it: remove a new file, restore
    /// the previous content of a replaced one.
    pub async fn create_file(&self, path: &str, data: &[u8]) -> Result<TamperRecord> {
        self.check_cancelled()?;
        let platform = &self.session.platform;
        let original = match platform.read_bytes(path).await {
            Ok(bytes) => Some(bytes),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(self.session.settle(e)),
        };
        self.guard(platform.write_bytes(path, data).await)?;
        let (kind, revert) = match original {
            Some(bytes) => (TamperKind::ReplacedFile, RevertAction::restore_file(path, &bytes)),
            None => (
                TamperKind::CreatedFile,
                RevertAction::RemoveFile { path: path.to_string() },
            ),
        };
        self.record(path, kind, Some(revert)).await
    }

    /// Create a directory (parents included) and record its removal.
    pub async fn mkdir(&self, path: &str) -> Result<TamperRecord> {
        self.check_cancelled()?;
        self.guard(
            self.session
                .platform
                .mkdir(path, MkdirOptions { parents: true, exist_ok: false })
                .await,
        )?;
        self.record(
            path,
            TamperKind::CreatedDirectory,
            Some(RevertAction::RemoveDirectory { path: path.to_string() }),
        )
        .await
    }

    /// Change permissions, recording the previous mode.
    pub async fn chmod(&self, path: &str, mode: u32) -> Result<TamperRecord> {
        self.check_cancelled()?;
        let platform = &self.session.platform;
        let before = self.guard(platform.stat(path).await)?.permissions();
        self.guard(platform.chmod(path, mode).await)?;
        self.record(
            path,
            TamperKind::PermissionChange,
            Some(RevertAction::RestoreMode { path: path.to_string(), mode: before }),
        )
        .await
    }

    /// Append one line to a file (creating it if needed). The revert removes
    /// the line, or the whole file when it did not exist before.
    pub async fn append_line(&self, path: &str, line: &str, kind: TamperKind) -> Result<TamperRecord> {
        self.check_cancelled()?;
        let platform = &self.session.platform;
        let existing = match platform.read_bytes(path).await {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(self.session.settle(e)),
        };
        let mut content = existing.clone().unwrap_or_default();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(line);
        content.push('\n');
        self.guard(platform.write_bytes(path, content.as_bytes()).await)?;
        let revert = match existing {
            Some(_) => RevertAction::RemoveLine {
                path: path.to_string(),
                line: line.to_string(),
            },
            None => RevertAction::RemoveFile { path: path.to_string() },
        };
        self.record(path, kind, Some(revert)).await
    }

    /// Record a change made some other way.
    pub async fn tamper(
        &self,
        path: &str,
        kind: TamperKind,
        revert: Option<RevertAction>,
    ) -> Result<TamperRecord> {
        self.record(path, kind, revert).await
    }

    /// Revert a recorded change from inside a module (used by implant removal).
    pub async fn revert(&self, id: Uuid) -> Result<RevertOutcome> {
        self.check_cancelled()?;
        self.guard(ledger::revert(self.session.platform.as_ref(), &self.session.store, id).await)
    }

    async fn record(
        &self,
        path: &str,
        kind: TamperKind,
        revert: Option<RevertAction>,
    ) -> Result<TamperRecord> {
        let uid = self.session.platform.getuid().await.ok();
        let record = TamperRecord::new(path, kind, revert, self.descriptor.name.clone(), uid);
        info!(module = %self.descriptor.name, id = %record.id, %record, "tamper recorded");
        self.session.store.add_tamper(record.clone()).await?;
        Ok(record)
    }
}
