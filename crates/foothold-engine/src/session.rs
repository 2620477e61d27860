//! Session: one operator context bound to one platform and its target.
//!
//! Top-level invocations are serialized; a remote shell runs one command at a
//! time. Nested invocations made by a running module go through
//! [`ModuleContext::run`] and share the caller's slot. A channel error makes
//! the session unusable: it cancels everything in flight and every later call
//! fails with `Error::Channel`.

use crate::context::{ModuleContext, Sink};
use crate::events::{ModuleEvent, ModuleOutput, ModuleRun, EVENT_BUFFER};
use crate::gtfobins::GtfoBins;
use crate::ledger::{self, RevertOutcome, TamperRecord};
use crate::module::{Args, BoundArgs, Module, ModuleKind};
use crate::pattern::TypePattern;
use crate::registry::ModuleRegistry;
use crate::schedule::{needs_uid, CacheKey};
use crate::store::{StoredFact, TargetStore};
use foothold_core::{Error, Fact, Result, Scope, TargetId};
use foothold_platform::{Group, IdQuery, Platform, User};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Facts that live as long as the session.
#[derive(Default)]
struct LocalFacts {
    facts: Vec<StoredFact>,
    completed: Vec<CacheKey>,
}

pub struct Session {
    id: Uuid,
    pub(crate) platform: Arc<dyn Platform>,
    target: TargetId,
    pub(crate) store: Arc<TargetStore>,
    pub(crate) registry: Arc<ModuleRegistry>,
    pub(crate) gtfobins: Arc<GtfoBins>,
    local: RwLock<LocalFacts>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    root: CancellationToken,
    current: Mutex<Option<CancellationToken>>,
    broken: Mutex<Option<String>>,
}

impl Session {
    pub(crate) fn new(
        platform: Arc<dyn Platform>,
        target: TargetId,
        store: Arc<TargetStore>,
        registry: Arc<ModuleRegistry>,
        gtfobins: Arc<GtfoBins>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            platform,
            target,
            store,
            registry,
            gtfobins,
            local: RwLock::new(LocalFacts::default()),
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            root: CancellationToken::new(),
            current: Mutex::new(None),
            broken: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    // --- validity ---

    pub fn is_valid(&self) -> bool {
        self.broken.lock().map(|b| b.is_none()).unwrap_or(false)
    }

    fn broken_reason(&self) -> Option<String> {
        self.broken
            .lock()
            .map(|b| b.clone())
            .unwrap_or_else(|_| Some("session state poisoned".into()))
    }

    pub(crate) fn ensure_valid(&self) -> Result<()> {
        match self.broken_reason() {
            None => Ok(()),
            Some(reason) => Err(Error::Channel(reason)),
        }
    }

    fn invalidate(&self, reason: String) {
        if let Ok(mut broken) = self.broken.lock() {
            if broken.is_none() {
                warn!(session = %self.id, target_id = self.target.short(), %reason, "session invalidated");
                *broken = Some(reason);
            }
        }
        self.root.cancel();
    }

    /// Classify an error against session state: channel errors invalidate the
    /// session, and cancellations caused by that surface as the channel error.
    pub(crate) fn settle(&self, error: Error) -> Error {
        if error.is_fatal_to_session() {
            self.invalidate(error.to_string());
            return error;
        }
        if matches!(error, Error::Cancelled) {
            if let Some(reason) = self.broken_reason() {
                return Error::Channel(reason);
            }
        }
        error
    }

    pub(crate) fn guard<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.settle(e))
    }

    /// Interrupt the running top-level invocation, if any.
    pub fn cancel(&self) {
        if let Ok(current) = self.current.lock() {
            if let Some(token) = current.as_ref() {
                info!(session = %self.id, "cancelling current run");
                token.cancel();
            }
        }
    }

    /// End the session. Everything in flight is cancelled.
    pub fn close(&self) {
        if let Ok(mut broken) = self.broken.lock() {
            if broken.is_none() {
                *broken = Some("session closed".into());
            }
        }
        self.root.cancel();
    }

    // --- invocation ---

    /// Bind arguments and check the platform, before any module code runs.
    pub(crate) fn prepare(&self, module: &Arc<dyn Module>, args: Args) -> Result<BoundArgs> {
        let d = module.descriptor();
        let bound = d.bind(args)?;
        let actual = self.platform.kind();
        if !d.supports(actual) {
            return Err(Error::IncorrectPlatform {
                module: d.name.clone(),
                expected: d
                    .platforms
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                actual,
            });
        }
        Ok(bound)
    }

    /// Start a top-level invocation. Validation errors return here; everything
    /// else arrives on the run's event stream.
    pub async fn run(self: &Arc<Self>, name: &str, args: Args) -> Result<ModuleRun> {
        self.ensure_valid()?;
        let module = self.registry.get(name)?;
        let bound = self.prepare(&module, args)?;
        let collapse = module.descriptor().collapse_result;

        let slot = self.run_lock.clone().lock_owned().await;
        self.ensure_valid()?;
        let token = self.root.child_token();
        if let Ok(mut current) = self.current.lock() {
            *current = Some(token.clone());
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let session = self.clone();
        let worker_token = token.clone();
        let task = tokio::spawn(async move {
            let _slot = slot;
            let result = execute(
                session.clone(),
                module,
                bound,
                Vec::new(),
                worker_token,
                Sink::stream(tx.clone()),
            )
            .await;
            if let Ok(mut current) = session.current.lock() {
                *current = None;
            }
            let terminal = match result {
                Ok(value) => ModuleEvent::Done(value),
                Err(e) => ModuleEvent::Failed(e),
            };
            let _ = tx.send(terminal).await;
        });
        Ok(ModuleRun::new(name.to_string(), collapse, rx, token, task))
    }

    /// `run` followed by `collect`.
    pub async fn run_collect(self: &Arc<Self>, name: &str, args: Args) -> Result<ModuleOutput> {
        self.run(name, args).await?.collect().await
    }

    /// Facts of a type, running every compatible provider first (through the
    /// cache). Providers that fail are skipped unless the failure is fatal.
    pub async fn query(self: &Arc<Self>, pattern: &str) -> Result<Vec<Fact>> {
        let pattern = TypePattern::new(pattern)?;
        let mut transient = Vec::new();
        for module in self.registry.modules_providing(&pattern) {
            if !module.descriptor().supports(self.platform.kind()) {
                continue;
            }
            match self.run_collect(module.name(), Args::new()).await {
                Ok(out) => transient.extend(
                    out.facts
                        .into_iter()
                        .filter(|f| f.scope == Scope::None && pattern.matches_fact(f)),
                ),
                Err(e) if propagates_from_query(&e) => return Err(e),
                Err(e) => warn!(module = module.name(), error = %e, "provider failed during query"),
            }
        }
        let mut facts = self.stored_facts(&pattern).await;
        facts.extend(transient);
        Ok(facts)
    }

    // --- facts ---

    /// Every known fact: host facts from the store, then session facts.
    pub async fn facts(&self) -> Vec<Fact> {
        let mut facts = self.store.facts().await;
        let local = self.local.read().await;
        for f in &local.facts {
            if !facts.iter().any(|seen| seen.same_discovery(&f.fact)) {
                facts.push(f.fact.clone());
            }
        }
        facts
    }

    /// Known facts matching `pattern`, without running anything.
    pub async fn stored_facts(&self, pattern: &TypePattern) -> Vec<Fact> {
        let mut facts = self.store.query(pattern).await;
        let local = self.local.read().await;
        for f in local.facts.iter().filter(|f| pattern.matches_fact(&f.fact)) {
            if !facts.iter().any(|seen| seen.same_discovery(&f.fact)) {
                facts.push(f.fact.clone());
            }
        }
        facts
    }

    /// Register a fact produced outside a module run. Returns `false` for a
    /// duplicate or for `None` scope (nothing to keep).
    pub async fn register_fact(&self, fact: Fact) -> Result<bool> {
        let key = CacheKey::module(fact.source.clone());
        match fact.scope {
            Scope::Host => self.store.insert(key, fact).await,
            Scope::Session => Ok(self.add_local(key, fact).await),
            Scope::None => Ok(false),
        }
    }

    /// Invalidate a cached module so its next invocation runs again.
    pub async fn clear_module(&self, name: &str) -> Result<usize> {
        let mut local = self.local.write().await;
        local.facts.retain(|f| f.key.module != name);
        local.completed.retain(|k| k.module != name);
        drop(local);
        self.store.clear_module(name).await
    }

    pub(crate) async fn add_local(&self, key: CacheKey, fact: Fact) -> bool {
        let mut local = self.local.write().await;
        if local
            .facts
            .iter()
            .any(|f| f.key == key && f.fact.same_discovery(&fact))
        {
            return false;
        }
        local.facts.push(StoredFact { key, fact });
        true
    }

    /// Facts of a completed cached run, or `None` when it has to run.
    async fn cached(&self, scope: Scope, key: &CacheKey) -> Option<Vec<Fact>> {
        match scope {
            Scope::Host => {
                if self.store.is_complete(key).await {
                    Some(self.store.cached_facts(key).await)
                } else {
                    None
                }
            }
            Scope::Session => {
                let local = self.local.read().await;
                local.completed.contains(key).then(|| {
                    local
                        .facts
                        .iter()
                        .filter(|f| &f.key == key)
                        .map(|f| f.fact.clone())
                        .collect()
                })
            }
            Scope::None => None,
        }
    }

    /// Commit what a run staged. The marker is only written for success.
    async fn finish_run(&self, scope: Scope, run: Uuid, marker: Option<CacheKey>) -> Result<()> {
        let host_marker = if scope == Scope::Host { marker.clone() } else { None };
        self.store.commit(run, host_marker).await?;
        if scope == Scope::Session {
            if let Some(key) = marker {
                let mut local = self.local.write().await;
                if !local.completed.contains(&key) {
                    local.completed.push(key);
                }
            }
        }
        Ok(())
    }

    // --- identity ---

    pub async fn find_user(&self, query: impl Into<IdQuery>) -> Result<Option<User>> {
        self.ensure_valid()?;
        self.guard(self.platform.find_user(query.into()).await)
    }

    pub async fn find_group(&self, query: impl Into<IdQuery>) -> Result<Option<Group>> {
        self.ensure_valid()?;
        self.guard(self.platform.find_group(query.into()).await)
    }

    /// The user commands currently run as.
    pub async fn current_user(&self) -> Result<User> {
        self.ensure_valid()?;
        let uid = self.guard(self.platform.getuid().await)?;
        if let Some(user) = self.find_user(uid).await? {
            return Ok(user);
        }
        // Not in the account database (containers, NSS-only users).
        let name = self.guard(self.platform.whoami().await)?;
        Ok(User {
            name,
            uid,
            gid: uid,
            gecos: String::new(),
            home: String::new(),
            shell: String::new(),
        })
    }

    // --- tamper ledger ---

    pub async fn tamper(&self) -> Vec<TamperRecord> {
        self.store.tamper().await
    }

    pub async fn revert(&self, id: Uuid) -> Result<RevertOutcome> {
        self.ensure_valid()?;
        let _slot = self.run_lock.lock().await;
        self.guard(ledger::revert(self.platform.as_ref(), &self.store, id).await)
    }

    /// Undo an implant through the module that installed it, then forget its
    /// fact.
    pub async fn remove_implant(self: &Arc<Self>, fact: &Fact) -> Result<()> {
        self.ensure_valid()?;
        let module = self.registry.get(&fact.source)?;
        let d = module.descriptor().clone();
        if d.kind != ModuleKind::Implant {
            return Err(Error::invalid_argument(
                "fact",
                format!("{} is not an implant module", d.name),
            ));
        }
        let _slot = self.run_lock.lock().await;
        let token = self.root.child_token();
        let ctx = ModuleContext::new(
            self.clone(),
            d.clone(),
            None,
            Uuid::new_v4(),
            vec![d.name.clone()],
            token,
            Sink::discard(),
        );
        self.guard(module.remove(&ctx, fact).await)?;
        self.store.remove_fact(fact).await?;
        self.local
            .write()
            .await
            .facts
            .retain(|f| !f.fact.same_discovery(fact));
        info!(module = %d.name, "implant removed");
        Ok(())
    }
}

fn propagates_from_query(e: &Error) -> bool {
    e.is_fatal_to_session() || matches!(e, Error::Cancelled | Error::CircularDependency { .. })
}

/// Run one module invocation: cycle check, cache lookup, body, commit.
pub(crate) fn execute(
    session: Arc<Session>,
    module: Arc<dyn Module>,
    args: BoundArgs,
    chain: Vec<String>,
    cancel: CancellationToken,
    sink: Sink,
) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        session.ensure_valid()?;
        let d = module.descriptor().clone();

        if chain.contains(&d.name) {
            let mut cycle = chain;
            cycle.push(d.name.clone());
            warn!(chain = ?cycle, "circular module dependency");
            return Err(Error::CircularDependency { chain: cycle });
        }
        let mut chain = chain;
        chain.push(d.name.clone());

        let key = if d.is_enumeration() {
            let uid = if needs_uid(d.schedule) {
                session.platform.refresh_uid();
                Some(session.guard(session.platform.getuid().await)?)
            } else {
                None
            };
            CacheKey::for_schedule(&d.name, d.schedule, uid)
        } else {
            None
        };

        if let Some(key) = &key {
            if let Some(facts) = session.cached(d.scope, key).await {
                debug!(module = %d.name, key = %key, facts = facts.len(), "cache hit");
                for fact in facts {
                    sink.fact(fact).await;
                }
                return Ok(Value::Null);
            }
        }

        let run = Uuid::new_v4();
        info!(module = %d.name, target_id = session.target.short(), key = ?key.as_ref().map(|k| k.to_string()), "running module");
        let ctx = ModuleContext::new(
            session.clone(),
            d.clone(),
            key.clone(),
            run,
            chain,
            cancel.clone(),
            sink,
        );
        let result = tokio::select! {
            r = module.run(&ctx, &args) => r,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        drop(ctx);

        let marker = if result.is_ok() { key } else { None };
        let committed = session.finish_run(d.scope, run, marker).await;

        match result {
            Ok(value) => {
                committed?;
                debug!(module = %d.name, "module finished");
                Ok(value)
            }
            Err(e) => {
                if let Err(commit_err) = committed {
                    warn!(module = %d.name, error = %commit_err, "could not commit partial facts");
                }
                let e = session.settle(e);
                warn!(module = %d.name, error = %e, "module failed");
                Err(e)
            }
        }
    })
}
