//! Fact store: one persisted document per target.
//!
//! Layout: `<root>/<target-id>.json`, a versioned document holding committed
//! facts, completed-run markers and the tamper ledger. Documents written by
//! older releases are migrated when opened.
//!
//! Facts produced by a running module are *staged*: they are visible to
//! queries at once but only reach disk when the run commits. A successful run
//! commits its facts together with its completion marker in one atomic write
//! (temp file + rename). A failed run commits its facts without the marker, so
//! the module runs again next time.

use crate::ledger::TamperRecord;
use crate::pattern::TypePattern;
use crate::schedule::CacheKey;
use dashmap::DashMap;
use foothold_core::config::StoreConfig;
use foothold_core::{Error, Fact, Result, TargetId};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Current on-disk document version.
pub const STORE_VERSION: u32 = 2;

/// A committed fact and the run that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredFact {
    pub key: CacheKey,
    pub fact: Fact,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreDocument {
    pub version: u32,
    pub target: TargetId,
    #[serde(default)]
    pub facts: Vec<StoredFact>,
    #[serde(default)]
    pub completed: Vec<CacheKey>,
    #[serde(default)]
    pub tamper: Vec<TamperRecord>,
}

impl StoreDocument {
    fn empty(target: TargetId) -> Self {
        Self {
            version: STORE_VERSION,
            target,
            facts: Vec::new(),
            completed: Vec::new(),
            tamper: Vec::new(),
        }
    }

    fn has(&self, record: &StoredFact) -> bool {
        self.facts
            .iter()
            .any(|f| f.key == record.key && f.fact.same_discovery(&record.fact))
    }
}

/// Version 1 kept bare facts and completed module names.
#[derive(Deserialize)]
struct DocumentV1 {
    #[serde(default)]
    target: Option<TargetId>,
    #[serde(default)]
    facts: Vec<Fact>,
    #[serde(default)]
    completed: Vec<String>,
}

/// Bring a stored document of any known version up to [`STORE_VERSION`].
pub fn migrate(value: serde_json::Value, target: &TargetId) -> Result<StoreDocument> {
    let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(1);
    match version {
        1 => {
            let v1: DocumentV1 = serde_json::from_value(value)?;
            info!(target_id = target.short(), facts = v1.facts.len(), "migrating store document v1 -> v2");
            Ok(StoreDocument {
                version: STORE_VERSION,
                target: v1.target.unwrap_or_else(|| target.clone()),
                facts: v1
                    .facts
                    .into_iter()
                    .map(|fact| StoredFact {
                        key: CacheKey::module(fact.source.clone()),
                        fact,
                    })
                    .collect(),
                completed: v1.completed.into_iter().map(CacheKey::module).collect(),
                tamper: Vec::new(),
            })
        }
        2 => Ok(serde_json::from_value(value)?),
        newer => Err(Error::Store(format!(
            "store document version {} is newer than supported ({})",
            newer, STORE_VERSION
        ))),
    }
}

struct Staged {
    run: Uuid,
    record: StoredFact,
}

struct State {
    doc: StoreDocument,
    staged: Vec<Staged>,
}

impl State {
    /// Duplicates are judged per cache key: the same discovery made as
    /// another user belongs to that user's cached run too.
    fn contains(&self, key: &CacheKey, fact: &Fact) -> bool {
        self.doc
            .facts
            .iter()
            .any(|f| &f.key == key && f.fact.same_discovery(fact))
            || self
                .staged
                .iter()
                .any(|s| &s.record.key == key && s.record.fact.same_discovery(fact))
    }

    fn all(&self) -> impl Iterator<Item = &Fact> {
        self.doc
            .facts
            .iter()
            .map(|f| &f.fact)
            .chain(self.staged.iter().map(|s| &s.record.fact))
    }

    /// Facts passing `keep`, one per discovery, in insertion order.
    fn unique(&self, keep: impl Fn(&Fact) -> bool) -> Vec<Fact> {
        let mut out: Vec<Fact> = Vec::new();
        for fact in self.all().filter(|f| keep(f)) {
            if !out.iter().any(|seen| seen.same_discovery(fact)) {
                out.push(fact.clone());
            }
        }
        out
    }
}

/// All stored state for one target. Shared by every session on that target;
/// writers are serialized, readers run concurrently.
///
/// Every write re-reads the document under an advisory lock on
/// `<root>/<target-id>.lock`, applies its change to that fresh copy and
/// writes it back, so processes sharing a store root never drop each
/// other's commits. The in-memory copy only changes once the write landed.
pub struct TargetStore {
    id: TargetId,
    path: Option<PathBuf>,
    state: RwLock<State>,
}

impl TargetStore {
    fn new(id: TargetId, path: Option<PathBuf>, doc: StoreDocument) -> Self {
        Self {
            id,
            path,
            state: RwLock::new(State {
                doc,
                staged: Vec::new(),
            }),
        }
    }

    fn load(id: TargetId, path: PathBuf) -> Result<Self> {
        let doc = read_document(&id, &path)?;
        debug!(target_id = id.short(), facts = doc.facts.len(), "store loaded");
        Ok(Self::new(id, Some(path), doc))
    }

    pub fn target(&self) -> &TargetId {
        &self.id
    }

    /// Apply `change` to the latest document and make the result current.
    /// On error the in-memory document is left untouched.
    async fn update<T, F>(&self, state: &mut State, change: F) -> Result<T>
    where
        F: FnOnce(&mut StoreDocument) -> T + Send + 'static,
        T: Send + 'static,
    {
        let Some(path) = self.path.clone() else {
            let mut doc = state.doc.clone();
            let out = change(&mut doc);
            state.doc = doc;
            return Ok(out);
        };
        let id = self.id.clone();
        let (doc, out) = tokio::task::spawn_blocking(move || -> Result<(StoreDocument, T)> {
            let _lock = DocumentLock::acquire(&path.with_extension("lock"))?;
            let mut doc = read_document(&id, &path)?;
            let out = change(&mut doc);
            write_document(&path, &doc)?;
            Ok((doc, out))
        })
        .await
        .map_err(|e| Error::Store(format!("store writer: {}", e)))??;
        state.doc = doc;
        Ok(out)
    }

    // --- cache ---

    pub async fn is_complete(&self, key: &CacheKey) -> bool {
        self.state.read().await.doc.completed.contains(key)
    }

    /// Committed facts of one cached run, in production order.
    pub async fn cached_facts(&self, key: &CacheKey) -> Vec<Fact> {
        self.state
            .read()
            .await
            .doc
            .facts
            .iter()
            .filter(|f| &f.key == key)
            .map(|f| f.fact.clone())
            .collect()
    }

    /// Stage a fact for run `run`. Returns `false` for a duplicate discovery.
    pub async fn stage(&self, run: Uuid, key: CacheKey, fact: Fact) -> bool {
        let mut state = self.state.write().await;
        if state.contains(&key, &fact) {
            return false;
        }
        state.staged.push(Staged {
            run,
            record: StoredFact { key, fact },
        });
        true
    }

    /// Commit the staged facts of `run`, plus a completion marker when the run
    /// succeeded, in one write. Facts stay staged if the write fails.
    pub async fn commit(&self, run: Uuid, marker: Option<CacheKey>) -> Result<usize> {
        let mut state = self.state.write().await;
        let mine: Vec<StoredFact> = state
            .staged
            .iter()
            .filter(|s| s.run == run)
            .map(|s| s.record.clone())
            .collect();
        if mine.is_empty() && marker.is_none() {
            return Ok(0);
        }
        let count = self
            .update(&mut state, move |doc| {
                let mut added = 0;
                for record in mine {
                    if !doc.has(&record) {
                        doc.facts.push(record);
                        added += 1;
                    }
                }
                if let Some(key) = marker {
                    if !doc.completed.contains(&key) {
                        debug!(key = %key, facts = added, "run complete");
                        doc.completed.push(key);
                    }
                }
                added
            })
            .await?;
        state.staged.retain(|s| s.run != run);
        Ok(count)
    }

    /// Insert and commit one fact outside any module run.
    pub async fn insert(&self, key: CacheKey, fact: Fact) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.contains(&key, &fact) {
            return Ok(false);
        }
        let record = StoredFact { key, fact };
        self.update(&mut state, move |doc| {
            if doc.has(&record) {
                return false;
            }
            doc.facts.push(record);
            true
        })
        .await
    }

    /// Forget everything `module` produced so its next invocation runs again.
    pub async fn clear_module(&self, module: &str) -> Result<usize> {
        let mut state = self.state.write().await;
        let name = module.to_string();
        let removed = self
            .update(&mut state, move |doc| {
                let before = doc.facts.len();
                doc.facts.retain(|f| f.key.module != name);
                doc.completed.retain(|k| k.module != name);
                before - doc.facts.len()
            })
            .await?;
        info!(module, removed, "cache cleared");
        Ok(removed)
    }

    pub async fn remove_fact(&self, fact: &Fact) -> Result<bool> {
        let mut state = self.state.write().await;
        let fact = fact.clone();
        self.update(&mut state, move |doc| {
            let before = doc.facts.len();
            doc.facts.retain(|f| !f.fact.same_discovery(&fact));
            doc.facts.len() != before
        })
        .await
    }

    // --- queries ---

    /// Every fact, committed first, then staged, each in insertion order.
    pub async fn facts(&self) -> Vec<Fact> {
        self.state.read().await.unique(|_| true)
    }

    pub async fn query(&self, pattern: &TypePattern) -> Vec<Fact> {
        self.state.read().await.unique(|f| pattern.matches_fact(f))
    }

    pub async fn by_source(&self, module: &str) -> Vec<Fact> {
        self.state.read().await.unique(|f| f.source == module)
    }

    // --- tamper ledger ---

    pub async fn add_tamper(&self, record: TamperRecord) -> Result<()> {
        let mut state = self.state.write().await;
        self.update(&mut state, move |doc| {
            if !doc.tamper.iter().any(|r| r.id == record.id) {
                doc.tamper.push(record);
            }
        })
        .await
    }

    pub async fn tamper(&self) -> Vec<TamperRecord> {
        self.state.read().await.doc.tamper.clone()
    }

    pub async fn tamper_record(&self, id: Uuid) -> Option<TamperRecord> {
        self.state
            .read()
            .await
            .doc
            .tamper
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub async fn remove_tamper(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        self.update(&mut state, move |doc| {
            let before = doc.tamper.len();
            doc.tamper.retain(|r| r.id != id);
            doc.tamper.len() != before
        })
        .await
    }

    pub async fn mark_tamper_failed(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        self.update(&mut state, move |doc| {
            if let Some(r) = doc.tamper.iter_mut().find(|r| r.id == id) {
                r.failed = true;
            }
        })
        .await
    }
}

/// The document at `path`, migrated; empty when there is none yet.
fn read_document(id: &TargetId, path: &Path) -> Result<StoreDocument> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let value: serde_json::Value = serde_json::from_str(&content)
                .map_err(|e| Error::Store(format!("{}: {}", path.display(), e)))?;
            migrate(value, id)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreDocument::empty(id.clone())),
        Err(e) => Err(e.into()),
    }
}

/// Write the document atomically.
fn write_document(path: &Path, doc: &StoreDocument) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let json = serde_json::to_vec_pretty(doc)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| Error::Store(format!("{}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Exclusive advisory lock on a target's lock file, released on drop.
/// The lock file itself is never removed.
struct DocumentLock {
    file: std::fs::File,
}

impl DocumentLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::Store(format!("{}: {}", path.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // Blocks until the other writer is done.
            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if result != 0 {
                let err = std::io::Error::last_os_error();
                return Err(Error::Store(format!("locking {}: {}", path.display(), err)));
            }
        }

        Ok(Self { file })
    }
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// Entry point to all target documents.
pub struct FactStore {
    root: Option<PathBuf>,
    targets: DashMap<TargetId, Arc<TargetStore>>,
}

impl FactStore {
    /// Persistent store rooted at `root` (created if missing).
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::Store(format!("{}: {}", root.display(), e)))?;
        info!(root = %root.display(), "fact store opened");
        Ok(Self {
            root: Some(root),
            targets: DashMap::new(),
        })
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            targets: DashMap::new(),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match &config.path {
            Some(path) => Self::open(path),
            None => Ok(Self::in_memory()),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// The document for `id`, loaded on first use and shared afterwards.
    pub fn target(&self, id: &TargetId) -> Result<Arc<TargetStore>> {
        if let Some(existing) = self.targets.get(id) {
            return Ok(existing.clone());
        }
        let store = match &self.root {
            Some(root) => TargetStore::load(id.clone(), root.join(format!("{}.json", id)))?,
            None => TargetStore::new(id.clone(), None, StoreDocument::empty(id.clone())),
        };
        // Another session may have raced us here; keep whichever landed first.
        Ok(self
            .targets
            .entry(id.clone())
            .or_insert_with(|| Arc::new(store))
            .clone())
    }

    /// Targets with a document on disk (or loaded, for in-memory stores).
    pub fn known_targets(&self) -> Result<Vec<TargetId>> {
        let mut ids: Vec<TargetId> = self.targets.iter().map(|e| e.key().clone()).collect();
        if let Some(root) = &self.root {
            for entry in std::fs::read_dir(root)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    let id = TargetId::new(stem);
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fact(source: &str, path: &str) -> Fact {
        Fact::new(source, ["file.suid"], json!({ "path": path })).unwrap()
    }

    #[tokio::test]
    async fn staged_facts_visible_before_commit() {
        let store = FactStore::in_memory();
        let t = store.target(&TargetId::new("t")).unwrap();
        let run = Uuid::new_v4();
        assert!(t.stage(run, CacheKey::module("m"), fact("m", "/a")).await);
        assert_eq!(t.facts().await.len(), 1);
        assert!(t.cached_facts(&CacheKey::module("m")).await.is_empty());

        t.commit(run, Some(CacheKey::module("m"))).await.unwrap();
        assert!(t.is_complete(&CacheKey::module("m")).await);
        assert_eq!(t.cached_facts(&CacheKey::module("m")).await.len(), 1);
    }

    #[tokio::test]
    async fn duplicates_are_ignored() {
        let store = FactStore::in_memory();
        let t = store.target(&TargetId::new("t")).unwrap();
        let run = Uuid::new_v4();
        assert!(t.stage(run, CacheKey::module("m"), fact("m", "/a")).await);
        assert!(!t.stage(run, CacheKey::module("m"), fact("m", "/a")).await);
        t.commit(run, None).await.unwrap();
        assert!(!t.insert(CacheKey::module("m"), fact("m", "/a")).await.unwrap());
        assert_eq!(t.facts().await.len(), 1);
    }

    #[tokio::test]
    async fn same_discovery_under_another_uid_is_kept_per_key() {
        let store = FactStore::in_memory();
        let t = store.target(&TargetId::new("t")).unwrap();
        let (a, b) = (CacheKey::per_user("m", 1000), CacheKey::per_user("m", 0));
        assert!(t.stage(Uuid::new_v4(), a.clone(), fact("m", "/a")).await);
        assert!(t.stage(Uuid::new_v4(), b.clone(), fact("m", "/a")).await);
        assert_eq!(t.facts().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_run_commits_without_marker() {
        let store = FactStore::in_memory();
        let t = store.target(&TargetId::new("t")).unwrap();
        let run = Uuid::new_v4();
        t.stage(run, CacheKey::module("m"), fact("m", "/a")).await;
        t.commit(run, None).await.unwrap();
        assert!(!t.is_complete(&CacheKey::module("m")).await);
        assert_eq!(t.by_source("m").await.len(), 1);
    }

    #[tokio::test]
    async fn persists_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let id = TargetId::new("abc123");
        {
            let store = FactStore::open(tmp.path()).unwrap();
            let t = store.target(&id).unwrap();
            let run = Uuid::new_v4();
            t.stage(run, CacheKey::per_user("m", 0), fact("m", "/a")).await;
            t.commit(run, Some(CacheKey::per_user("m", 0))).await.unwrap();
        }
        let store = FactStore::open(tmp.path()).unwrap();
        let t = store.target(&id).unwrap();
        assert!(t.is_complete(&CacheKey::per_user("m", 0)).await);
        assert!(!t.is_complete(&CacheKey::per_user("m", 1000)).await);
        assert_eq!(store.known_targets().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn staged_facts_of_a_crashed_run_never_reach_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let id = TargetId::new("crash");
        {
            let store = FactStore::open(tmp.path()).unwrap();
            let t = store.target(&id).unwrap();
            t.insert(CacheKey::module("other"), fact("other", "/x")).await.unwrap();
            t.stage(Uuid::new_v4(), CacheKey::module("m"), fact("m", "/a")).await;
        }
        let store = FactStore::open(tmp.path()).unwrap();
        let t = store.target(&id).unwrap();
        assert!(t.by_source("m").await.is_empty());
        assert_eq!(t.facts().await.len(), 1);
    }

    #[tokio::test]
    async fn v1_document_is_migrated() {
        let tmp = tempfile::tempdir().unwrap();
        let id = TargetId::new("legacy");
        let v1 = json!({
            "version": 1,
            "facts": [fact("enumerate.file.suid", "/usr/bin/passwd")],
            "completed": ["enumerate.file.suid"]
        });
        std::fs::write(tmp.path().join("legacy.json"), v1.to_string()).unwrap();

        let store = FactStore::open(tmp.path()).unwrap();
        let t = store.target(&id).unwrap();
        let key = CacheKey::module("enumerate.file.suid");
        assert!(t.is_complete(&key).await);
        assert_eq!(t.cached_facts(&key).await.len(), 1);
        assert!(t.tamper().await.is_empty());
    }

    #[test]
    fn newer_version_rejected() {
        let err = migrate(json!({"version": 99, "target": "x"}), &TargetId::new("x")).unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn clear_module_invalidates() {
        let store = FactStore::in_memory();
        let t = store.target(&TargetId::new("t")).unwrap();
        let run = Uuid::new_v4();
        t.stage(run, CacheKey::module("m"), fact("m", "/a")).await;
        t.commit(run, Some(CacheKey::module("m"))).await.unwrap();
        assert_eq!(t.clear_module("m").await.unwrap(), 1);
        assert!(!t.is_complete(&CacheKey::module("m")).await);
        assert!(t.facts().await.is_empty());
    }

    #[tokio::test]
    async fn two_handles_on_one_root_keep_both_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let id = TargetId::new("shared");
        let a = FactStore::open(tmp.path()).unwrap();
        let b = FactStore::open(tmp.path()).unwrap();
        let (ta, tb) = (a.target(&id).unwrap(), b.target(&id).unwrap());

        let run = Uuid::new_v4();
        ta.stage(run, CacheKey::module("mod.a"), fact("mod.a", "/a")).await;
        ta.commit(run, Some(CacheKey::module("mod.a"))).await.unwrap();

        let run = Uuid::new_v4();
        tb.stage(run, CacheKey::module("mod.b"), fact("mod.b", "/b")).await;
        tb.commit(run, Some(CacheKey::module("mod.b"))).await.unwrap();
        // The later writer sees the earlier commit too.
        assert!(tb.is_complete(&CacheKey::module("mod.a")).await);

        let reopened = FactStore::open(tmp.path()).unwrap();
        let t = reopened.target(&id).unwrap();
        assert!(t.is_complete(&CacheKey::module("mod.a")).await);
        assert!(t.is_complete(&CacheKey::module("mod.b")).await);
        assert_eq!(t.facts().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_write_changes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("store");
        let store = FactStore::open(&root).unwrap();
        let t = store.target(&TargetId::new("gone")).unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        let run = Uuid::new_v4();
        let key = CacheKey::module("m");
        t.stage(run, key.clone(), fact("m", "/a")).await;
        assert!(t.commit(run, Some(key.clone())).await.is_err());
        assert!(!t.is_complete(&key).await);
        assert!(t.cached_facts(&key).await.is_empty());
        // Still staged, still visible.
        assert_eq!(t.by_source("m").await.len(), 1);

        let record = TamperRecord::new(
            "/tmp/x",
            crate::ledger::TamperKind::CreatedFile,
            None,
            "m",
            None,
        );
        assert!(t.add_tamper(record).await.is_err());
        assert!(t.tamper().await.is_empty());
    }

    #[tokio::test]
    async fn same_target_shares_one_document() {
        let store = FactStore::in_memory();
        let a = store.target(&TargetId::new("t")).unwrap();
        let b = store.target(&TargetId::new("t")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
