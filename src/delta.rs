//! Content-delta service.
//!
//! Answers two questions: "what is the current hash of this path or path
//! set?" and "which stable version ID corresponds to that hash?". Version
//! IDs are monotonic integers; two IDs are equal iff the corresponding
//! content hashed identically in some prior or current run. The revisions
//! table is persisted, so content reverting to an earlier state regains its
//! earlier ID.
//!
//! Hash shapes are deliberately asymmetric: a directory hashes its shallow
//! structure (type tag and name per child), while a path set hashes the
//! full recursive content of every match. The include-path rebuild decision
//! depends on this split — a set hash notices any file added, removed, or
//! modified inside an include tree, while a directory hash only notices
//! direct structural changes.

use crate::errors::{BuildError, SharedError, SharedResult};
use crate::path::{AbsPath, PathLike, PathSet};
use crate::persist::{Persistence, Section};
use crate::runtime::{AsyncRuntime, SingleFlight, TaskHandle, TaskRuntime};
use crate::workspace::{Module, Workspace};
use anyhow::Result;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Arc, Mutex, OnceLock};

const DELTA_TAG: &str = "delta";

/// Per-path persisted record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct DeltaRecord {
    /// Modification time used as the fast-skip short circuit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<f64>,
    /// Most recent content hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    /// Version ID assigned to the current hash, if one was ever requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    /// Previously seen hashes and the IDs they were assigned.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    revisions: BTreeMap<String, u64>,
}

impl DeltaRecord {
    fn is_empty(&self) -> bool {
        self.time.is_none() && self.hash.is_none() && self.id.is_none() && self.revisions.is_empty()
    }
}

struct DeltaState {
    items: HashMap<String, DeltaRecord>,
    counter: u64,
    /// Version ID → record key, for `test(version)`.
    id_index: HashMap<u64, String>,
    /// Sub-paths that contributed to the last hash of each key, this run.
    subpaths: HashMap<String, Vec<String>>,
}

pub struct FileDeltaChecker {
    state: Mutex<Option<DeltaState>>,
    flights: SingleFlight<String, ()>,
    rt: OnceLock<Arc<TaskRuntime>>,
    ignored: Vec<PathSet>,
}

impl Default for FileDeltaChecker {
    fn default() -> Self {
        Self {
            state: Mutex::new(None),
            flights: SingleFlight::new(),
            rt: OnceLock::new(),
            ignored: vec![PathSet::new("**/.git/**")],
        }
    }
}

enum PathKind {
    File,
    Dir,
    Absent,
}

fn kind_of(path: &AbsPath) -> PathKind {
    if path.is_file() {
        PathKind::File
    } else if path.is_dir() {
        PathKind::Dir
    } else {
        PathKind::Absent
    }
}

fn type_tag(path: &AbsPath) -> &'static [u8] {
    match kind_of(path) {
        PathKind::File => b"f",
        PathKind::Dir => b"d",
        PathKind::Absent => b"",
    }
}

/// Stream the file through MD5 in large blocks.
fn hash_file(path: &AbsPath) -> SharedResult<String> {
    let mut file = std::fs::File::open(path.std_path()).map_err(|source| {
        SharedError::from(BuildError::Io {
            path: path.as_str().to_string(),
            source,
        })
    })?;
    let mut digest = Md5::new();
    let mut buf = vec![0u8; 0x0010_0000];
    loop {
        let n = file.read(&mut buf).map_err(|source| {
            SharedError::from(BuildError::Io {
                path: path.as_str().to_string(),
                source,
            })
        })?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(hex::encode(digest.finalize()))
}

impl FileDeltaChecker {
    /// Extend the shared ignore filter. Only callable before activation is
    /// handed to the workspace.
    pub fn with_ignored(mut self, pattern: &str) -> Self {
        self.ignored.push(PathSet::new(pattern));
        self
    }

    fn is_relevant(&self, path: &AbsPath) -> bool {
        !self.ignored.iter().any(|set| set.contains(path))
    }

    fn rt(&self) -> SharedResult<Arc<TaskRuntime>> {
        self.rt.get().cloned().ok_or_else(|| {
            SharedError::from(BuildError::Invariant("delta checker is not running".into()))
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut DeltaState) -> R) -> SharedResult<R> {
        let mut guard = self.state.lock().expect("delta state poisoned");
        let state = guard.as_mut().ok_or_else(|| {
            SharedError::from(BuildError::Invariant("delta checker is not running".into()))
        })?;
        Ok(f(state))
    }

    /// Bring the module up outside a workspace; used by `start` and tests.
    pub(crate) fn boot(&self, core: Arc<TaskRuntime>, section: Section) {
        let _ = self.rt.set(core);

        let counter = section
            .get("counter")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let items: HashMap<String, DeltaRecord> = section
            .get("items")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();

        let mut id_index = HashMap::new();
        for (key, record) in &items {
            if let Some(id) = record.id {
                id_index.insert(id, key.clone());
            }
            for id in record.revisions.values() {
                id_index.entry(*id).or_insert_with(|| key.clone());
            }
        }

        *self.state.lock().expect("delta state poisoned") = Some(DeltaState {
            items,
            counter,
            id_index,
            subpaths: HashMap::new(),
        });
    }

    /// Tear the module down, producing the section to persist.
    pub(crate) fn shutdown(&self) -> Section {
        let state = self.state.lock().expect("delta state poisoned").take();
        let mut section = Section::new();
        if let Some(state) = state {
            let items: BTreeMap<String, DeltaRecord> = state
                .items
                .into_iter()
                .filter(|(_, record)| !record.is_empty())
                .collect();
            section.insert(
                "counter".into(),
                serde_json::Value::from(state.counter),
            );
            section.insert(
                "items".into(),
                serde_json::to_value(items).unwrap_or_default(),
            );
        }
        section
    }

    fn parse_key(key: &str) -> PathLike {
        PathLike::Set(PathSet::new(key)).sanitize()
    }

    /// Per-run memoized refresh; concurrent callers join one task.
    fn refresh_handle(self: &Arc<Self>, key: &PathLike) -> SharedResult<TaskHandle<()>> {
        let rt = self.rt()?;
        let key_string = key.key_string();
        Ok(self.flights.get_or_spawn(&rt, key_string, || {
            let this = self.clone();
            let key = key.clone();
            async move { this.do_refresh(key).await }
        }))
    }

    async fn do_refresh(self: Arc<Self>, key: PathLike) -> SharedResult<()> {
        let key_string = key.key_string();
        let old_subpaths: Vec<String> = self
            .with_state(|st| st.subpaths.get(&key_string).cloned())?
            .unwrap_or_default();

        let new_subpaths = match &key {
            PathLike::Path(path) => self.refresh_path(&key_string, path).await?,
            PathLike::Set(set) => self.refresh_set(&key_string, set).await?,
        };

        // Re-resolve the version from the revisions table; unseen hashes
        // stay unassigned until a version is requested.
        self.with_state(|st| {
            if let Some(record) = st.items.get_mut(&key_string) {
                record.id = match &record.hash {
                    Some(hash) => record.revisions.get(hash).copied(),
                    None => None,
                };
            }
            match new_subpaths {
                Some(subs) => {
                    st.subpaths.insert(key_string.clone(), subs);
                }
                None => {
                    st.subpaths.remove(&key_string);
                }
            }
        })?;

        // Paths that fell out of the enumeration are hinted deleted so a
        // stale cached hash cannot satisfy a later query.
        for dropped in &old_subpaths {
            let still_there = self
                .with_state(|st| {
                    st.subpaths
                        .get(&key_string)
                        .is_some_and(|subs| subs.contains(dropped))
                })?;
            if !still_there && !self.flights.contains(dropped) {
                self.with_state(|st| {
                    if let Some(record) = st.items.get_mut(dropped) {
                        record.time = None;
                        record.hash = None;
                        record.id = None;
                    }
                })?;
            }
        }
        Ok(())
    }

    /// Refresh a concrete path: content hash for files, shallow structure
    /// hash for directories, cleared record for absent paths.
    async fn refresh_path(
        self: &Arc<Self>,
        key_string: &str,
        path: &AbsPath,
    ) -> SharedResult<Option<Vec<String>>> {
        match kind_of(path) {
            PathKind::Absent => {
                self.with_state(|st| {
                    let record = st.items.entry(key_string.to_string()).or_default();
                    record.time = None;
                    record.hash = None;
                })?;
                Ok(None)
            }
            PathKind::File => {
                let mtime = path.modified_time();
                let stored = self.with_state(|st| {
                    st.items.get(key_string).and_then(|record| record.time)
                })?;
                if mtime.is_some() && mtime == stored {
                    return Ok(None);
                }
                let target = path.clone();
                let hash = self.rt()?.offload(move || hash_file(&target)).await??;
                tracing::debug!(path = %path, hash = %hash, "rehashed file");
                self.with_state(|st| {
                    let record = st.items.entry(key_string.to_string()).or_default();
                    record.hash = Some(hash);
                    record.time = mtime;
                })?;
                Ok(None)
            }
            PathKind::Dir => {
                let mtime = path.modified_time();
                let stored = self.with_state(|st| {
                    st.items.get(key_string).and_then(|record| record.time)
                })?;
                if mtime.is_some() && mtime == stored {
                    return Ok(None);
                }
                let children: Vec<AbsPath> = path
                    .children()
                    .into_iter()
                    .filter(|child| self.is_relevant(child))
                    .collect();
                let mut digest = Md5::new();
                for child in &children {
                    digest.update([0u8]);
                    digest.update(type_tag(child));
                    digest.update([0u8]);
                    digest.update(child.name().as_bytes());
                }
                let hash = hex::encode(digest.finalize());
                self.with_state(|st| {
                    let record = st.items.entry(key_string.to_string()).or_default();
                    record.hash = Some(hash);
                    record.time = mtime;
                })?;
                Ok(Some(
                    children.iter().map(|c| c.as_str().to_string()).collect(),
                ))
            }
        }
    }

    /// Refresh a pattern set: deterministic enumeration, recursive content
    /// hash per match.
    async fn refresh_set(
        self: &Arc<Self>,
        key_string: &str,
        set: &PathSet,
    ) -> SharedResult<Option<Vec<String>>> {
        let probe = set.clone();
        let matches: Vec<AbsPath> = self
            .rt()?
            .offload(move || probe.find_all(None).map_err(SharedError::from))
            .await??
            .into_iter()
            .filter(|path| self.is_relevant(path))
            .collect();

        let mut handles = Vec::with_capacity(matches.len());
        for found in &matches {
            handles.push(self.refresh_handle(&PathLike::Path(found.clone()))?);
        }

        let mut digest = Md5::new();
        for (found, handle) in matches.iter().zip(handles) {
            handle.await?;
            let hash = self
                .with_state(|st| {
                    st.items
                        .get(found.as_str())
                        .and_then(|record| record.hash.clone())
                })?
                .unwrap_or_default();
            digest.update([0u8]);
            digest.update(found.as_str().as_bytes());
            digest.update([0u8]);
            digest.update(hash.as_bytes());
        }
        let hash = hex::encode(digest.finalize());
        self.with_state(|st| {
            let record = st.items.entry(key_string.to_string()).or_default();
            record.hash = Some(hash);
        })?;
        Ok(Some(
            matches.iter().map(|m| m.as_str().to_string()).collect(),
        ))
    }

    /// Current content hash of the path or set, `None` for absent paths.
    pub async fn hash_of(
        self: &Arc<Self>,
        path: impl Into<PathLike>,
    ) -> SharedResult<Option<String>> {
        let key = path.into().sanitize();
        self.refresh_handle(&key)?.await?;
        self.with_state(|st| {
            st.items
                .get(&key.key_string())
                .and_then(|record| record.hash.clone())
        })
    }

    /// The stable version ID for the current content, allocating the next
    /// counter value on first observation of a hash.
    pub async fn query(self: &Arc<Self>, path: impl Into<PathLike>) -> SharedResult<u64> {
        let key = path.into().sanitize();
        self.refresh_handle(&key)?.await?;
        let key_string = key.key_string();
        self.with_state(|st| {
            let state = &mut *st;
            let record = state
                .items
                .get_mut(&key_string)
                .ok_or_else(|| SharedError::from(BuildError::AbsentPath(key_string.clone())))?;
            let hash = record
                .hash
                .clone()
                .ok_or_else(|| SharedError::from(BuildError::AbsentPath(key_string.clone())))?;
            if let Some(id) = record.id {
                return Ok(id);
            }
            let id = state.counter;
            state.counter += 1;
            record.revisions.insert(hash, id);
            record.id = Some(id);
            state.id_index.insert(id, key_string.clone());
            Ok(id)
        })?
    }

    /// True iff the current content of the path that produced `version`
    /// still hashes to the value that originally produced it.
    pub async fn test(self: &Arc<Self>, version: u64) -> SharedResult<bool> {
        let key_string = self.with_state(|st| st.id_index.get(&version).cloned())?;
        let Some(key_string) = key_string else {
            return Ok(false);
        };
        let key = Self::parse_key(&key_string);
        self.refresh_handle(&key)?.await?;
        self.with_state(|st| {
            st.items
                .get(&key_string)
                .is_some_and(|record| record.id == Some(version))
        })
    }

    /// Drop the per-run refresh memo for the path (and, for sets, for their
    /// enumerated members) so the next query re-probes the filesystem. Used
    /// after a build step rewrites its output.
    pub fn clear(&self, path: impl Into<PathLike>) {
        let key = path.into().sanitize();
        let key_string = key.key_string();
        self.flights.forget(&key_string);
        if let PathLike::Set(_) = key {
            let subs = self
                .with_state(|st| st.subpaths.get(&key_string).cloned())
                .ok()
                .flatten()
                .unwrap_or_default();
            for sub in subs {
                self.flights.forget(&sub);
            }
        }
    }
}

impl Module for FileDeltaChecker {
    fn tag(&self) -> &'static str {
        DELTA_TAG
    }

    fn activate(&self, ws: &mut Workspace) -> Result<()> {
        ws.add::<Persistence>()?;
        ws.add::<AsyncRuntime>()?;
        Ok(())
    }

    fn start(&self, ws: &Workspace) -> Result<()> {
        let persistence = ws.get::<Persistence>()?;
        let core = ws.get::<AsyncRuntime>()?.core()?;
        self.boot(core, persistence.take_section(DELTA_TAG));
        Ok(())
    }

    fn finish(&self, ws: &Workspace) -> Result<()> {
        let persistence = ws.get::<Persistence>()?;
        persistence.put_section(DELTA_TAG, self.shutdown());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> Arc<FileDeltaChecker> {
        let core = Arc::new(TaskRuntime::new(tokio::runtime::Handle::current(), 2));
        let checker = Arc::new(FileDeltaChecker::default());
        checker.boot(core, Section::new());
        checker
    }

    fn reboot(old: &Arc<FileDeltaChecker>) -> Arc<FileDeltaChecker> {
        let section = old.shutdown();
        let core = Arc::new(TaskRuntime::new(tokio::runtime::Handle::current(), 2));
        let next = Arc::new(FileDeltaChecker::default());
        next.boot(core, section);
        next
    }

    /// Step past coarse filesystem timestamp granularity so rewrites are
    /// visible to the mtime fast path.
    fn mtime_gap() {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    #[tokio::test]
    async fn version_is_stable_across_runs_for_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = AbsPath::new(dir.path().join("a.txt"));
        std::fs::write(file.std_path(), "hello").unwrap();

        let checker = checker();
        let first = checker.query(file.clone()).await.unwrap();

        let checker = reboot(&checker);
        let second = checker.query(file.clone()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn changed_content_gets_a_new_version_and_reverting_restores_it() {
        let dir = tempfile::tempdir().unwrap();
        let file = AbsPath::new(dir.path().join("a.txt"));
        std::fs::write(file.std_path(), "one").unwrap();

        let checker = checker();
        let v1 = checker.query(file.clone()).await.unwrap();

        mtime_gap();
        std::fs::write(file.std_path(), "two").unwrap();
        let checker = reboot(&checker);
        let v2 = checker.query(file.clone()).await.unwrap();
        assert_ne!(v1, v2);

        mtime_gap();
        std::fs::write(file.std_path(), "one").unwrap();
        let checker = reboot(&checker);
        let v3 = checker.query(file.clone()).await.unwrap();
        assert_eq!(v1, v3);
    }

    #[tokio::test]
    async fn test_checks_that_a_version_still_holds() {
        let dir = tempfile::tempdir().unwrap();
        let file = AbsPath::new(dir.path().join("a.txt"));
        std::fs::write(file.std_path(), "one").unwrap();

        let checker = checker();
        let v1 = checker.query(file.clone()).await.unwrap();
        assert!(checker.test(v1).await.unwrap());

        mtime_gap();
        std::fs::write(file.std_path(), "changed").unwrap();
        let checker = reboot(&checker);
        assert!(!checker.test(v1).await.unwrap());
        assert!(!checker.test(9999).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_queries_share_one_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let file = AbsPath::new(dir.path().join("a.txt"));
        std::fs::write(file.std_path(), "same").unwrap();

        let checker = checker();
        let (a, b) = tokio::join!(checker.query(file.clone()), checker.query(file.clone()));
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn absent_paths_have_no_version() {
        let dir = tempfile::tempdir().unwrap();
        let missing = AbsPath::new(dir.path().join("missing"));
        let checker = checker();
        let err = checker.query(missing).await.unwrap_err();
        assert!(matches!(err.kind(), BuildError::AbsentPath(_)));
    }

    #[tokio::test]
    async fn zero_byte_file_hashes_differently_from_absence() {
        let dir = tempfile::tempdir().unwrap();
        let empty = AbsPath::new(dir.path().join("empty"));
        std::fs::write(empty.std_path(), "").unwrap();

        let checker = checker();
        assert!(checker.hash_of(empty).await.unwrap().is_some());
        let missing = AbsPath::new(dir.path().join("missing"));
        assert!(checker.hash_of(missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directory_hash_sees_structure_not_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsPath::new(dir.path());
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();

        let checker = checker();
        let before = checker.hash_of(root.clone()).await.unwrap();

        // Content change: same structure, same directory hash.
        mtime_gap();
        std::fs::write(dir.path().join("a.txt"), "two").unwrap();
        let checker = reboot(&checker);
        let after_edit = checker.hash_of(root.clone()).await.unwrap();
        assert_eq!(before, after_edit);

        // Structural change: new child, different hash.
        mtime_gap();
        std::fs::write(dir.path().join("b.txt"), "x").unwrap();
        let checker = reboot(&checker);
        let after_add = checker.hash_of(root.clone()).await.unwrap();
        assert_ne!(before, after_add);
    }

    #[tokio::test]
    async fn set_hash_sees_recursive_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsPath::new(dir.path());
        std::fs::create_dir(dir.path().join("inc")).unwrap();
        std::fs::write(dir.path().join("inc/a.hpp"), "one").unwrap();

        let checker = checker();
        let v1 = checker.query(PathSet::under(&root)).await.unwrap();

        mtime_gap();
        std::fs::write(dir.path().join("inc/a.hpp"), "two").unwrap();
        let checker = reboot(&checker);
        let v2 = checker.query(PathSet::under(&root)).await.unwrap();
        assert_ne!(v1, v2);

        mtime_gap();
        std::fs::write(dir.path().join("inc/a.hpp"), "one").unwrap();
        let checker = reboot(&checker);
        let v3 = checker.query(PathSet::under(&root)).await.unwrap();
        assert_eq!(v1, v3);
    }

    #[tokio::test]
    async fn directory_with_only_ignored_children_hashes_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        std::fs::create_dir_all(dir.path().join("dirty/.git")).unwrap();

        let checker = checker();
        let empty = checker
            .hash_of(AbsPath::new(dir.path().join("empty")))
            .await
            .unwrap();
        let dirty = checker
            .hash_of(AbsPath::new(dir.path().join("dirty")))
            .await
            .unwrap();
        assert_eq!(empty, dirty);
    }

    #[tokio::test]
    async fn clear_forces_a_requery_within_one_run() {
        let dir = tempfile::tempdir().unwrap();
        let file = AbsPath::new(dir.path().join("a.txt"));
        std::fs::write(file.std_path(), "one").unwrap();

        let checker = checker();
        let v1 = checker.query(file.clone()).await.unwrap();

        mtime_gap();
        std::fs::write(file.std_path(), "two").unwrap();
        // Without clear the memoized refresh still answers.
        let cached = checker.query(file.clone()).await.unwrap();
        assert_eq!(v1, cached);

        checker.clear(file.clone());
        let fresh = checker.query(file.clone()).await.unwrap();
        assert_ne!(v1, fresh);
    }

    #[tokio::test]
    async fn shutdown_prunes_records_that_never_materialized() {
        let dir = tempfile::tempdir().unwrap();
        let missing = AbsPath::new(dir.path().join("missing"));
        let checker = checker();
        let _ = checker.hash_of(missing).await.unwrap();
        let section = checker.shutdown();
        let items = section.get("items").and_then(|v| v.as_object()).unwrap();
        assert!(items.is_empty());
    }
}
