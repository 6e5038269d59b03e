//! Output-file lock and witness registry.
//!
//! Every output path a build step produces is locked exactly once per run.
//! Holding the lock grants the owner a persisted witness record keyed by
//! (owner tag, path string) — the full justification for skipping the next
//! build of that file. On save, witnesses whose stored owner differs from
//! the current owner are pruned.
//!
//! The registry also hosts the managed copy step: its witness is the
//! source's version ID, and the copy is skipped when the source is
//! unchanged and the target still exists.

use crate::delta::FileDeltaChecker;
use crate::errors::{BuildError, SharedError, SharedResult};
use crate::path::AbsPath;
use crate::persist::{Persistence, Section};
use crate::progress::Progress;
use crate::runtime::{AsyncRuntime, SingleFlight, TaskHandle, TaskRuntime};
use crate::workspace::{Module, Workspace};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

const FILES_TAG: &str = "files";

/// Persisted justification for the last build of one output file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Witness {
    /// Sorted invariant arguments of the producing command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Version IDs of every contributing input, with `None` separators
    /// between input classes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_hash: Option<Vec<Option<u64>>>,
    /// Derived dependency versions (preprocess include closure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_hash: Option<Vec<u64>>,
    /// Source version for managed copies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_hash: Option<u64>,
    /// False when the producing subprocess emitted diagnostics; unstable
    /// outputs rebuild unconditionally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(rename = "optimalize", skip_serializing_if = "Option::is_none")]
    pub optimize: Option<bool>,
}

impl Witness {
    pub fn clear(&mut self) {
        *self = Witness::default();
    }
}

/// Shared handle to a locked output's witness.
pub type WitnessHandle = Arc<Mutex<Witness>>;

struct LockState {
    /// owner tag → path → witness, as persisted.
    store: HashMap<String, HashMap<String, Witness>>,
    /// Current-run ownership, one owner per path.
    owners: HashMap<String, &'static str>,
    /// Handles handed out this run, folded back into the store on save.
    live: Vec<(&'static str, String, WitnessHandle)>,
}

pub struct FileLocks {
    state: Mutex<Option<LockState>>,
    copies: SingleFlight<String, ()>,
    rt: OnceLock<Arc<TaskRuntime>>,
    delta: OnceLock<Arc<FileDeltaChecker>>,
    progress: OnceLock<Arc<Progress>>,
}

impl Default for FileLocks {
    fn default() -> Self {
        Self {
            state: Mutex::new(None),
            copies: SingleFlight::new(),
            rt: OnceLock::new(),
            delta: OnceLock::new(),
            progress: OnceLock::new(),
        }
    }
}

impl FileLocks {
    pub(crate) fn boot(&self, section: Section) {
        let store: HashMap<String, HashMap<String, Witness>> =
            serde_json::from_value(serde_json::Value::Object(section)).unwrap_or_default();
        *self.state.lock().expect("lock state poisoned") = Some(LockState {
            store,
            owners: HashMap::new(),
            live: Vec::new(),
        });
    }

    pub(crate) fn shutdown(&self) -> Section {
        let state = self.state.lock().expect("lock state poisoned").take();
        let Some(mut state) = state else {
            return Section::new();
        };

        for (owner, path, handle) in state.live.drain(..) {
            let witness = handle.lock().expect("witness poisoned").clone();
            state
                .store
                .entry(owner.to_string())
                .or_default()
                .insert(path, witness);
        }

        // Stale cross-owner records are discarded.
        let owners = &state.owners;
        for (tag, paths) in state.store.iter_mut() {
            paths.retain(|path, _| {
                owners
                    .get(path)
                    .is_none_or(|current| *current == tag.as_str())
            });
        }

        match serde_json::to_value(&state.store) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Section::new(),
        }
    }

    /// Claim the output path for `owner`. Exactly one claim is permitted
    /// per path per run; the returned handle is the persisted witness.
    pub fn lock(&self, path: &AbsPath, owner: &'static str) -> Result<WitnessHandle, BuildError> {
        let mut guard = self.state.lock().expect("lock state poisoned");
        let state = guard
            .as_mut()
            .ok_or_else(|| BuildError::Invariant("lock registry is not running".into()))?;

        let key = path.as_str().to_string();
        if let Some(previous) = state.owners.get(&key) {
            return Err(BuildError::LockConflict {
                path: key,
                owner: previous.to_string(),
            });
        }
        state.owners.insert(key.clone(), owner);

        let witness = state
            .store
            .get_mut(owner)
            .and_then(|paths| paths.remove(&key))
            .unwrap_or_default();
        let handle: WitnessHandle = Arc::new(Mutex::new(witness));
        state.live.push((owner, key, handle.clone()));
        Ok(handle)
    }

    fn deps(
        &self,
    ) -> SharedResult<(Arc<TaskRuntime>, Arc<FileDeltaChecker>, Arc<Progress>)> {
        let missing =
            || SharedError::from(BuildError::Invariant("lock registry is not running".into()));
        Ok((
            self.rt.get().cloned().ok_or_else(missing)?,
            self.delta.get().cloned().ok_or_else(missing)?,
            self.progress.get().cloned().ok_or_else(missing)?,
        ))
    }

    /// Copy one file, skipping when the source version is unchanged and the
    /// target still exists. Memoized per target path.
    pub fn copy_file(
        self: &Arc<Self>,
        source: AbsPath,
        target: AbsPath,
    ) -> SharedResult<TaskHandle<()>> {
        let (rt, delta, progress) = self.deps()?;
        let task_rt = rt.clone();
        let key = target.as_str().to_string();
        Ok(self.copies.get_or_spawn(&rt, key, || {
            let this = self.clone();
            let rt = task_rt;
            async move {
                let unit = progress.register();
                unit.set_name(format!("copy {source} -> {target}"));

                let version = delta.query(source.clone()).await?;
                let witness = this
                    .lock(&target, FILES_TAG)
                    .map_err(SharedError::from)?;

                let unchanged = witness.lock().expect("witness poisoned").source_hash
                    == Some(version)
                    && target.exists();
                if unchanged {
                    unit.set_up_to_date();
                    return Ok(());
                }

                witness.lock().expect("witness poisoned").clear();
                unit.set_running();
                if let Some(parent) = target.parent() {
                    parent.create_dir_all().map_err(SharedError::from)?;
                }
                let (from, to) = (source.clone(), target.clone());
                rt.offload(move || from.copy_to(&to).map_err(SharedError::from))
                    .await??;
                delta.clear(target.clone());
                witness.lock().expect("witness poisoned").source_hash = Some(version);
                unit.set_done();
                Ok(())
            }
        }))
    }

    /// Copy into a directory, keeping the source file name.
    pub fn copy_file_to(
        self: &Arc<Self>,
        source: AbsPath,
        target_dir: &AbsPath,
    ) -> SharedResult<TaskHandle<()>> {
        let target = target_dir.resolve(source.name());
        self.copy_file(source, target)
    }
}

impl Module for FileLocks {
    fn tag(&self) -> &'static str {
        FILES_TAG
    }

    fn activate(&self, ws: &mut Workspace) -> Result<()> {
        ws.add::<Persistence>()?;
        ws.add::<AsyncRuntime>()?;
        ws.add::<FileDeltaChecker>()?;
        ws.add::<Progress>()?;
        Ok(())
    }

    fn start(&self, ws: &Workspace) -> Result<()> {
        let persistence = ws.get::<Persistence>()?;
        self.boot(persistence.take_section(FILES_TAG));
        let _ = self.rt.set(ws.get::<AsyncRuntime>()?.core()?);
        let _ = self.delta.set(ws.get::<FileDeltaChecker>()?);
        let _ = self.progress.set(ws.get::<Progress>()?);
        Ok(())
    }

    fn finish(&self, ws: &Workspace) -> Result<()> {
        let persistence = ws.get::<Persistence>()?;
        persistence.put_section(FILES_TAG, self.shutdown());
        Ok(())
    }
}
