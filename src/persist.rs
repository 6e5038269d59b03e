//! Persistent build state.
//!
//! All long-lived state lives in one JSON journal, a mapping from stable
//! module tags to free-form records. The journal is loaded when the module
//! starts and rewritten when it finishes; a journal older than 30 days (or
//! one that cannot be parsed) is discarded wholesale, which caps both
//! corruption blast radius and the growth of stale entries.
//!
//! Modules take their section by value at start and deposit it back at
//! finish, so no shared mutable root crosses suspension points.

use crate::errors::BuildError;
use crate::path::AbsPath;
use crate::runtime::AsyncRuntime;
use crate::workspace::{Module, Workspace};
use anyhow::{Context as _, Result};
use serde_json::{Map, Value};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const SELF_TAG: &str = "persistence";
const MAX_AGE_SECS: f64 = 60.0 * 60.0 * 24.0 * 30.0;

pub type Section = Map<String, Value>;

#[derive(Default)]
pub struct Persistence {
    file: Mutex<Option<AbsPath>>,
    root: Mutex<Option<Section>>,
}

impl Persistence {
    /// Set the journal location. May be called exactly once, before the
    /// execution phase.
    pub fn set_file(&self, path: AbsPath) -> Result<(), BuildError> {
        let mut slot = self.file.lock().expect("persistence file poisoned");
        if slot.is_some() {
            return Err(BuildError::Invariant(
                "persistence file may not be set more than once".into(),
            ));
        }
        *slot = Some(path);
        Ok(())
    }

    /// Remove and return the record stored under `tag`, or an empty record.
    pub fn take_section(&self, tag: &str) -> Section {
        let mut root = self.root.lock().expect("persistence root poisoned");
        let store = root.as_mut().expect("persistence store not loaded");
        match store.remove(tag) {
            Some(Value::Object(map)) => map,
            _ => Section::new(),
        }
    }

    /// Deposit the record for `tag`; empty leaves are pruned on save.
    pub fn put_section(&self, tag: &str, section: Section) {
        let mut root = self.root.lock().expect("persistence root poisoned");
        if let Some(store) = root.as_mut() {
            store.insert(tag.to_string(), Value::Object(section));
        }
    }

    fn now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    fn load(&self) -> Result<()> {
        let file = self
            .file
            .lock()
            .expect("persistence file poisoned")
            .clone()
            .ok_or_else(|| BuildError::Invariant("persistence file was never set".into()))?;

        let now = Self::now();
        let loaded: Option<Section> = std::fs::read_to_string(file.std_path())
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(&text).ok())
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            });

        let fresh = loaded.as_ref().is_some_and(|map| {
            map.get(SELF_TAG)
                .and_then(|meta| meta.get("created"))
                .and_then(Value::as_f64)
                .is_some_and(|created| now - created < MAX_AGE_SECS)
        });

        let root = if fresh {
            loaded.unwrap_or_default()
        } else {
            if loaded.is_some() {
                tracing::warn!(file = %file, "discarding stale or malformed journal");
            }
            let mut meta = Section::new();
            meta.insert("created".into(), Value::from(now));
            let mut root = Section::new();
            root.insert(SELF_TAG.into(), Value::Object(meta));
            root
        };

        tracing::debug!(file = %file, entries = root.len(), "journal loaded");
        *self.root.lock().expect("persistence root poisoned") = Some(root);
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let file = self
            .file
            .lock()
            .expect("persistence file poisoned")
            .clone()
            .ok_or_else(|| BuildError::Invariant("persistence file was never set".into()))?;
        let root = self
            .root
            .lock()
            .expect("persistence root poisoned")
            .take()
            .ok_or_else(|| BuildError::Invariant("persistence store was never loaded".into()))?;

        let mut value = Value::Object(root);
        prune_empty(&mut value);

        let text = serde_json::to_string(&value).context("failed to serialize journal")?;
        if let Some(parent) = file.parent() {
            parent.create_dir_all()?;
        }
        std::fs::write(file.std_path(), text.as_bytes())
            .with_context(|| format!("failed to write journal {file}"))?;
        tracing::debug!(file = %file, "journal saved");
        Ok(())
    }
}

/// Drop object entries that are empty objects once their own children have
/// been pruned.
fn prune_empty(value: &mut Value) {
    if let Value::Object(map) = value {
        let keys: Vec<String> = map.keys().cloned().collect();
        for key in keys {
            if let Some(child) = map.get_mut(&key) {
                prune_empty(child);
                if matches!(child, Value::Object(m) if m.is_empty()) {
                    map.remove(&key);
                }
            }
        }
    }
}

impl Module for Persistence {
    fn tag(&self) -> &'static str {
        SELF_TAG
    }

    fn activate(&self, ws: &mut Workspace) -> Result<()> {
        // The journal must be saved after the runtime has drained, which
        // means persistence has to precede the runtime in the topology.
        if ws.contains::<AsyncRuntime>() {
            anyhow::bail!(
                "when depending on both persistence and the async runtime, \
                 register persistence first"
            );
        }
        Ok(())
    }

    fn start(&self, _ws: &Workspace) -> Result<()> {
        self.load()
    }

    fn finish(&self, _ws: &Workspace) -> Result<()> {
        self.save()
    }
}
