//! Declarative project manifests.
//!
//! A project is described by a `project.toml` next to its sources:
//!
//! ```toml
//! name = "app"
//! dependencies = ["../lib"]
//!
//! [[sources]]
//! path = "src"
//! private = false
//! mains = ["main.cpp"]
//!
//! [[libraries]]
//! path = "vendor/z.dll"
//! ```
//!
//! Each manifest becomes one workspace module instance. Activation loads
//! and activates dependency projects recursively, so dependencies precede
//! dependents in the topology; the start hook fills a build group and wires
//! the `use` edges.

use crate::cxx::CxxModule;
use crate::cxx::group::GroupId;
use crate::errors::BuildError;
use crate::path::{AbsPath, PathSet};
use crate::workspace::{Module, Workspace};
use anyhow::{Context as _, Result};
use serde::Deserialize;
use std::sync::{Mutex, OnceLock};

pub const MANIFEST_NAME: &str = "project.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectManifest {
    #[serde(default)]
    pub name: Option<String>,
    /// Paths to dependency project directories or manifest files, relative
    /// to this manifest's directory.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub libraries: Vec<LibraryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceEntry {
    pub path: String,
    /// Private include directories are not exported to dependents.
    #[serde(default)]
    pub private: bool,
    /// Glob patterns (relative to the entry) selecting main units. Absent
    /// means every unit is a main.
    #[serde(default)]
    pub mains: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LibraryEntry {
    pub path: String,
}

#[derive(Debug)]
pub struct BuildProject {
    manifest_path: AbsPath,
    root: AbsPath,
    manifest: ProjectManifest,
    deps: Mutex<Vec<std::sync::Arc<BuildProject>>>,
    group: OnceLock<GroupId>,
}

impl BuildProject {
    /// Load a project from a manifest file or a directory containing one.
    pub fn load(path: &AbsPath) -> Result<Self> {
        let manifest_path = if path.is_dir() {
            path.resolve(MANIFEST_NAME)
        } else {
            path.clone()
        };
        let text = std::fs::read_to_string(manifest_path.std_path())
            .with_context(|| format!("failed to read project manifest {manifest_path}"))?;
        let manifest: ProjectManifest = toml::from_str(&text)
            .with_context(|| format!("failed to parse project manifest {manifest_path}"))?;
        let root = manifest_path
            .parent()
            .ok_or_else(|| BuildError::Invariant(format!("{manifest_path} has no parent")))?;
        Ok(Self {
            manifest_path,
            root,
            manifest,
            deps: Mutex::new(Vec::new()),
            group: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        self.manifest
            .name
            .as_deref()
            .unwrap_or_else(|| self.root.name())
    }

    pub fn group(&self) -> Result<GroupId, BuildError> {
        self.group.get().copied().ok_or_else(|| {
            BuildError::Invariant(format!("project {} has not started", self.name()))
        })
    }

    fn fill_group(&self, cxx: &CxxModule, gid: GroupId) -> Result<()> {
        for entry in &self.manifest.sources {
            let path = self.root.resolve(&entry.path);
            let main_sets: Option<Vec<PathSet>> = entry.mains.as_ref().map(|patterns| {
                patterns
                    .iter()
                    .map(|pattern| PathSet::new(&format!("{path}/**/{pattern}")))
                    .collect()
            });
            let is_main = |unit: &AbsPath| match &main_sets {
                None => true,
                Some(sets) => sets.iter().any(|set| set.contains(unit)),
            };

            if path.is_dir() {
                cxx.add_include(gid, path.clone(), !entry.private);
                for leaf in path.preorder() {
                    if leaf.has_extension(&["cpp", "cc", "cxx"]) && leaf.is_file() {
                        cxx.add_unit(gid, leaf.clone(), is_main(&leaf));
                    }
                }
            } else if path.has_extension(&["cpp", "cc", "cxx"]) {
                cxx.add_unit(gid, path.clone(), is_main(&path));
            } else {
                anyhow::bail!("source entry {path} of project {} is neither a directory nor a translation unit", self.name());
            }
        }
        for entry in &self.manifest.libraries {
            cxx.add_library(gid, self.root.resolve(&entry.path));
        }
        Ok(())
    }
}

impl Module for BuildProject {
    fn tag(&self) -> &'static str {
        "project"
    }

    fn discriminant(&self) -> Option<String> {
        Some(self.manifest_path.as_str().to_string())
    }

    fn activate(&self, ws: &mut Workspace) -> Result<()> {
        ws.add::<CxxModule>()?;
        for dep in &self.manifest.dependencies {
            let dep_path = self.root.resolve(dep);
            let project = BuildProject::load(&dep_path)
                .with_context(|| format!("loading dependency of {}", self.name()))?;
            let project = ws.add_instance(project)?;
            self.deps.lock().expect("project deps poisoned").push(project);
        }
        Ok(())
    }

    fn start(&self, ws: &Workspace) -> Result<()> {
        let cxx = ws.get::<CxxModule>()?;
        let gid = cxx.new_group();
        let _ = self.group.set(gid);
        self.fill_group(&cxx, gid)?;
        for dep in self.deps.lock().expect("project deps poisoned").iter() {
            cxx.group_use(gid, dep.group()?);
        }
        tracing::debug!(project = self.name(), group = gid, "project registered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_manifest(dir: &std::path::Path, text: &str) {
        fs::write(dir.join(MANIFEST_NAME), text).unwrap();
    }

    #[test]
    fn manifest_parses_all_sections() {
        let manifest: ProjectManifest = toml::from_str(
            r#"
            name = "app"
            dependencies = ["../lib"]

            [[sources]]
            path = "src"
            mains = ["main.cpp"]

            [[sources]]
            path = "detail"
            private = true

            [[libraries]]
            path = "vendor/z.dll"
            "#,
        )
        .unwrap();
        assert_eq!(manifest.name.as_deref(), Some("app"));
        assert_eq!(manifest.dependencies, vec!["../lib"]);
        assert_eq!(manifest.sources.len(), 2);
        assert!(manifest.sources[1].private);
        assert_eq!(manifest.libraries.len(), 1);
    }

    #[test]
    fn unknown_manifest_keys_are_rejected() {
        let result: Result<ProjectManifest, _> = toml::from_str("unexpected = true");
        assert!(result.is_err());
    }

    #[test]
    fn load_accepts_a_directory_or_a_file() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "name = \"demo\"\n");

        let by_dir = BuildProject::load(&AbsPath::new(dir.path())).unwrap();
        assert_eq!(by_dir.name(), "demo");

        let by_file = BuildProject::load(&AbsPath::new(dir.path().join(MANIFEST_NAME))).unwrap();
        assert_eq!(by_file.name(), "demo");
    }

    #[test]
    fn missing_manifest_is_a_readable_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BuildProject::load(&AbsPath::new(dir.path())).unwrap_err();
        assert!(err.to_string().contains("project manifest"));
    }

    #[test]
    fn projects_fill_their_group_from_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/core")).unwrap();
        fs::write(dir.path().join("src/main.cpp"), "int main() {}\n").unwrap();
        fs::write(dir.path().join("src/core/util.cpp"), "int util;\n").unwrap();
        fs::write(dir.path().join("src/core/util.hpp"), "#pragma once\n").unwrap();
        write_manifest(
            dir.path(),
            r#"
            name = "demo"

            [[sources]]
            path = "src"
            mains = ["main.cpp"]
            "#,
        );

        let project = BuildProject::load(&AbsPath::new(dir.path())).unwrap();
        let cxx = CxxModule::default();
        let gid = cxx.new_group();
        project.fill_group(&cxx, gid).unwrap();

        // Headers are never units; util.cpp is auxiliary, main.cpp main.
        let units = cxx.unit_table(gid);
        assert_eq!(units.len(), 2);
        let mains: Vec<_> = units
            .iter()
            .filter(|(_, is_main)| **is_main)
            .map(|(path, _)| path.name().to_string())
            .collect();
        assert_eq!(mains, vec!["main.cpp"]);
    }
}
