//! Build-step composer for C-family projects.
//!
//! Projects fill build groups with translation units, include directories,
//! and libraries. After every module has registered, a deferred hook
//! composes the per-unit preprocess → compile pipelines and the per-main
//! link steps, consults the witness registry and the delta service for each
//! output, and schedules the resulting subprocess commands on the runtime.
//! Object builds are single-flighted so units shared between executables
//! compile once.

pub mod group;
pub mod steps;
pub mod toolchain;

use crate::delta::FileDeltaChecker;
use crate::errors::SharedResult;
use crate::goals::GoalTracker;
use crate::locks::FileLocks;
use crate::path::{AbsPath, PathSet};
use crate::progress::Progress;
use crate::runtime::{AsyncRuntime, LazyTask, SingleFlight, TaskHandle, gather, gather_lazy};
use crate::workspace::{Module, Workspace};
use anyhow::Result;
use group::{GroupAggregate, GroupData, GroupId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use steps::{StabilityPolicy, StepContext, StepSpec, default_stability, run_step};
use toolchain::{ClangToolchain, CxxOptions, Toolchain};

const CXX_TAG: &str = "cxx";

pub struct CxxModule {
    options: CxxOptions,
    toolchain: Arc<dyn Toolchain>,
    stability: StabilityPolicy,
    groups: Mutex<Vec<GroupData>>,
    aggregates: Mutex<BTreeMap<GroupId, GroupAggregate>>,
    objects: SingleFlight<String, u64>,
}

impl Default for CxxModule {
    fn default() -> Self {
        Self::new(CxxOptions::default())
    }
}

impl CxxModule {
    pub fn new(options: CxxOptions) -> Self {
        Self {
            options,
            toolchain: Arc::new(ClangToolchain),
            stability: default_stability(),
            groups: Mutex::new(Vec::new()),
            aggregates: Mutex::new(BTreeMap::new()),
            objects: SingleFlight::new(),
        }
    }

    pub fn with_toolchain(mut self, toolchain: impl Toolchain) -> Self {
        self.toolchain = Arc::new(toolchain);
        self
    }

    pub fn with_stability(mut self, policy: StabilityPolicy) -> Self {
        self.stability = policy;
        self
    }

    pub fn options(&self) -> &CxxOptions {
        &self.options
    }

    pub fn new_group(&self) -> GroupId {
        let mut groups = self.groups.lock().expect("group table poisoned");
        groups.push(GroupData::default());
        groups.len() - 1
    }

    pub fn add_unit(&self, gid: GroupId, source: AbsPath, is_main: bool) {
        let mut groups = self.groups.lock().expect("group table poisoned");
        groups[gid].units.insert(source, is_main);
    }

    pub fn add_include(&self, gid: GroupId, dir: AbsPath, exported: bool) {
        let mut groups = self.groups.lock().expect("group table poisoned");
        groups[gid].includes.insert(dir, exported);
    }

    /// Register a library; dynamic libraries additionally get a runtime
    /// location next to the executables.
    pub fn add_library(&self, gid: GroupId, library: AbsPath) {
        let destination = if library.has_extension(&["dll", "so"]) {
            Some(self.options.bin_dir.resolve(library.name()))
        } else {
            None
        };
        let mut groups = self.groups.lock().expect("group table poisoned");
        groups[gid].libraries.insert(library, destination);
    }

    pub fn group_use(&self, gid: GroupId, dep: GroupId) {
        let mut groups = self.groups.lock().expect("group table poisoned");
        groups[gid].deps.push(dep);
    }

    #[cfg(test)]
    pub(crate) fn unit_table(&self, gid: GroupId) -> BTreeMap<AbsPath, bool> {
        self.groups.lock().expect("group table poisoned")[gid]
            .units
            .clone()
    }

    fn aggregate_of(&self, gid: GroupId) -> GroupAggregate {
        let groups = self.groups.lock().expect("group table poisoned");
        let mut memo = self.aggregates.lock().expect("aggregate memo poisoned");
        group::aggregate(&groups, gid, &mut memo)
    }

    /// Preprocess and object output locations for a unit, mirroring its
    /// layout below the source root (or flattened for out-of-root units).
    fn unit_paths(&self, source: &AbsPath) -> SharedResult<(AbsPath, AbsPath)> {
        let rel = if source.is_subpath(&self.options.root) {
            source.relative_to(&self.options.root)?
        } else {
            source.relative_to_ancestor(1)?
        };
        let preprocessed = rel
            .rebase(&self.options.src_dir)
            .with_extension(Some("cpp"))
            .into_path();
        let extension = self.toolchain.object_extension(&self.options);
        let object = rel
            .rebase(&self.options.obj_dir)
            .with_extension(Some(&extension))
            .into_path();
        Ok((preprocessed, object))
    }

    fn executable_path(&self, source: &AbsPath) -> AbsPath {
        let stem = source.with_extension(None);
        self.options.bin_dir.resolve(&format!(
            "{}.{}",
            stem.name(),
            self.toolchain.executable_extension()
        ))
    }

    /// The memoized preprocess → compile pipeline for one unit; returns the
    /// object file's version ID.
    fn object_task(
        self: &Arc<Self>,
        ctx: &StepContext,
        source: AbsPath,
        includes: Arc<Vec<AbsPath>>,
    ) -> SharedResult<TaskHandle<u64>> {
        let (preprocessed, object) = self.unit_paths(&source)?;
        let key = object.as_str().to_string();
        let this = self.clone();
        let ctx = ctx.clone();
        let rt = ctx.rt.clone();
        Ok(self.objects.get_or_spawn(&rt, key, move || {
            async move { this.build_object(ctx, source, includes, preprocessed, object).await }
        }))
    }

    async fn build_object(
        self: Arc<Self>,
        ctx: StepContext,
        source: AbsPath,
        includes: Arc<Vec<AbsPath>>,
        preprocessed: AbsPath,
        object: AbsPath,
    ) -> SharedResult<u64> {
        let opts = &self.options;
        let mut flag_witness = self.toolchain.base_args(opts);
        flag_witness.sort();

        // Inputs: the unit itself, then the include trees as set hashes so
        // any file added, removed, or modified inside them participates.
        // Lazy children keep an interrupted run from launching the rest.
        let mut inputs: Vec<LazyTask<u64>> = Vec::new();
        {
            let delta = ctx.delta.clone();
            let source = source.clone();
            inputs.push(LazyTask::new(move || async move {
                delta.query(source).await
            }));
        }
        for dir in includes.iter() {
            let delta = ctx.delta.clone();
            let set = PathSet::under(dir);
            inputs.push(LazyTask::new(move || async move { delta.query(set).await }));
        }
        let versions = gather_lazy(&ctx.rt, &inputs).await?;
        let mut source_witness: Vec<Option<u64>> = vec![Some(versions[0]), None];
        source_witness.extend(versions[1..].iter().map(|v| Some(*v)));

        let (compile_source, compile_deps, compile_includes) = if opts.preprocess {
            let spec = StepSpec {
                name: format!("preprocess {}", source.name()),
                output: preprocessed.clone(),
                command: self.toolchain.preprocess_command(
                    opts,
                    &source,
                    &includes,
                    &preprocessed,
                ),
                flag_witness: flag_witness.clone(),
                dependency_witness: source_witness,
                debug: None,
                optimize: None,
                derive_includes: Some(includes.as_ref().clone()),
            };
            let version = run_step(&ctx, spec).await?;
            (preprocessed, vec![Some(version)], Vec::new())
        } else {
            (source.clone(), source_witness, includes.as_ref().clone())
        };

        let spec = StepSpec {
            name: format!("compile {}", source.name()),
            output: object.clone(),
            command: self.toolchain.compile_command(
                opts,
                &compile_source,
                &compile_includes,
                &object,
            ),
            flag_witness,
            dependency_witness: compile_deps,
            debug: Some(opts.debug),
            optimize: Some(opts.optimize),
            derive_includes: None,
        };
        run_step(&ctx, spec).await
    }

    /// Compose and schedule every step required by the activated goals.
    fn compose(self: &Arc<Self>, ws: &Workspace) -> Result<()> {
        let ctx = StepContext {
            rt: ws.get::<AsyncRuntime>()?.core()?,
            delta: ws.get::<FileDeltaChecker>()?,
            locks: ws.get::<FileLocks>()?,
            progress: ws.get::<Progress>()?,
            stability: self.stability.clone(),
            owner: CXX_TAG,
        };
        let goals = ws.get::<GoalTracker>()?;

        let group_count = self.groups.lock().expect("group table poisoned").len();
        for gid in 0..group_count {
            let aggregate = self.aggregate_of(gid);
            let includes = Arc::new(aggregate.includes.clone());
            let mains: Vec<AbsPath> = {
                let groups = self.groups.lock().expect("group table poisoned");
                groups[gid]
                    .units
                    .iter()
                    .filter(|(_, is_main)| **is_main)
                    .map(|(path, _)| path.clone())
                    .collect()
            };

            let mut copies_needed: BTreeMap<AbsPath, AbsPath> = BTreeMap::new();

            for main in mains {
                let exe = self.executable_path(&main);
                let goal = exe.name().to_string();
                if !goals.define_then_query(&goal)? {
                    let unit = ctx.progress.register();
                    unit.set_name(format!("link {}", exe.name()));
                    unit.set_skipped();
                    continue;
                }
                tracing::debug!(goal = %goal, "goal activated");

                for (library, destination) in &aggregate.libraries {
                    if let Some(destination) = destination {
                        copies_needed.insert(library.clone(), destination.clone());
                    }
                }
                self.schedule_link(&ctx, &main, &exe, &aggregate, includes.clone())?;
            }

            for (library, destination) in copies_needed {
                let _ = ctx.locks.copy_file(library, destination)?;
            }
        }
        Ok(())
    }

    /// Spawn the link pipeline for one main unit: await its object, every
    /// auxiliary object, and the library versions, then run the link step.
    fn schedule_link(
        self: &Arc<Self>,
        ctx: &StepContext,
        main: &AbsPath,
        exe: &AbsPath,
        aggregate: &GroupAggregate,
        includes: Arc<Vec<AbsPath>>,
    ) -> SharedResult<()> {
        let main_task = self.object_task(ctx, main.clone(), includes.clone())?;
        let mut aux_tasks: Vec<(AbsPath, TaskHandle<u64>)> = Vec::new();
        for source in &aggregate.objects {
            let task = self.object_task(ctx, source.clone(), includes.clone())?;
            let (_, object) = self.unit_paths(source)?;
            aux_tasks.push((object, task));
        }
        let (_, main_object) = self.unit_paths(main)?;
        let libraries: Vec<AbsPath> = aggregate.libraries.keys().cloned().collect();

        let this = self.clone();
        let ctx = ctx.clone();
        let rt = ctx.rt.clone();
        let exe = exe.clone();
        let main_name = main.name().to_string();
        let _handle = rt.spawn(async move {
            let main_version = main_task.await?;
            let (aux_objects, object_tasks): (Vec<AbsPath>, Vec<TaskHandle<u64>>) =
                aux_tasks.into_iter().unzip();
            let mut aux_versions = gather(object_tasks).await?;
            aux_versions.sort_unstable();

            let library_queries: Vec<LazyTask<u64>> = libraries
                .iter()
                .map(|library| {
                    let delta = ctx.delta.clone();
                    let library = library.clone();
                    LazyTask::new(move || async move { delta.query(library).await })
                })
                .collect();
            let mut library_versions = gather_lazy(&ctx.rt, &library_queries).await?;
            library_versions.sort_unstable();

            let mut dependency_witness: Vec<Option<u64>> = vec![Some(main_version)];
            dependency_witness.extend(aux_versions.into_iter().map(Some));
            dependency_witness.push(None);
            dependency_witness.extend(library_versions.into_iter().map(Some));

            let opts = &this.options;
            let mut flag_witness = this.toolchain.base_args(opts);
            flag_witness.sort();

            let spec = StepSpec {
                name: format!("link {}", exe.name()),
                output: exe.clone(),
                command: this.toolchain.link_command(
                    opts,
                    &main_object,
                    &aux_objects,
                    &libraries,
                    &exe,
                ),
                flag_witness,
                dependency_witness,
                debug: Some(opts.debug),
                optimize: Some(opts.optimize),
                derive_includes: None,
            };
            run_step(&ctx, spec).await?;
            tracing::debug!(main = %main_name, exe = %exe, "link settled");
            Ok(())
        });
        Ok(())
    }
}

impl Module for CxxModule {
    fn tag(&self) -> &'static str {
        CXX_TAG
    }

    fn activate(&self, ws: &mut Workspace) -> Result<()> {
        ws.add::<FileDeltaChecker>()?;
        ws.add::<FileLocks>()?;
        ws.add::<GoalTracker>()?;
        ws.add::<Progress>()?;
        Ok(())
    }

    fn start(&self, ws: &Workspace) -> Result<()> {
        // Projects register their groups during their own start hooks; the
        // deferred hook runs after all of them.
        ws.defer(|ws| {
            let cxx = ws.get::<CxxModule>()?;
            cxx.compose(ws)
        });
        Ok(())
    }
}
