//! The rebuild decision.
//!
//! Every incremental step follows one contract, independent of the
//! toolchain: gather input versions concurrently, compute sorted flag and
//! dependency witnesses, lock the output, compare against the stored
//! witness, and rebuild only when a witness changed, a derived dependency
//! was invalidated, the previous build was unstable, or the output is
//! missing. Skips are conservative: a step is only skipped when every
//! recorded justification still holds.

use crate::delta::FileDeltaChecker;
use crate::errors::{SharedError, SharedResult};
use crate::locks::FileLocks;
use crate::path::AbsPath;
use crate::progress::Progress;
use crate::runtime::{CommandOutput, CommandSpec, TaskRuntime, gather, gather_and};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

/// Decides whether a finished subprocess counts as stable. The default
/// treats any stdout or stderr as instability, forcing a re-run next time
/// so diagnostics resurface.
pub type StabilityPolicy = Arc<dyn Fn(&CommandOutput) -> bool + Send + Sync>;

pub fn default_stability() -> StabilityPolicy {
    Arc::new(CommandOutput::is_silent)
}

/// Everything a step needs to consult the witness and run.
#[derive(Clone)]
pub struct StepContext {
    pub rt: Arc<TaskRuntime>,
    pub delta: Arc<FileDeltaChecker>,
    pub locks: Arc<FileLocks>,
    pub progress: Arc<Progress>,
    pub stability: StabilityPolicy,
    pub owner: &'static str,
}

/// One step producing one output from declared inputs and flags.
pub struct StepSpec {
    pub name: String,
    pub output: AbsPath,
    pub command: CommandSpec,
    /// Sorted invariant flags.
    pub flag_witness: Vec<String>,
    /// Version IDs of contributing inputs, with `None` class separators.
    pub dependency_witness: Vec<Option<u64>>,
    pub debug: Option<bool>,
    pub optimize: Option<bool>,
    /// When set, the step derives an include closure from its output: line
    /// markers are parsed, intersected with these directories, and each
    /// surviving header's version is recorded and later re-validated.
    pub derive_includes: Option<Vec<AbsPath>>,
}

/// Run (or skip) the step and return the output's version ID.
pub async fn run_step(ctx: &StepContext, spec: StepSpec) -> SharedResult<u64> {
    let unit = ctx.progress.register();
    unit.set_name(spec.name.clone());

    let witness = ctx
        .locks
        .lock(&spec.output, ctx.owner)
        .map_err(SharedError::from)?;

    let mut fresh = {
        let w = witness.lock().expect("witness poisoned");
        w.args.as_ref() == Some(&spec.flag_witness)
            && w.dependency_hash.as_ref() == Some(&spec.dependency_witness)
            && w.debug == spec.debug
            && w.optimize == spec.optimize
            && w.stable == Some(true)
            && spec.output.exists()
    };
    if fresh && spec.derive_includes.is_some() {
        let recorded = witness.lock().expect("witness poisoned").include_hash.clone();
        fresh = match recorded {
            Some(ids) => {
                let checks: Vec<_> = ids
                    .iter()
                    .map(|id| {
                        let delta = ctx.delta.clone();
                        let id = *id;
                        async move { delta.test(id).await }
                    })
                    .collect();
                gather_and(checks).await?
            }
            None => false,
        };
    }

    if fresh {
        tracing::debug!(output = %spec.output, "witness holds, skipping");
        unit.set_up_to_date();
        return ctx.delta.query(spec.output.clone()).await;
    }

    tracing::debug!(output = %spec.output, "witness changed, rebuilding");
    witness.lock().expect("witness poisoned").clear();
    if let Some(parent) = spec.output.parent() {
        parent.create_dir_all().map_err(SharedError::from)?;
    }

    // Let sibling steps dispatch before the synchronous spawn burst.
    ctx.rt.red_light().await;
    unit.set_running();

    let output = match ctx.rt.run_command(&spec.command).await {
        Ok(output) => output,
        Err(err) => {
            if err.is_interrupt() {
                unit.set_stopped();
            } else {
                unit.set_failed();
            }
            return Err(err);
        }
    };
    if !output.stderr.is_empty() {
        ctx.progress.println(output.stderr_text().trim_end());
    }

    let stable = (ctx.stability)(&output);
    let include_hash = match &spec.derive_includes {
        Some(dirs) => Some(derive_include_closure(ctx, &spec.output, dirs).await?),
        None => None,
    };

    // The output was rewritten; drop the cached refresh so downstream
    // queries observe the new content.
    ctx.delta.clear(spec.output.clone());

    {
        let mut w = witness.lock().expect("witness poisoned");
        w.args = Some(spec.flag_witness);
        w.dependency_hash = Some(spec.dependency_witness);
        w.stable = Some(stable);
        w.debug = spec.debug;
        w.optimize = spec.optimize;
        w.include_hash = include_hash;
    }
    unit.set_done();
    ctx.delta.query(spec.output.clone()).await
}

/// Parse the line markers a preprocessor leaves in its output, keep the
/// headers that live under one of the declared include directories, and
/// record a version per header.
async fn derive_include_closure(
    ctx: &StepContext,
    output: &AbsPath,
    include_dirs: &[AbsPath],
) -> SharedResult<Vec<u64>> {
    let target = output.clone();
    let text = ctx
        .rt
        .offload(move || {
            std::fs::read_to_string(target.std_path()).map_err(|source| {
                SharedError::from(crate::errors::BuildError::Io {
                    path: target.as_str().to_string(),
                    source,
                })
            })
        })
        .await??;

    let headers: Vec<AbsPath> = parse_line_markers(&text)
        .into_iter()
        .filter(|header| include_dirs.iter().any(|dir| header.is_subpath(dir)))
        .collect();

    let queries: Vec<_> = headers
        .iter()
        .map(|header| {
            let delta = ctx.delta.clone();
            let header = header.clone();
            async move { delta.query(header).await }
        })
        .collect();
    let mut ids = gather(queries).await?;
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// File names recorded in `# <line> "<file>"` markers, normalized and
/// deduplicated. Pseudo files such as `<built-in>` are ignored.
pub fn parse_line_markers(text: &str) -> BTreeSet<AbsPath> {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    let marker = MARKER
        .get_or_init(|| Regex::new(r#"(?m)^#\s+\d+\s+"([^"<>]+)""#).expect("static marker regex"));
    marker
        .captures_iter(text)
        .map(|cap| AbsPath::new(&cap[1]))
        .collect()
}
