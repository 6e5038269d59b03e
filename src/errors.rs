//! Typed error hierarchy for the Anvil orchestrator.
//!
//! Two layers cover the whole crate:
//! - `BuildError` — every failure a build run can produce, from invariant
//!   violations (double lock, recursive activation) to fatal subprocess
//!   failures and the interrupt marker.
//! - `SharedError` — a clone-able `Arc` wrapper so that a failed task
//!   re-raises the same error to every awaiter.

use std::sync::Arc;
use thiserror::Error;

/// Errors produced by the scheduler, runtime, and build steps.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The process-wide interrupt fired (SIGINT or runtime teardown).
    #[error("Interrupted")]
    Interrupted,

    /// The runtime was already shut down when work was submitted.
    #[error("runtime is shut down")]
    Shutdown,

    /// A task panicked or was torn out from under its awaiters.
    #[error("task aborted: {0}")]
    TaskAborted(String),

    #[error("failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Fatal build failure: the command exited non-zero.
    #[error("command failed with exit code {code}\n  command: {command}\n  stderr: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Version queries require the path to exist.
    #[error("cannot assign a version to absent path {0}")]
    AbsentPath(String),

    /// At most one owner may lock any output path per run.
    #[error("output {path} is already locked by {owner}")]
    LockConflict { path: String, owner: String },

    #[error("duplicate definition for goal {0}")]
    DuplicateGoal(String),

    #[error("undefined goal {0}")]
    UndefinedGoal(String),

    /// A module was requested that was never added to the workspace.
    #[error("module {0} is not active in this workspace")]
    ModuleMissing(&'static str),

    /// A bare type lookup matched several discriminated instances.
    #[error("module {0} has multiple instances; fetch one by discriminant")]
    AmbiguousModule(&'static str),

    /// `add` re-entered for a key whose construction is still in progress.
    #[error("recursive activation of module {0}")]
    RecursiveActivation(String),

    #[error("modules may not be added in the execution phase")]
    DiscoveryClosed,

    #[error("{0}")]
    Invariant(String),
}

impl BuildError {
    /// True for errors caused by events out of scope of the failing task:
    /// user abort and runtime teardown. The progress reporter shows these
    /// as `stopped` rather than `failed`.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted | Self::Shutdown)
    }
}

/// Clone-able error handle shared between all awaiters of a task.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SharedError(pub Arc<BuildError>);

impl SharedError {
    pub fn kind(&self) -> &BuildError {
        &self.0
    }

    pub fn is_interrupt(&self) -> bool {
        self.0.is_interrupt()
    }

    pub fn interrupted() -> Self {
        Self::from(BuildError::Interrupted)
    }
}

impl From<BuildError> for SharedError {
    fn from(err: BuildError) -> Self {
        Self(Arc::new(err))
    }
}

/// Result type flowing through the task runtime.
pub type SharedResult<T> = Result<T, SharedError>;
