//! Asynchronous task runtime.
//!
//! Build-graph orchestration is cooperative and single-threaded: the
//! `AsyncRuntime` module owns a current-thread tokio runtime, and tasks only
//! make progress while the workspace drains. CPU-bound or blocking calls
//! (hashing, copying) are offloaded to the bounded blocking pool, and
//! subprocesses run with OS-level parallelism bounded by a semaphore.
//!
//! Every spawned task is tracked and composed with the process-wide
//! interrupt, so teardown can always settle every attached task. Spawning
//! schedules a drain hook on the workspace queue; the hook re-schedules
//! itself through this path whenever later hooks spawn more work, which is
//! what guarantees that all tasks are done before any module finishes.

mod flight;
mod gather;
mod interrupt;
mod process;

pub use flight::{LazyTask, SingleFlight};
pub use gather::{gather, gather_and, gather_lazy, gather_or, with_interrupt};
pub use interrupt::Interrupt;
pub use process::{CommandOutput, CommandSpec};

use crate::errors::{BuildError, SharedError, SharedResult};
use crate::workspace::{HookQueue, Module, Workspace};
use anyhow::{Context as _, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use tokio::sync::{Notify, Semaphore};

/// A three-state future handle: pending, completed with a value, or
/// completed with a shared error. Cloning produces another awaiter; a
/// failed task re-raises the same error to every awaiter.
pub struct TaskHandle<T: Clone> {
    fut: Shared<BoxFuture<'static, SharedResult<T>>>,
}

impl<T: Clone> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            fut: self.fut.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TaskHandle<T> {
    fn from_join(join: tokio::task::JoinHandle<SharedResult<T>>) -> Self {
        let fut = async move {
            match join.await {
                Ok(result) => result,
                Err(err) => Err(SharedError::from(BuildError::TaskAborted(err.to_string()))),
            }
        }
        .boxed()
        .shared();
        Self { fut }
    }

    /// An already-completed handle.
    pub fn ready(result: SharedResult<T>) -> Self {
        Self {
            fut: async move { result }.boxed().shared(),
        }
    }

    /// The result, if already complete. Lets callers surface failures that
    /// settled synchronously without awaiting; the fail-fast gather uses
    /// this to gate launching further children.
    pub fn peek(&self) -> Option<&SharedResult<T>> {
        self.fut.peek()
    }
}

impl<T: Clone + Send + Sync + 'static> Future for TaskHandle<T> {
    type Output = SharedResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.fut).poll(cx)
    }
}

/// Decrements the active-task counter when a task settles.
struct ActiveGuard {
    rt: Arc<TaskRuntime>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.rt.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.rt.idle.notify_waiters();
        }
    }
}

/// The runtime core: tracked spawns, interrupt composition, blocking
/// offload, subprocess bounding, and drain support. Separated from the
/// workspace module so tests can drive it on any tokio runtime.
pub struct TaskRuntime {
    handle: tokio::runtime::Handle,
    interrupt: Interrupt,
    active: AtomicUsize,
    idle: Notify,
    procs: Semaphore,
    shutdown: AtomicBool,
    first_error: Mutex<Option<SharedError>>,
    spawn_observer: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl TaskRuntime {
    pub fn new(handle: tokio::runtime::Handle, jobs: usize) -> Self {
        Self {
            handle,
            interrupt: Interrupt::new(),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
            procs: Semaphore::new(jobs.max(1)),
            shutdown: AtomicBool::new(false),
            first_error: Mutex::new(None),
            spawn_observer: Mutex::new(None),
        }
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Spawn a tracked task composed with the interrupt. The handle may be
    /// cloned; all awaiters observe one result.
    pub fn spawn<T, F>(self: &Arc<Self>, fut: F) -> TaskHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = SharedResult<T>> + Send + 'static,
    {
        if self.shutdown.load(Ordering::Acquire) {
            return TaskHandle::ready(Err(SharedError::from(BuildError::Shutdown)));
        }
        if let Some(observer) = self.spawn_observer.lock().expect("observer poisoned").as_ref() {
            observer();
        }

        self.active.fetch_add(1, Ordering::AcqRel);
        let guard = ActiveGuard { rt: self.clone() };
        let interrupt = self.interrupt.clone();
        let this = self.clone();

        let wrapped = async move {
            let _guard = guard;
            let result = tokio::select! {
                res = fut => res,
                err = interrupt.triggered() => Err(err),
            };
            if let Err(err) = &result
                && !err.is_interrupt()
            {
                this.note_error(err.clone());
            }
            result
        };
        TaskHandle::from_join(self.handle.spawn(wrapped))
    }

    /// Execute a blocking callable on the thread pool. The awaiter is
    /// released on interrupt even though an already-running closure cannot
    /// be cancelled.
    pub async fn offload<T, F>(&self, f: F) -> SharedResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.interrupt.check()?;
        let join = self.handle.spawn_blocking(f);
        tokio::select! {
            res = join => {
                res.map_err(|err| SharedError::from(BuildError::TaskAborted(err.to_string())))
            }
            err = self.interrupt.triggered() => Err(err),
        }
    }

    /// Cooperative yield: return control to the scheduler so that sibling
    /// tasks registered before this point get a chance to run, typically
    /// ahead of a synchronous burst such as spawning a subprocess.
    pub async fn red_light(&self) {
        tokio::task::yield_now().await;
    }

    /// Block until no tracked task remains active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Refuse further work and fulfil the interrupt.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.procs.close();
        self.interrupt.trigger();
    }

    fn note_error(&self, err: SharedError) {
        let mut slot = self.first_error.lock().expect("error slot poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// The first non-interrupt task failure observed, if any.
    pub fn take_error(&self) -> Option<SharedError> {
        self.first_error.lock().expect("error slot poisoned").take()
    }

    fn set_spawn_observer(&self, observer: impl Fn() + Send + Sync + 'static) {
        *self.spawn_observer.lock().expect("observer poisoned") = Some(Box::new(observer));
    }
}

/// Workspace module owning the tokio runtime and the drain discipline.
pub struct AsyncRuntime {
    jobs: usize,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    core: OnceLock<Arc<TaskRuntime>>,
    drain_queued: Arc<AtomicBool>,
}

impl Default for AsyncRuntime {
    fn default() -> Self {
        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_jobs(jobs)
    }
}

impl AsyncRuntime {
    pub fn with_jobs(jobs: usize) -> Self {
        Self {
            jobs: jobs.max(1),
            runtime: Mutex::new(None),
            core: OnceLock::new(),
            drain_queued: Arc::new(AtomicBool::new(false)),
        }
    }

    /// One subprocess at a time.
    pub fn sequential() -> Self {
        Self::with_jobs(1)
    }

    /// The runtime core. Only available in the execution phase.
    pub fn core(&self) -> Result<Arc<TaskRuntime>, BuildError> {
        self.core
            .get()
            .cloned()
            .ok_or_else(|| BuildError::Invariant("async runtime has not started".into()))
    }

    /// Run the scheduler until every tracked task has settled, then surface
    /// the first failure or the interrupt. Re-queued by the spawn observer
    /// whenever later hooks add more work.
    fn drain_now(&self) -> Result<()> {
        let core = self.core()?;
        {
            let guard = self.runtime.lock().expect("runtime slot poisoned");
            let runtime = guard
                .as_ref()
                .ok_or_else(|| BuildError::Invariant("async runtime already shut down".into()))?;
            runtime.block_on(core.wait_idle());
        }
        self.drain_queued.store(false, Ordering::Release);

        if let Some(err) = core.take_error() {
            return Err(err.into());
        }
        if core.interrupt().is_triggered() {
            return Err(BuildError::Interrupted.into());
        }
        Ok(())
    }
}

impl Module for AsyncRuntime {
    fn tag(&self) -> &'static str {
        "runtime"
    }

    fn start(&self, ws: &Workspace) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;
        let core = Arc::new(TaskRuntime::new(runtime.handle().clone(), self.jobs));

        // SIGINT marks the interrupt; tasks observe it at their next
        // suspension point. Daemon task, not tracked by the drain.
        let interrupt = core.interrupt().clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.trigger();
            }
        });

        *self.runtime.lock().expect("runtime slot poisoned") = Some(runtime);
        let _ = self.core.set(core.clone());

        let hooks: Arc<HookQueue> = ws.hook_queue();
        let queued = self.drain_queued.clone();
        core.set_spawn_observer(move || {
            if !queued.swap(true, Ordering::AcqRel) {
                hooks.push(Box::new(|ws: &Workspace| {
                    ws.get::<AsyncRuntime>()?.drain_now()
                }));
            }
        });
        Ok(())
    }

    fn finish(&self, _ws: &Workspace) -> Result<()> {
        // Teardown fulfils the interrupt, then settles every attached task
        // before the runtime goes away. On the normal path everything has
        // already drained and this is a no-op.
        if let Some(core) = self.core.get() {
            core.request_shutdown();
            let guard = self.runtime.lock().expect("runtime slot poisoned");
            if let Some(runtime) = guard.as_ref() {
                runtime.block_on(core.wait_idle());
            }
        }
        let runtime = self.runtime.lock().expect("runtime slot poisoned").take();
        drop(runtime);
        Ok(())
    }
}
