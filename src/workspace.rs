//! Two-phase module scheduler.
//!
//! A workspace is a flow controller between a set of dependent modules. In
//! the discovery phase, `add` activates modules and topologically orders
//! them so every module precedes its dependents: a module's `activate` hook
//! registers its own dependencies, which are therefore appended first.
//!
//! The execution phase begins with `run`, after which no modules may be
//! added. `run` invokes every module's `start` hook in topology order, then
//! drains the deferred-hook queue (hooks may enqueue further hooks; the
//! async runtime uses this to re-schedule its drain until no tasks remain),
//! and finally invokes `finish` hooks in reverse order. Finish hooks run for
//! every started module even when an earlier hook failed, so a failure never
//! leaves the journal unsaved or the runtime undrained.

use crate::errors::BuildError;
use anyhow::Result;
use std::any::{Any, TypeId, type_name};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// A self-describing build participant with a cooperative execution slot.
pub trait Module: Any + Send + Sync {
    /// Stable identity string, used for persistence sections and output-lock
    /// ownership. Must not change across refactors.
    fn tag(&self) -> &'static str;

    /// Distinguishes multiple instances of one module type (for example one
    /// project module per manifest). `None` for singletons.
    fn discriminant(&self) -> Option<String> {
        None
    }

    /// Discovery-phase hook: register dependency modules.
    fn activate(&self, ws: &mut Workspace) -> Result<()> {
        let _ = ws;
        Ok(())
    }

    /// Execution-phase setup, called in topology order.
    fn start(&self, ws: &Workspace) -> Result<()> {
        let _ = ws;
        Ok(())
    }

    /// Execution-phase teardown, called in reverse topology order.
    fn finish(&self, ws: &Workspace) -> Result<()> {
        let _ = ws;
        Ok(())
    }
}

/// A deferred continuation, run after all `start` hooks.
pub type Hook = Box<dyn FnOnce(&Workspace) -> Result<()> + Send>;

/// FIFO queue of deferred hooks; shared with the runtime so drains can be
/// re-scheduled from outside the workspace borrow.
#[derive(Default)]
pub struct HookQueue {
    queue: Mutex<VecDeque<Hook>>,
}

impl HookQueue {
    pub fn push(&self, hook: Hook) {
        self.queue.lock().expect("hook queue poisoned").push_back(hook);
    }

    fn pop(&self) -> Option<Hook> {
        self.queue.lock().expect("hook queue poisoned").pop_front()
    }
}

type Key = (TypeId, Option<String>);

struct ActiveModule {
    any: Arc<dyn Any + Send + Sync>,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Phase {
    Discovery,
    Execution,
}

pub struct Workspace {
    // `None` marks a module whose activation is in progress.
    slots: HashMap<Key, Option<ActiveModule>>,
    seeded: HashMap<Key, Box<dyn Any + Send>>,
    topology: Vec<Arc<dyn Module>>,
    phase: Phase,
    hooks: Arc<HookQueue>,
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            seeded: HashMap::new(),
            topology: Vec::new(),
            phase: Phase::Discovery,
            hooks: Arc::new(HookQueue::default()),
        }
    }

    /// Register a pre-configured instance that is only activated if `add`
    /// later names its type. Registering twice for one key is an error.
    pub fn seed<M: Module>(&mut self, module: M) -> Result<()> {
        let key = (TypeId::of::<M>(), module.discriminant());
        if self.slots.contains_key(&key) || self.seeded.contains_key(&key) {
            anyhow::bail!(
                "seed() or add() was already invoked for module {}",
                module.tag()
            );
        }
        self.seeded.insert(key, Box::new(module));
        Ok(())
    }

    /// Register and activate a module, constructing it from `Default` if it
    /// was neither added nor seeded before. Idempotent per key.
    pub fn add<M: Module + Default>(&mut self) -> Result<Arc<M>> {
        self.add_instance(M::default())
    }

    /// Register and activate the given instance. If the key is already
    /// active the existing instance is returned and the argument dropped; a
    /// seeded instance takes precedence over the argument.
    pub fn add_instance<M: Module>(&mut self, fallback: M) -> Result<Arc<M>> {
        if self.phase == Phase::Execution {
            return Err(BuildError::DiscoveryClosed.into());
        }
        let key = (TypeId::of::<M>(), fallback.discriminant());
        match self.slots.get(&key) {
            Some(Some(active)) => {
                let any = active.any.clone();
                return any
                    .downcast::<M>()
                    .map_err(|_| anyhow::anyhow!("module key collision for {}", fallback.tag()));
            }
            Some(None) => {
                return Err(
                    BuildError::RecursiveActivation(fallback.tag().to_string()).into(),
                );
            }
            None => {}
        }

        let instance: M = match self.seeded.remove(&key) {
            Some(boxed) => match boxed.downcast::<M>() {
                Ok(seeded) => *seeded,
                Err(_) => fallback,
            },
            None => fallback,
        };

        self.slots.insert(key.clone(), None);
        let outcome = instance.activate(self);
        if let Err(err) = outcome {
            self.slots.remove(&key);
            return Err(err);
        }

        let arc = Arc::new(instance);
        let module: Arc<dyn Module> = arc.clone();
        let any: Arc<dyn Any + Send + Sync> = arc.clone();
        self.topology.push(module);
        self.slots.insert(key, Some(ActiveModule { any }));
        Ok(arc)
    }

    /// Fetch the single active module of a type. Types with several
    /// discriminated instances must be fetched via `get_instance`; a bare
    /// lookup on such a type is ambiguous and errors rather than returning
    /// an arbitrary instance.
    pub fn get<M: Module>(&self) -> Result<Arc<M>, BuildError> {
        let wanted = TypeId::of::<M>();
        let mut found: Option<Arc<M>> = None;
        for (key, slot) in &self.slots {
            if key.0 == wanted
                && let Some(active) = slot
                && let Ok(arc) = active.any.clone().downcast::<M>()
            {
                if found.is_some() {
                    return Err(BuildError::AmbiguousModule(type_name::<M>()));
                }
                found = Some(arc);
            }
        }
        found.ok_or(BuildError::ModuleMissing(type_name::<M>()))
    }

    /// Fetch one discriminated instance by the same `(type, discriminant)`
    /// key that `add` and `seed` insert under.
    pub fn get_instance<M: Module>(&self, discriminant: Option<&str>) -> Result<Arc<M>, BuildError> {
        let key = (TypeId::of::<M>(), discriminant.map(str::to_string));
        match self.slots.get(&key) {
            Some(Some(active)) => active
                .any
                .clone()
                .downcast::<M>()
                .map_err(|_| BuildError::ModuleMissing(type_name::<M>())),
            _ => Err(BuildError::ModuleMissing(type_name::<M>())),
        }
    }

    /// True once `run` has been entered.
    pub fn is_executing(&self) -> bool {
        self.phase == Phase::Execution
    }

    pub fn contains<M: Module>(&self) -> bool {
        let wanted = TypeId::of::<M>();
        self.slots.keys().any(|key| key.0 == wanted)
    }

    /// Enqueue a deferred hook; it runs after all `start` hooks and before
    /// any `finish` hook, in registration order.
    pub fn defer(&self, hook: impl FnOnce(&Workspace) -> Result<()> + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Shared handle to the deferred-hook queue.
    pub fn hook_queue(&self) -> Arc<HookQueue> {
        self.hooks.clone()
    }

    /// Execute all modules: starts in topology order, deferred hooks, then
    /// finishes in reverse order. The first error wins, but every started
    /// module is still finished.
    pub fn run(&mut self) -> Result<()> {
        if self.phase == Phase::Execution {
            anyhow::bail!("workspace is already executing");
        }
        self.phase = Phase::Execution;
        tracing::debug!(modules = self.topology.len(), "entering execution phase");

        let topology = self.topology.clone();
        let mut started = 0;
        let mut first_err: Option<anyhow::Error> = None;

        for module in &topology {
            match module.start(self) {
                Ok(()) => started += 1,
                Err(err) => {
                    first_err = Some(err.context(format!("starting module {}", module.tag())));
                    break;
                }
            }
        }

        if first_err.is_none() {
            while let Some(hook) = self.hooks.pop() {
                if let Err(err) = hook(self) {
                    first_err = Some(err);
                    break;
                }
            }
        }

        for module in topology[..started].iter().rev() {
            if let Err(err) = module.finish(self) {
                let err = err.context(format!("finishing module {}", module.tag()));
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    tracing::warn!("secondary teardown failure: {err:#}");
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
