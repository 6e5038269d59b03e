//! Single-flight memoization and lazy tasks.
//!
//! `SingleFlight` is the concurrent once-per-argument map: for a given key,
//! at most one task is in flight and every caller joins it. `LazyTask`
//! defers creating its task until first demand, so gathers can avoid
//! launching children that will never be needed.

use super::{TaskHandle, TaskRuntime};
use crate::errors::SharedResult;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

pub struct SingleFlight<K, T: Clone> {
    map: Mutex<HashMap<K, TaskHandle<T>>>,
}

impl<K, T: Clone> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the in-flight (or completed) task for `key`, spawning it on
    /// first demand. Later callers share the first caller's result.
    pub fn get_or_spawn<F, Fut>(&self, rt: &Arc<TaskRuntime>, key: K, make: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SharedResult<T>> + Send + 'static,
    {
        let mut map = self.map.lock().expect("flight map poisoned");
        if let Some(handle) = map.get(&key) {
            return handle.clone();
        }
        let handle = rt.spawn(make());
        map.insert(key, handle.clone());
        handle
    }

    /// Already-memoized task for `key`, if any.
    pub fn peek(&self, key: &K) -> Option<TaskHandle<T>> {
        self.map.lock().expect("flight map poisoned").get(key).cloned()
    }

    /// Drop the memoized task so the next demand recomputes.
    pub fn forget(&self, key: &K) {
        self.map.lock().expect("flight map poisoned").remove(key);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.lock().expect("flight map poisoned").contains_key(key)
    }
}

type Thunk<T> = Box<dyn FnOnce() -> BoxFuture<'static, SharedResult<T>> + Send>;

enum LazyState<T: Clone> {
    Thunk(Thunk<T>),
    Started(TaskHandle<T>),
    // Transient marker while swapping states.
    Poisoned,
}

/// A computation that is only spawned on first demand.
pub struct LazyTask<T: Clone> {
    state: Mutex<LazyState<T>>,
}

impl<T> LazyTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(thunk: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SharedResult<T>> + Send + 'static,
    {
        Self {
            state: Mutex::new(LazyState::Thunk(Box::new(move || thunk().boxed()))),
        }
    }

    pub fn started(&self) -> bool {
        matches!(
            *self.state.lock().expect("lazy state poisoned"),
            LazyState::Started(_)
        )
    }

    /// Spawn the underlying task if this is the first demand; return the
    /// shared handle either way.
    pub fn start(&self, rt: &Arc<TaskRuntime>) -> TaskHandle<T> {
        let mut state = self.state.lock().expect("lazy state poisoned");
        match &*state {
            LazyState::Started(handle) => handle.clone(),
            LazyState::Thunk(_) | LazyState::Poisoned => {
                match std::mem::replace(&mut *state, LazyState::Poisoned) {
                    LazyState::Thunk(thunk) => {
                        let handle = rt.spawn(thunk());
                        *state = LazyState::Started(handle.clone());
                        handle
                    }
                    LazyState::Started(handle) => {
                        let out = handle.clone();
                        *state = LazyState::Started(handle);
                        out
                    }
                    LazyState::Poisoned => unreachable!("lazy task state lost"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{BuildError, SharedError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime() -> Arc<TaskRuntime> {
        Arc::new(TaskRuntime::new(tokio::runtime::Handle::current(), 2))
    }

    #[tokio::test]
    async fn equal_keys_share_one_task() {
        let rt = runtime();
        let flights: SingleFlight<String, u32> = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let make = || {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            }
        };
        let a = flights.get_or_spawn(&rt, "k".to_string(), make);

        let runs2 = runs.clone();
        let b = flights.get_or_spawn(&rt, "k".to_string(), || {
            let runs = runs2.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            }
        });

        assert_eq!(a.await.unwrap(), 7);
        assert_eq!(b.await.unwrap(), 7);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forget_recomputes_on_next_demand() {
        let rt = runtime();
        let flights: SingleFlight<&'static str, u32> = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let runs = runs.clone();
            let handle = flights.get_or_spawn(&rt, "k", move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            });
            let _ = handle.await;
            flights.forget(&"k");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn flight_failures_are_shared() {
        let rt = runtime();
        let flights: SingleFlight<u8, ()> = SingleFlight::new();
        let handle = flights.get_or_spawn(&rt, 1, || async {
            Err(SharedError::from(BuildError::Invariant("broken".into())))
        });
        let again = flights
            .get_or_spawn(&rt, 1, || async { panic!("must not run") });
        assert!(handle.await.is_err());
        assert!(again.await.is_err());
    }

    #[tokio::test]
    async fn lazy_tasks_do_not_run_until_demanded() {
        let rt = runtime();
        let runs = Arc::new(AtomicUsize::new(0));
        let lazy = {
            let runs = runs.clone();
            LazyTask::new(move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(3)
            })
        };

        rt.wait_idle().await;
        assert!(!lazy.started());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let first = lazy.start(&rt);
        let second = lazy.start(&rt);
        assert_eq!(first.await.unwrap(), 3);
        assert_eq!(second.await.unwrap(), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
