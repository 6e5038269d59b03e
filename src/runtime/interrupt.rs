//! Process-wide interrupt.
//!
//! A single interrupt is fulfilled when the user requests abort (SIGINT) or
//! when the runtime is torn down. Every attached task is composed with it
//! cancel-policy style: the task completes either with its natural result
//! or with the interrupt error, whichever happens first.

use crate::errors::{SharedError, SharedResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    fired: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fulfil the interrupt. Idempotent.
    pub fn trigger(&self) {
        if !self.inner.fired.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Fail fast when the interrupt has already fired.
    pub fn check(&self) -> SharedResult<()> {
        if self.is_triggered() {
            Err(SharedError::interrupted())
        } else {
            Ok(())
        }
    }

    /// Resolves with the interrupt error once the interrupt fires. Never
    /// resolves otherwise.
    pub async fn triggered(&self) -> SharedError {
        loop {
            // Register before checking so a concurrent trigger cannot slip
            // between the check and the await.
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return SharedError::interrupted();
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_releases_waiters() {
        let interrupt = Interrupt::new();
        let waiter = {
            let interrupt = interrupt.clone();
            tokio::spawn(async move { interrupt.triggered().await })
        };
        assert!(!interrupt.is_triggered());
        interrupt.trigger();
        let err = waiter.await.unwrap();
        assert!(err.is_interrupt());
    }

    #[tokio::test]
    async fn triggered_resolves_immediately_after_the_fact() {
        let interrupt = Interrupt::new();
        interrupt.trigger();
        interrupt.trigger();
        let err = interrupt.triggered().await;
        assert!(err.is_interrupt());
        assert!(interrupt.check().is_err());
    }
}
