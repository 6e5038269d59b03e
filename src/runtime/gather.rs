//! Gather policies over result futures.
//!
//! - `gather`: tuple policy — all children must succeed; completes with
//!   results in argument order, or with the first failure.
//! - `gather_lazy`: tuple policy over lazy children with fail-fast launch —
//!   once a started child has settled with an error, later children are
//!   never started.
//! - `gather_or` / `gather_and`: boolean short-circuit in completion order.
//! - `with_interrupt`: cancel policy — the core future's result, unless the
//!   interrupt fires first.

use super::flight::LazyTask;
use super::interrupt::Interrupt;
use super::TaskRuntime;
use crate::errors::SharedResult;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::future::Future;
use std::sync::Arc;

/// All children must succeed; results come back in argument order. The
/// aggregate completes with the first failure without waiting for the rest.
pub async fn gather<T, F>(futs: Vec<F>) -> SharedResult<Vec<T>>
where
    F: Future<Output = SharedResult<T>>,
{
    futures::future::try_join_all(futs).await
}

/// Fail-fast tuple gather: children start in argument order, and as soon
/// as a started child has already settled with an error — a spawn refused
/// by a shut-down or interrupted runtime settles synchronously — the
/// remaining children are never started. Started children run concurrently
/// and all settle before the aggregate completes.
pub async fn gather_lazy<T>(
    rt: &Arc<TaskRuntime>,
    children: &[LazyTask<T>],
) -> SharedResult<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let mut handles = Vec::with_capacity(children.len());
    for child in children {
        let handle = child.start(rt);
        let failed = matches!(handle.peek(), Some(Err(_)));
        handles.push(handle);
        if failed {
            break;
        }
    }
    gather(handles).await
}

/// Disjunction: completes with `true` as soon as any child does, with the
/// first failure, or with `false` once every child finished false.
pub async fn gather_or<F>(futs: Vec<F>) -> SharedResult<bool>
where
    F: Future<Output = SharedResult<bool>>,
{
    let mut pending: FuturesUnordered<F> = futs.into_iter().collect();
    while let Some(result) = pending.next().await {
        match result {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(false)
}

/// Conjunction: completes with `false` as soon as any child does, with the
/// first failure, or with `true` once every child finished true.
pub async fn gather_and<F>(futs: Vec<F>) -> SharedResult<bool>
where
    F: Future<Output = SharedResult<bool>>,
{
    let mut pending: FuturesUnordered<F> = futs.into_iter().collect();
    while let Some(result) = pending.next().await {
        match result {
            Ok(false) => return Ok(false),
            Ok(true) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

/// Cancel policy: the core future's result, unless the interrupt fires
/// sooner.
pub async fn with_interrupt<T, F>(interrupt: &Interrupt, fut: F) -> SharedResult<T>
where
    F: Future<Output = SharedResult<T>>,
{
    tokio::select! {
        result = fut => result,
        err = interrupt.triggered() => Err(err),
    }
}
