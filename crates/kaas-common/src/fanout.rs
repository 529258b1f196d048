//! Fan-out of independent tasks with a join barrier.
//!
//! Every item gets its own tokio task. Results are collected only after all
//! tasks have finished, so aggregation (e.g. counting failures) never sees a
//! partial picture. No ordering between tasks is guaranteed or needed.

use std::future::Future;

use tracing::error;

use crate::Error;

/// Run `task` once per item concurrently and wait for all of them.
///
/// Returns each item paired with its task's output. A task that panics is
/// reported as an internal error for its item; the other tasks are unaffected.
pub async fn fan_out<I, T, F, Fut, R>(items: I, task: F) -> Vec<(T, Result<R, Error>)>
where
    I: IntoIterator<Item = T>,
    T: Clone + Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    let handles: Vec<_> = items
        .into_iter()
        .map(|item| {
            let handle = tokio::spawn(task(item.clone()));
            (item, handle)
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (item, handle) in handles {
        let result = handle.await.map_err(|e| {
            error!(error = %e, "fanned-out task did not complete");
            Error::internal_with_context("fan_out", format!("task failed to complete: {e}"))
        });
        results.push((item, result));
    }
    results
}

/// Like [`fan_out`] for tasks that can fail, flattening the task error.
pub async fn fan_out_try<I, T, F, Fut, R>(items: I, task: F) -> Vec<(T, Result<R, Error>)>
where
    I: IntoIterator<Item = T>,
    T: Clone + Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
    R: Send + 'static,
{
    fan_out(items, task)
        .await
        .into_iter()
        .map(|(item, result)| (item, result.and_then(|inner| inner)))
        .collect()
}

/// Count the failed results of a completed fan-out
pub fn count_failures<T, R>(results: &[(T, Result<R, Error>)]) -> usize {
    results.iter().filter(|(_, r)| r.is_err()).count()
}
