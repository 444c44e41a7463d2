//! Bounded intra-stage worker pool (§4.1, §5).
//!
//! Stage sequencing itself is strictly sequential; parallelism exists
//! only *inside* a stage (e.g. competing code-generation workers). This
//! module provides the bounded pool abstraction a [`crate::stage::Stage`]
//! implementation uses for that — the substrate's job is only to cap
//! concurrency at `max_workers` and propagate cancellation, never to
//! understand what a worker does.

use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use crate::error::{ArtemisError, ArtemisResult};
use crate::stage::CancellationToken;

/// Run `tasks` with at most `max_workers` executing concurrently.
///
/// Each task is a thunk producing a future (so tasks can be built
/// lazily and only spawned as a permit frees up). Returns results in
/// the same order as `tasks`. If `cancel` trips, no further tasks are
/// started and already-spawned tasks are awaited as-is — `max_workers
/// = 1` behaves identically to running them one at a time in order
/// (§8 boundary behavior).
///
/// # Errors
///
/// Returns [`ArtemisError::Cancelled`] if cancellation is observed
/// before every task completes.
pub async fn run_bounded<T, F, Fut>(
    max_workers: usize,
    tasks: Vec<T>,
    cancel: &CancellationToken,
    spawn: F,
) -> ArtemisResult<Vec<Fut::Output>>
where
    F: Fn(T) -> Fut,
    Fut: Future,
{
    let max_workers = max_workers.max(1);
    let semaphore = Semaphore::new(max_workers);
    let mut indexed_results: Vec<Option<Fut::Output>> = (0..tasks.len()).map(|_| None).collect();

    let mut in_flight = FuturesUnordered::new();
    let mut remaining: std::collections::VecDeque<(usize, T)> =
        tasks.into_iter().enumerate().collect();

    loop {
        if cancel.is_cancelled() && in_flight.is_empty() {
            return Err(ArtemisError::cancelled());
        }

        while in_flight.len() < max_workers && !remaining.is_empty() {
            if cancel.is_cancelled() {
                break;
            }
            let Ok(permit) = semaphore.acquire().await else {
                break;
            };
            let (index, task) = remaining.pop_front().expect("checked non-empty");
            let future = spawn(task);
            in_flight.push(async move {
                let output = future.await;
                drop(permit);
                (index, output)
            });
        }

        if in_flight.is_empty() {
            if remaining.is_empty() {
                break;
            }
            // Cancelled with nothing in flight and work still queued.
            return Err(ArtemisError::cancelled());
        }

        if let Some((index, output)) = in_flight.next().await {
            indexed_results[index] = Some(output);
        }
    }

    Ok(indexed_results
        .into_iter()
        .map(|slot| slot.expect("every index produced exactly one result"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn respects_max_workers() {
        let cancel = CancellationToken::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<usize> = (0..6).collect();
        let results = run_bounded(2, tasks, &cancel, |i| {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                i * 2
            }
        })
        .await
        .unwrap();

        assert_eq!(results, vec![0, 2, 4, 6, 8, 10]);
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn max_workers_one_runs_sequentially_in_order() {
        let cancel = CancellationToken::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let tasks: Vec<usize> = (0..4).collect();
        let results = run_bounded(1, tasks, &cancel, |i| {
            let order = order.clone();
            async move {
                order.lock().unwrap().push(i);
                i
            }
        })
        .await
        .unwrap();
        assert_eq!(results, vec![0, 1, 2, 3]);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn cancellation_before_start_yields_cancelled_error() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tasks: Vec<usize> = vec![1, 2, 3];
        let err = run_bounded(2, tasks, &cancel, |i| async move { i })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
    }
}
