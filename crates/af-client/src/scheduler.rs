//! ConcurrencyScheduler - bounded parallelism
//!
//! Two entry points share one admission discipline:
//! - `parallel` / `parallel_with` run an explicit batch on a pool of
//!   `min(limit, len)` workers, each pulling the next pending operation in
//!   index order when it finishes its current one.
//! - `ConcurrencyScheduler` is a fair FIFO semaphore the dispatcher uses to
//!   admit individual transport calls.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use af_common::ClassifiedError;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

// ============================================================================
// Batch execution
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub limit: usize,
    /// Reject on the first failure and admit nothing further
    pub fail_fast: bool,
}

impl BatchOptions {
    pub fn new(limit: usize) -> Self {
        Self { limit, fail_fast: false }
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }
}

/// First failure of a fail-fast batch
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Batch operation {index} failed: {error}")]
pub struct BatchFailure<E> {
    pub index: usize,
    pub error: E,
}

/// Run every operation with at most `limit` in flight, returning each outcome
/// at its input index.
pub async fn parallel<T, E, F, Fut>(operations: Vec<F>, limit: usize) -> Vec<Result<T, E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let (results, _) = run_batch(operations, BatchOptions::new(limit)).await;
    results
        .into_iter()
        .flatten()
        .collect()
}

/// `parallel` with explicit options. Without `fail_fast` this always returns `Ok`.
pub async fn parallel_with<T, E, F, Fut>(
    operations: Vec<F>,
    options: BatchOptions,
) -> Result<Vec<Result<T, E>>, BatchFailure<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let (results, failure) = run_batch(operations, options).await;
    if let Some(failure) = failure {
        return Err(failure);
    }
    Ok(results.into_iter().flatten().collect())
}

async fn run_batch<T, E, F, Fut>(
    operations: Vec<F>,
    options: BatchOptions,
) -> (Vec<Option<Result<T, E>>>, Option<BatchFailure<E>>)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let total = operations.len();
    let workers = options.limit.max(1).min(total);

    let pending: Mutex<VecDeque<(usize, F)>> =
        Mutex::new(operations.into_iter().enumerate().collect());
    let results: Mutex<Vec<Option<Result<T, E>>>> =
        Mutex::new((0..total).map(|_| None).collect());
    let failure: Mutex<Option<BatchFailure<E>>> = Mutex::new(None);
    let halted = AtomicBool::new(false);

    debug!(total, workers, fail_fast = options.fail_fast, "Starting batch");

    let worker = |worker_id: usize| {
        let pending = &pending;
        let results = &results;
        let failure = &failure;
        let halted = &halted;
        async move {
            loop {
                if halted.load(Ordering::SeqCst) {
                    break;
                }
                // Lock is released before the operation is awaited
                let next = pending.lock().pop_front();
                let Some((index, op)) = next else { break };

                trace!(worker_id, index, "Admitting batch operation");
                let outcome = op().await;

                match outcome {
                    Err(error) if options.fail_fast => {
                        halted.store(true, Ordering::SeqCst);
                        let mut slot = failure.lock();
                        if slot.is_none() {
                            *slot = Some(BatchFailure { index, error });
                        }
                    }
                    outcome => {
                        results.lock()[index] = Some(outcome);
                    }
                }
            }
        }
    };

    join_all((0..workers).map(worker)).await;

    (results.into_inner(), failure.into_inner())
}

// ============================================================================
// Admission control
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub name: String,
    pub limit: usize,
    pub active: usize,
    pub queued: usize,
}

/// Fair FIFO admission for individual calls
#[derive(Debug)]
pub struct ConcurrencyScheduler {
    name: String,
    limit: usize,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
}

impl ConcurrencyScheduler {
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            name: name.into(),
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            queued: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Wait for a slot. Cancellation while waiting returns Aborted and
    /// leaves the slot count untouched.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, ClassifiedError> {
        if cancel.is_cancelled() {
            return Err(ClassifiedError::aborted("Cancelled before admission"));
        }

        let _waiting = QueuedGuard::new(&self.queued);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClassifiedError::aborted("Cancelled while waiting for a slot")),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| ClassifiedError::aborted("Scheduler closed"))
            }
        };

        if result.is_ok() {
            trace!(scheduler = %self.name, available = self.semaphore.available_permits(), "Slot granted");
        }
        result
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            name: self.name.clone(),
            limit: self.limit,
            active: self.limit - self.semaphore.available_permits(),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }
}

/// Keeps the queued count accurate even when the waiting future is dropped
struct QueuedGuard<'a>(&'a AtomicUsize);

impl<'a> QueuedGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_limit_and_keeps_order() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let ops: Vec<_> = (0..10u64)
            .map(|i| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                move || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    // Later items finish sooner
                    tokio::time::sleep(Duration::from_millis(100 - i * 10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(i)
                }
            })
            .collect();

        let results = parallel(ops, 3).await;

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        let values: Vec<u64> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let ops: Vec<fn() -> std::future::Ready<Result<(), ()>>> = Vec::new();
        assert!(parallel(ops, 4).await.is_empty());
    }

    #[tokio::test]
    async fn test_failures_recorded_in_place() {
        let ops: Vec<_> = (0..5)
            .map(|i| move || async move { if i % 2 == 0 { Ok(i) } else { Err(i) } })
            .collect();

        let results = parallel(ops, 2).await;
        assert_eq!(results, vec![Ok(0), Err(1), Ok(2), Err(3), Ok(4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_stops_admission() {
        let started = Arc::new(AtomicUsize::new(0));
        let ops: Vec<_> = (0..6)
            .map(|i| {
                let started = started.clone();
                move || async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    let ms = if i == 1 { 5 } else { 10 };
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    if i == 1 { Err(format!("op {} failed", i)) } else { Ok(i) }
                }
            })
            .collect();

        let err = parallel_with(ops, BatchOptions::new(2).fail_fast())
            .await
            .unwrap_err();

        assert_eq!(err.index, 1);
        assert_eq!(err.error, "op 1 failed");
        // Op 1 fails before op 0 finishes, so nothing else is admitted
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_limit_runs_serially() {
        let ops: Vec<_> = (0..3).map(|i| move || async move { Ok::<_, ()>(i) }).collect();
        let results = parallel_with(ops, BatchOptions::new(0)).await.unwrap();
        assert_eq!(results, vec![Ok(0), Ok(1), Ok(2)]);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_cancel() {
        let scheduler = ConcurrencyScheduler::new("default", 1);
        let held = scheduler.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let mut waiter = tokio_test::task::spawn(scheduler.acquire(&cancel));
        tokio_test::assert_pending!(waiter.poll());

        cancel.cancel();
        assert!(waiter.is_woken());
        let err = tokio_test::assert_ready!(waiter.poll()).unwrap_err();
        assert!(err.is_aborted());

        drop(waiter);
        drop(held);
        assert_eq!(scheduler.stats().active, 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_consumes_no_slot() {
        let scheduler = Arc::new(ConcurrencyScheduler::new("default", 1));
        let held = scheduler.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.acquire(&cancel).await })
        };

        while scheduler.stats().queued == 0 {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_aborted());

        let stats = scheduler.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.queued, 0);

        drop(held);
        assert_eq!(scheduler.stats().active, 0);
    }
}
