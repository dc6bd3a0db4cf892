//! # Worker Pool Module
//!
//! Bounded-concurrency task runner shared by the image and video phases.
//!
//! ## Scheduling:
//! - A `Semaphore` holds `concurrency` permits; one is acquired before each launch
//!   and moved into the spawned task
//! - The permit drops as soon as the task settles, so the next queued task starts
//!   immediately instead of waiting for a whole batch
//! - Settled tasks are collected from a `JoinSet` in completion order
//!
//! ## Failure isolation:
//! A task's error (or panic) becomes a failed `TaskOutcome`; siblings and the
//! pool keep running.
//!
//! ## Cancellation:
//! The injected `CancellationToken` is checked before every launch and while
//! waiting for a free slot. Once set, nothing new starts, tasks already running
//! finish, and every outcome collected so far is returned.

use anyhow::anyhow;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of one settled task
#[derive(Debug)]
pub struct TaskOutcome<T> {
    /// Position of the task in the submitted sequence
    pub index: usize,
    pub result: anyhow::Result<T>,
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Everything a pool run produced
#[derive(Debug)]
pub struct PoolReport<T> {
    /// Outcomes in completion order
    pub outcomes: Vec<TaskOutcome<T>>,
    pub launched: usize,
    /// Stopped early because cancellation was requested
    pub cancelled: bool,
}

impl<T> PoolReport<T> {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_success()).count()
    }
}

/// Semaphore-backed task pool
pub struct WorkerPool {
    concurrency: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    /// `concurrency` is clamped to at least 1
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            concurrency,
            semaphore: Arc::new(Semaphore::new(concurrency)),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Tasks currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.concurrency - self.semaphore.available_permits()
    }

    /// Run `tasks` with at most `concurrency` in flight.
    ///
    /// `on_settled(processed, outcome)` is called once per settled task from this
    /// single control loop, with `processed` strictly increasing from 1.
    pub async fn run<T, F, Fut, C>(
        &self,
        tasks: Vec<F>,
        cancel: &CancellationToken,
        mut on_settled: C,
    ) -> PoolReport<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        C: FnMut(usize, &TaskOutcome<T>),
    {
        let total = tasks.len();
        let mut queue = tasks.into_iter().enumerate();
        let mut next = queue.next();
        let mut running: JoinSet<TaskOutcome<T>> = JoinSet::new();
        let mut outcomes = Vec::with_capacity(total);
        let mut processed = 0;
        let mut launched = 0;
        let mut cancelled = false;

        loop {
            if next.is_some() && !cancelled && cancel.is_cancelled() {
                debug!("Cancellation requested, {} of {} tasks launched", launched, total);
                cancelled = true;
            }
            let can_launch = next.is_some() && !cancelled;
            if !can_launch && running.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                Some(joined) = running.join_next() => {
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            // Panics are caught inside the task, so only an abort gets here
                            warn!("Pool task ended abnormally: {}", e);
                            continue;
                        }
                    };
                    processed += 1;
                    on_settled(processed, &outcome);
                    outcomes.push(outcome);
                }

                permit = self.semaphore.clone().acquire_owned(), if can_launch => {
                    let Ok(permit) = permit else {
                        warn!("Worker pool semaphore closed");
                        cancelled = true;
                        continue;
                    };
                    if cancel.is_cancelled() {
                        continue;
                    }
                    if let Some((index, task)) = next.take() {
                        launched += 1;
                        running.spawn(async move {
                            let _permit = permit;
                            let result = match AssertUnwindSafe(task()).catch_unwind().await {
                                Ok(result) => result,
                                Err(panic) => Err(anyhow!("Task panicked: {}", panic_message(&*panic))),
                            };
                            TaskOutcome { index, result }
                        });
                        next = queue.next();
                    }
                }

                _ = cancel.cancelled(), if can_launch => {}

                else => break,
            }
        }

        PoolReport {
            outcomes,
            launched,
            cancelled,
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_in_flight_never_exceeds_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                move || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(5 + (i % 3) * 5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                }
            })
            .collect();

        let pool = WorkerPool::new(3);
        let mut seen = Vec::new();
        let report = pool
            .run(tasks, &CancellationToken::new(), |processed, _| seen.push(processed))
            .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(report.outcomes.len(), 20);
        assert_eq!(report.launched, 20);
        assert!(!report.cancelled);
        assert_eq!(seen, (1..=20).collect::<Vec<_>>());

        let indices: HashSet<usize> = report.outcomes.iter().map(|o| o.index).collect();
        assert_eq!(indices.len(), 20);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_free_slot_is_refilled_immediately() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<_> = (0..6u64)
            .map(|i| {
                let order = order.clone();
                move || async move {
                    let delay = if i == 0 { 300 } else { 10 };
                    sleep(Duration::from_millis(delay)).await;
                    order.lock().unwrap().push(i);
                    Ok(())
                }
            })
            .collect();

        WorkerPool::new(2)
            .run(tasks, &CancellationToken::new(), |_, _| {})
            .await;

        // The slow task holds one slot; the other slot drains the rest meanwhile
        let order = order.lock().unwrap().clone();
        assert_eq!(order.last(), Some(&0));
        assert_eq!(order.len(), 6);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let tasks: Vec<_> = (0..5)
            .map(|i| {
                move || async move {
                    match i {
                        2 => Err(anyhow!("boom")),
                        3 => panic!("task three exploded"),
                        _ => Ok(i),
                    }
                }
            })
            .collect();

        let report = WorkerPool::new(2)
            .run(tasks, &CancellationToken::new(), |_, _| {})
            .await;

        assert_eq!(report.outcomes.len(), 5);
        assert_eq!(report.failures(), 2);
        let panicked = report.outcomes.iter().find(|o| o.index == 3).unwrap();
        let message = panicked.result.as_ref().unwrap_err().to_string();
        assert!(message.contains("task three exploded"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_launches() {
        let cancel = CancellationToken::new();
        let completed = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let cancel = cancel.clone();
                let completed = completed.clone();
                move || async move {
                    if i == 0 {
                        cancel.cancel();
                    }
                    sleep(Duration::from_millis(20)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(i)
                }
            })
            .collect();

        let report = WorkerPool::new(2).run(tasks, &cancel, |_, _| {}).await;

        assert!(report.cancelled);
        assert!(report.launched <= 2);
        // Launched tasks always run to completion
        assert_eq!(report.outcomes.len(), report.launched);
        assert_eq!(completed.load(Ordering::SeqCst), report.launched);
        assert!(report.outcomes.iter().all(|o| o.is_success()));
    }

    #[tokio::test]
    async fn test_pre_cancelled_and_empty_runs() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tasks: Vec<_> = (0..3).map(|i| move || async move { Ok(i) }).collect();
        let report = WorkerPool::new(4).run(tasks, &cancel, |_, _| {}).await;
        assert_eq!(report.launched, 0);
        assert!(report.outcomes.is_empty());
        assert!(report.cancelled);

        let empty: Vec<fn() -> std::future::Ready<anyhow::Result<()>>> = Vec::new();
        let report = WorkerPool::new(0).run(empty, &CancellationToken::new(), |_, _| {}).await;
        assert!(report.outcomes.is_empty());
        assert!(!report.cancelled);
    }
}
