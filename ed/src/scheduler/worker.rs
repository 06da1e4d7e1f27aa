//! Bounded worker pools over phase queues

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::queue::{Job, JobOutcome, JobQueue};

/// A pool of identical workers consuming one queue
///
/// Concurrency is bounded by the worker count. Cancellation is cooperative:
/// handlers check the iteration's cancellation flag between case boundaries
/// and report `Done` for work they skipped (idempotent upserts make replays
/// safe).
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers running `handler` over the queue
    pub fn spawn<H, Fut>(queue: Arc<JobQueue>, concurrency: usize, handler: H) -> Self
    where
        H: Fn(Job) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = JobOutcome> + Send,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(concurrency);

        info!(queue = queue.kind().as_str(), concurrency, "spawning worker pool");
        for worker_index in 0..concurrency.max(1) {
            let queue = queue.clone();
            let handler = handler.clone();
            let mut shutdown_rx = shutdown_rx.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        job = queue.dequeue() => job,
                        _ = shutdown_rx.changed() => {
                            debug!(worker_index, "worker shutting down");
                            break;
                        }
                    };
                    let Some(job) = job else {
                        debug!(worker_index, "queue closed, worker exiting");
                        break;
                    };

                    debug!(worker_index, job_id = job.id, queue = job.queue.as_str(), "worker picked up job");
                    let retained = job.clone();
                    let outcome = handler(job).await;
                    queue.settle(retained, outcome);
                }
            }));
        }

        Self { handles, shutdown_tx }
    }

    /// Signal shutdown and wait for every worker to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::queue::{EnqueueOptions, QueueKind, QueueRetryConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_queue() -> Arc<JobQueue> {
        Arc::new(JobQueue::new(
            QueueKind::JudgeOutputs,
            QueueRetryConfig {
                backoff_base_ms: 1,
                backoff_multiplier: 1.0,
            },
        ))
    }

    #[tokio::test]
    async fn test_pool_processes_all_jobs() {
        let queue = test_queue();
        let processed = Arc::new(AtomicUsize::new(0));

        let pool = {
            let processed = processed.clone();
            WorkerPool::spawn(queue.clone(), 4, move |_job| {
                let processed = processed.clone();
                async move {
                    processed.fetch_add(1, Ordering::SeqCst);
                    JobOutcome::Done
                }
            })
        };

        for n in 0..20 {
            queue.enqueue(serde_json::json!({"n": n}), EnqueueOptions::default());
        }
        queue.wait_idle().await;
        assert_eq!(processed.load(Ordering::SeqCst), 20);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let queue = test_queue();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let pool = {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            WorkerPool::spawn(queue.clone(), 2, move |_job| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    JobOutcome::Done
                }
            })
        };

        for n in 0..10 {
            queue.enqueue(serde_json::json!({"n": n}), EnqueueOptions::default());
        }
        queue.wait_idle().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_flows_through_pool() {
        let queue = test_queue();
        let attempts = Arc::new(AtomicUsize::new(0));

        let pool = {
            let attempts = attempts.clone();
            WorkerPool::spawn(queue.clone(), 1, move |_job| {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        JobOutcome::Retry("flaky".to_string())
                    } else {
                        JobOutcome::Done
                    }
                }
            })
        };

        queue.enqueue(serde_json::json!({}), EnqueueOptions::default());
        queue.wait_idle().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(queue.dead_letters().is_empty());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let queue = test_queue();
        let pool = WorkerPool::spawn(queue.clone(), 3, |_job| async { JobOutcome::Done });
        // No jobs; shutdown must not hang
        tokio::time::timeout(Duration::from_secs(1), pool.shutdown())
            .await
            .expect("shutdown timed out");
    }
}
