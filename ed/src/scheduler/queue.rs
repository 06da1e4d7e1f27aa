//! Priority job queue with retry backoff and dead-lettering
//!
//! One queue per phase family. Ordering is priority first, FIFO within a
//! priority. Transient failures requeue with exponential backoff until the
//! attempt budget is spent, then the job moves to the dead-letter list with
//! its last error preserved.

use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Queue families, one per phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueKind {
    ExecuteRun,
    JudgeOutputs,
    AggregateScores,
    RefinePrompt,
    GenerateDataset,
    SafetyScan,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecuteRun => "execute-run",
            Self::JudgeOutputs => "judge-outputs",
            Self::AggregateScores => "aggregate-scores",
            Self::RefinePrompt => "refine-prompt",
            Self::GenerateDataset => "generate-dataset",
            Self::SafetyScan => "safety-scan",
        }
    }
}

/// Job priority; higher runs first, FIFO within a level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// One unit of work
#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub queue: QueueKind,
    pub payload: serde_json::Value,
    pub priority: Priority,
    /// 0-based attempt counter
    pub attempt: u32,
    pub max_attempts: u32,
    pub dedup_key: Option<String>,
}

/// Enqueue options
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub max_attempts: u32,
    pub delay: Option<Duration>,
    pub dedup_key: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            max_attempts: 3,
            delay: None,
            dedup_key: None,
        }
    }
}

/// A job that exhausted its attempts
#[derive(Debug, Clone)]
pub struct DeadJob {
    pub job: Job,
    pub last_error: String,
}

/// Terminal disposition reported by a worker
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Completed; ack and drop
    Done,
    /// Transient failure; requeue with backoff until attempts run out
    Retry(String),
    /// Permanent failure; dead-letter immediately
    Fatal(String),
}

#[derive(Debug)]
struct HeapEntry {
    priority: Priority,
    seq: u64,
    job: Job,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first, then earlier sequence (FIFO)
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    ready: BinaryHeap<HeapEntry>,
    /// Jobs waiting out a delay or retry backoff
    delayed: Vec<(Instant, Job)>,
    dedup: HashSet<String>,
    dead: Vec<DeadJob>,
    /// Enqueued or in-flight jobs not yet settled
    outstanding: usize,
    next_id: u64,
    next_seq: u64,
    closed: bool,
}

/// Queue retry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRetryConfig {
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for QueueRetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_multiplier: 2.0,
        }
    }
}

/// A single phase-family queue
pub struct JobQueue {
    kind: QueueKind,
    retry: QueueRetryConfig,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl JobQueue {
    pub fn new(kind: QueueKind, retry: QueueRetryConfig) -> Self {
        Self {
            kind,
            retry,
            inner: Mutex::new(Inner {
                ready: BinaryHeap::new(),
                delayed: Vec::new(),
                dedup: HashSet::new(),
                dead: Vec::new(),
                outstanding: 0,
                next_id: 1,
                next_seq: 1,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Enqueue a job; duplicate dedup keys are rejected as no-ops
    pub fn enqueue(&self, payload: serde_json::Value, options: EnqueueOptions) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(key) = &options.dedup_key
            && !inner.dedup.insert(key.clone())
        {
            debug!(queue = self.kind.as_str(), key, "duplicate dedup key, dropping enqueue");
            return None;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let job = Job {
            id,
            queue: self.kind,
            payload,
            priority: options.priority,
            attempt: 0,
            max_attempts: options.max_attempts.max(1),
            dedup_key: options.dedup_key,
        };
        inner.outstanding += 1;

        match options.delay {
            Some(delay) => inner.delayed.push((Instant::now() + delay, job)),
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.ready.push(HeapEntry {
                    priority: job.priority,
                    seq,
                    job,
                });
            }
        }
        drop(inner);
        self.notify.notify_waiters();
        Some(id)
    }

    /// Pull the next ready job; `None` once the queue is closed and drained
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            let wait_hint = {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                self.promote_due(&mut inner);

                if let Some(entry) = inner.ready.pop() {
                    return Some(entry.job);
                }
                if inner.closed && inner.delayed.is_empty() {
                    return None;
                }
                inner
                    .delayed
                    .iter()
                    .map(|(at, _)| at.saturating_duration_since(Instant::now()))
                    .min()
            };

            // Bounded waits cover wake-ups lost between the lock release and
            // the notified() registration
            let hint = wait_hint.unwrap_or(Duration::from_millis(50));
            let _ = tokio::time::timeout(hint.clamp(Duration::from_millis(1), Duration::from_millis(50)), self.notify.notified()).await;
        }
    }

    fn promote_due(&self, inner: &mut Inner) {
        let now = Instant::now();
        let mut index = 0;
        while index < inner.delayed.len() {
            if inner.delayed[index].0 <= now {
                let (_, job) = inner.delayed.swap_remove(index);
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.ready.push(HeapEntry {
                    priority: job.priority,
                    seq,
                    job,
                });
            } else {
                index += 1;
            }
        }
    }

    /// Report a worker outcome for a dequeued job
    pub fn settle(&self, mut job: Job, outcome: JobOutcome) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            JobOutcome::Done => {
                inner.outstanding = inner.outstanding.saturating_sub(1);
            }
            JobOutcome::Retry(error) => {
                job.attempt += 1;
                if job.attempt >= job.max_attempts {
                    warn!(queue = self.kind.as_str(), job_id = job.id, %error, "attempts exhausted, dead-lettering");
                    inner.outstanding = inner.outstanding.saturating_sub(1);
                    inner.dead.push(DeadJob { job, last_error: error });
                } else {
                    let backoff = Duration::from_millis(
                        (self.retry.backoff_base_ms as f64
                            * self.retry.backoff_multiplier.powi(job.attempt as i32 - 1)) as u64,
                    );
                    debug!(queue = self.kind.as_str(), job_id = job.id, attempt = job.attempt, backoff_ms = backoff.as_millis() as u64, "requeueing with backoff");
                    inner.delayed.push((Instant::now() + backoff, job));
                }
            }
            JobOutcome::Fatal(error) => {
                warn!(queue = self.kind.as_str(), job_id = job.id, %error, "fatal failure, dead-lettering");
                inner.outstanding = inner.outstanding.saturating_sub(1);
                inner.dead.push(DeadJob { job, last_error: error });
            }
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Wait until every enqueued job has settled
    pub async fn wait_idle(&self) {
        loop {
            {
                let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if inner.outstanding == 0 {
                    return;
                }
            }
            let _ = tokio::time::timeout(Duration::from_millis(20), self.notify.notified()).await;
        }
    }

    /// Close the queue; dequeue returns None once drained
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Jobs that exhausted their attempts, with their last errors
    pub fn dead_letters(&self) -> Vec<DeadJob> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.dead.clone()
    }

    /// Outstanding (queued or in-flight) job count
    pub fn outstanding(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> JobQueue {
        JobQueue::new(
            QueueKind::ExecuteRun,
            QueueRetryConfig {
                backoff_base_ms: 1,
                backoff_multiplier: 2.0,
            },
        )
    }

    #[tokio::test]
    async fn test_priority_then_fifo_ordering() {
        let q = queue();
        q.enqueue(serde_json::json!({"n": 1}), EnqueueOptions::default());
        q.enqueue(serde_json::json!({"n": 2}), EnqueueOptions::default());
        q.enqueue(
            serde_json::json!({"n": 3}),
            EnqueueOptions {
                priority: Priority::High,
                ..Default::default()
            },
        );

        assert_eq!(q.dequeue().await.unwrap().payload["n"], 3);
        assert_eq!(q.dequeue().await.unwrap().payload["n"], 1);
        assert_eq!(q.dequeue().await.unwrap().payload["n"], 2);
    }

    #[tokio::test]
    async fn test_dedup_key_rejects_duplicates() {
        let q = queue();
        let options = EnqueueOptions {
            dedup_key: Some("k1".to_string()),
            ..Default::default()
        };
        assert!(q.enqueue(serde_json::json!({}), options.clone()).is_some());
        assert!(q.enqueue(serde_json::json!({}), options).is_none());
        assert_eq!(q.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        let q = queue();
        q.enqueue(
            serde_json::json!({"x": 1}),
            EnqueueOptions {
                max_attempts: 2,
                ..Default::default()
            },
        );

        let job = q.dequeue().await.unwrap();
        q.settle(job, JobOutcome::Retry("transient 1".to_string()));
        assert!(q.dead_letters().is_empty());

        let job = q.dequeue().await.unwrap();
        assert_eq!(job.attempt, 1);
        q.settle(job, JobOutcome::Retry("transient 2".to_string()));

        let dead = q.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error, "transient 2");
        assert_eq!(dead[0].job.payload["x"], 1);
        assert_eq!(q.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_fatal_dead_letters_immediately() {
        let q = queue();
        q.enqueue(serde_json::json!({}), EnqueueOptions::default());
        let job = q.dequeue().await.unwrap();
        q.settle(job, JobOutcome::Fatal("bad payload".to_string()));
        assert_eq!(q.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_delayed_jobs_become_ready() {
        let q = queue();
        q.enqueue(
            serde_json::json!({"late": true}),
            EnqueueOptions {
                delay: Some(Duration::from_millis(20)),
                ..Default::default()
            },
        );
        let started = Instant::now();
        let job = q.dequeue().await.unwrap();
        assert!(job.payload["late"].as_bool().unwrap());
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let q = std::sync::Arc::new(queue());
        q.enqueue(serde_json::json!({}), EnqueueOptions::default());

        let worker = {
            let q = q.clone();
            tokio::spawn(async move {
                let job = q.dequeue().await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                q.settle(job, JobOutcome::Done);
            })
        };

        q.wait_idle().await;
        assert_eq!(q.outstanding(), 0);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_dequeue() {
        let q = queue();
        q.close();
        assert!(q.dequeue().await.is_none());
    }
}
