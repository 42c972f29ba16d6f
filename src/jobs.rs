use crate::{error::AppError, marketplace::MarketplaceError, metrics, models::Marketplace};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum JobKind {
    SyncMarketplace {
        user_id: Option<String>,
    },
    PublishListing {
        listing_id: String,
        marketplace: Marketplace,
        user_id: String,
    },
    UpdateListing {
        listing_id: String,
        marketplace: Marketplace,
        user_id: String,
    },
    CleanupExpired,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::SyncMarketplace { .. } => "sync_marketplace",
            JobKind::PublishListing { .. } => "publish_listing",
            JobKind::UpdateListing { .. } => "update_listing",
            JobKind::CleanupExpired => "cleanup_expired",
        }
    }
}

/// Lower value runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    #[allow(dead_code)]
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Delayed { error: String },
    Completed { result: Value },
    Failed { error: String, attempts: u32 },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub job: JobKind,
    pub priority: Priority,
    pub attempts: u32,
    #[serde(flatten)]
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub owner: Option<String>,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct JobFailed(pub String);

impl From<AppError> for JobFailed {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Internal(detail) => JobFailed(detail),
            other => JobFailed(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for JobFailed {
    fn from(err: sqlx::Error) -> Self {
        JobFailed(err.to_string())
    }
}

impl From<MarketplaceError> for JobFailed {
    fn from(err: MarketplaceError) -> Self {
        JobFailed(err.to_string())
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobKind) -> Result<Value, JobFailed>;
}

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Duration,
    pub keep_completed: usize,
    pub keep_failed: usize,
    pub capacity: usize,
    pub concurrency: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
            keep_completed: 100,
            keep_failed: 500,
            capacity: 256,
            concurrency: 3,
        }
    }
}

impl JobOptions {
    /// Exponential: `backoff * 2^(attempt - 1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

#[derive(Debug)]
struct Pending {
    id: Uuid,
    priority: Priority,
    seq: u64,
    kind: JobKind,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // BinaryHeap pops the max; invert so the lowest (priority, seq) comes out first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Pending>,
    records: HashMap<Uuid, JobInfo>,
    completed: VecDeque<Uuid>,
    failed: VecDeque<Uuid>,
    next_seq: u64,
    delayed: usize,
    closed: bool,
}

impl Inner {
    fn push(&mut self, id: Uuid, priority: Priority, kind: JobKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Pending {
            id,
            priority,
            seq,
            kind,
        });
    }

    fn retain_finished(&mut self, options: &JobOptions) {
        while self.completed.len() > options.keep_completed {
            if let Some(old) = self.completed.pop_front() {
                self.records.remove(&old);
            }
        }
        while self.failed.len() > options.keep_failed {
            if let Some(old) = self.failed.pop_front() {
                self.records.remove(&old);
            }
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    handler: Arc<dyn JobHandler>,
    options: JobOptions,
}

#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl JobQueue {
    pub fn spawn(handler: Arc<dyn JobHandler>, options: JobOptions) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            handler,
            options,
        });
        let workers = (0..options.concurrency.max(1))
            .map(|worker| tokio::spawn(worker_loop(shared.clone(), worker)))
            .collect();
        info!(
            target = "syncsellr.jobs",
            concurrency = options.concurrency.max(1),
            capacity = options.capacity,
            "job queue started"
        );
        Self {
            shared,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    pub async fn enqueue(
        &self,
        kind: JobKind,
        priority: Priority,
        owner: Option<String>,
    ) -> Result<Uuid, AppError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.closed {
            return Err(AppError::Unavailable("Job queue is shutting down".into()));
        }
        if inner.heap.len() >= self.shared.options.capacity {
            return Err(AppError::Unavailable("Job queue is full".into()));
        }
        let id = Uuid::new_v4();
        inner.records.insert(
            id,
            JobInfo {
                id: id.to_string(),
                job: kind.clone(),
                priority,
                attempts: 0,
                state: JobState::Queued,
                created_at: Utc::now(),
                finished_at: None,
                owner,
            },
        );
        inner.push(id, priority, kind);
        drop(inner);
        self.shared.notify.notify_one();
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        self.shared.inner.lock().await.records.get(&id).cloned()
    }

    /// Stops intake and waits for workers to drain the queue.
    pub async fn close(&self) {
        self.shared.inner.lock().await.closed = true;
        self.shared.notify.notify_waiters();
        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(target = "syncsellr.jobs", error = %err, "job worker ended abnormally");
            }
        }
        info!(target = "syncsellr.jobs", "job queue closed");
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = {
            let mut inner = shared.inner.lock().await;
            match inner.heap.pop() {
                Some(job) => {
                    if let Some(record) = inner.records.get_mut(&job.id) {
                        record.state = JobState::Running;
                        record.attempts += 1;
                    }
                    Some(job)
                }
                None if inner.closed && inner.delayed == 0 => {
                    drop(inner);
                    // Idle peers would otherwise keep waiting for a retry that already ran.
                    shared.notify.notify_waiters();
                    return;
                }
                None => None,
            }
        };

        match next {
            Some(job) => run_job(&shared, worker, job).await,
            None => notified.await,
        }
    }
}

async fn run_job(shared: &Arc<Shared>, worker: usize, job: Pending) {
    let started = Instant::now();
    let outcome = shared.handler.handle(&job.kind).await;
    let elapsed = started.elapsed().as_millis();
    let options = shared.options;

    let mut inner = shared.inner.lock().await;
    let attempts = inner
        .records
        .get(&job.id)
        .map(|record| record.attempts)
        .unwrap_or(1);

    match outcome {
        Ok(result) => {
            if let Some(record) = inner.records.get_mut(&job.id) {
                record.state = JobState::Completed { result };
                record.finished_at = Some(Utc::now());
            }
            inner.completed.push_back(job.id);
            inner.retain_finished(&options);
            info!(
                target = "syncsellr.jobs",
                worker,
                job_id = %job.id,
                kind = job.kind.name(),
                attempts,
                elapsed_ms = elapsed as u64,
                "job completed"
            );
            metrics::job_finished(job.kind.name(), "completed", elapsed);
        }
        Err(err) if attempts < options.attempts => {
            let delay = options.delay_after(attempts);
            if let Some(record) = inner.records.get_mut(&job.id) {
                record.state = JobState::Delayed {
                    error: err.to_string(),
                };
            }
            inner.delayed += 1;
            warn!(
                target = "syncsellr.jobs",
                worker,
                job_id = %job.id,
                kind = job.kind.name(),
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "job failed; retrying"
            );
            drop(inner);
            let kind = job.kind.name();
            let shared = shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut inner = shared.inner.lock().await;
                inner.delayed -= 1;
                let draining = inner.closed && inner.delayed == 0;
                if let Some(record) = inner.records.get_mut(&job.id) {
                    record.state = JobState::Queued;
                }
                inner.push(job.id, job.priority, job.kind);
                drop(inner);
                if draining {
                    shared.notify.notify_waiters();
                } else {
                    shared.notify.notify_one();
                }
            });
            metrics::job_finished(kind, "retrying", elapsed);
        }
        Err(err) => {
            if let Some(record) = inner.records.get_mut(&job.id) {
                record.state = JobState::Failed {
                    error: err.to_string(),
                    attempts,
                };
                record.finished_at = Some(Utc::now());
            }
            inner.failed.push_back(job.id);
            inner.retain_finished(&options);
            warn!(
                target = "syncsellr.jobs",
                worker,
                job_id = %job.id,
                kind = job.kind.name(),
                attempts,
                error = %err,
                "job failed permanently"
            );
            metrics::job_finished(job.kind.name(), "failed", elapsed);
        }
    }
}

/// Enqueues `kind` every `every`, skipping the immediate first tick.
pub fn schedule(queue: JobQueue, kind: JobKind, priority: Priority, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = queue.enqueue(kind.clone(), priority, None).await {
                warn!(target = "syncsellr.jobs", kind = kind.name(), error = %err, "scheduled enqueue failed");
                if matches!(err, AppError::Unavailable(ref msg) if msg.contains("shutting down")) {
                    return;
                }
            }
        }
    })
}
