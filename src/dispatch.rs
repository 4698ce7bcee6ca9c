//! Asynchronous job dispatch for mastery and engagement updates.
//!
//! Each job kind has its own queue, worker pool and retry policy, so a backlog
//! on one never delays the other. Within a queue at most one job per student
//! runs at a time; jobs for different students run in parallel up to the
//! configured worker count.
//!
//! Job lifecycle: `Accepted -> Processing -> Completed | Failed`. Transient
//! store failures are retried with exponential backoff until the policy's
//! attempt ceiling, after which the job is failed and logged at error level.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, OwnedMutexGuard, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::config::{DispatchConfig, RetryPolicy};
use crate::context::EngineContext;
use crate::error::{DispatchError, StoreError};
use crate::hybrid::Estimate;
use crate::models::{EngagementPayload, Observation, ResponsePayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Mastery,
    Engagement,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Mastery => f.write_str("mastery"),
            JobKind::Engagement => f.write_str("engagement"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Accepted,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Accepted => f.write_str("accepted"),
            JobState::Processing => f.write_str("processing"),
            JobState::Completed => f.write_str("completed"),
            JobState::Failed => f.write_str("failed"),
        }
    }
}

/// Opaque handle returned at intake and used for polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(pub Uuid);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Client-visible job status. `error` never carries internal detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobHandle,
    pub kind: JobKind,
    pub student_id: Uuid,
    pub state: JobState,
    /// Attempts started so far, including the first.
    pub attempts: u32,
    pub score: Option<f64>,
    /// The score is the estimator's fallback value rather than a real estimate.
    pub degraded: bool,
    pub error: Option<String>,
}

/// Counters per queue for monitoring.
#[derive(Debug, Default)]
pub struct QueueStats {
    accepted: AtomicU64,
    retried: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueCounts {
    pub accepted: u64,
    pub retried: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            accepted: self.accepted.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
enum Work {
    Mastery(Observation),
    Engagement {
        score: f64,
        occurred_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct Job {
    handle: JobHandle,
    student_id: Uuid,
    work: Work,
}

/// Steps already done by earlier attempts, so a retry never writes twice.
#[derive(Default)]
struct Progress {
    estimate: Option<Estimate>,
    recorded: bool,
}

struct JobOutcome {
    score: f64,
    degraded: bool,
}

#[derive(Default)]
struct Registry {
    jobs: Mutex<HashMap<JobHandle, watch::Sender<JobStatus>>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<JobHandle, watch::Sender<JobStatus>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, status: JobStatus) {
        let (tx, _) = watch::channel(status.clone());
        self.lock().insert(status.job_id, tx);
    }

    fn update(&self, handle: JobHandle, f: impl FnOnce(&mut JobStatus)) {
        if let Some(tx) = self.lock().get(&handle) {
            tx.send_modify(f);
        }
    }

    fn get(&self, handle: JobHandle) -> Option<JobStatus> {
        self.lock().get(&handle).map(|tx| tx.borrow().clone())
    }

    fn subscribe(&self, handle: JobHandle) -> Option<watch::Receiver<JobStatus>> {
        self.lock().get(&handle).map(|tx| tx.subscribe())
    }
}

/// One async mutex per student, created on demand and dropped when idle.
#[derive(Default)]
struct StudentLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl StudentLocks {
    async fn acquire(&self, student_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(student_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn release(&self, student_id: Uuid, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&student_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&student_id);
        }
    }
}

struct Queue {
    kind: JobKind,
    policy: RetryPolicy,
    workers: usize,
    stats: Arc<QueueStats>,
}

/// Front door for asynchronous updates. Must be started inside a tokio runtime.
pub struct Dispatcher {
    registry: Arc<Registry>,
    senders: Mutex<Option<(mpsc::UnboundedSender<Job>, mpsc::UnboundedSender<Job>)>>,
    loops: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    mastery_stats: Arc<QueueStats>,
    engagement_stats: Arc<QueueStats>,
}

impl Dispatcher {
    /// Spawns both queue loops and returns the dispatcher.
    pub fn start(ctx: Arc<EngineContext>, config: &DispatchConfig) -> Self {
        let registry = Arc::new(Registry::default());
        let mastery_stats = Arc::new(QueueStats::default());
        let engagement_stats = Arc::new(QueueStats::default());

        let (mastery_tx, mastery_rx) = mpsc::unbounded_channel();
        let (engagement_tx, engagement_rx) = mpsc::unbounded_channel();

        let mastery = Queue {
            kind: JobKind::Mastery,
            policy: config.mastery.clone(),
            workers: config.workers.max(1),
            stats: mastery_stats.clone(),
        };
        let engagement = Queue {
            kind: JobKind::Engagement,
            policy: config.engagement.clone(),
            workers: config.workers.max(1),
            stats: engagement_stats.clone(),
        };

        let loops = vec![
            tokio::spawn(run_queue(mastery, mastery_rx, ctx.clone(), registry.clone())),
            tokio::spawn(run_queue(engagement, engagement_rx, ctx, registry.clone())),
        ];

        tracing::info!(workers = config.workers, "dispatcher started");

        Self {
            registry,
            senders: Mutex::new(Some((mastery_tx, engagement_tx))),
            loops: tokio::sync::Mutex::new(loops),
            mastery_stats,
            engagement_stats,
        }
    }

    /// Validates `payload` for `kind` and enqueues it. Malformed payloads are
    /// rejected here and never reach a worker.
    pub fn enqueue(
        &self,
        kind: JobKind,
        student_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<JobHandle, DispatchError> {
        match kind {
            JobKind::Mastery => {
                let payload: ResponsePayload = serde_json::from_value(payload)
                    .map_err(|e| DispatchError::InvalidPayload(e.to_string()))?;
                self.submit_response(student_id, payload)
            }
            JobKind::Engagement => {
                let payload: EngagementPayload = serde_json::from_value(payload)
                    .map_err(|e| DispatchError::InvalidPayload(e.to_string()))?;
                self.submit_engagement(student_id, payload.score)
            }
        }
    }

    pub fn submit_response(
        &self,
        student_id: Uuid,
        payload: ResponsePayload,
    ) -> Result<JobHandle, DispatchError> {
        if let Some(seconds) = payload.response_time {
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(DispatchError::InvalidPayload(format!(
                    "response time {seconds} must be a non-negative number of seconds"
                )));
            }
        }
        let observation = payload.into_observation(student_id);
        self.push(JobKind::Mastery, student_id, Work::Mastery(observation))
    }

    pub fn submit_engagement(
        &self,
        student_id: Uuid,
        score: f64,
    ) -> Result<JobHandle, DispatchError> {
        if !score.is_finite() || !(0.0..=100.0).contains(&score) {
            return Err(DispatchError::InvalidPayload(format!(
                "engagement score {score} outside [0, 100]"
            )));
        }
        let work = Work::Engagement {
            score,
            occurred_at: Utc::now(),
        };
        self.push(JobKind::Engagement, student_id, work)
    }

    fn push(
        &self,
        kind: JobKind,
        student_id: Uuid,
        work: Work,
    ) -> Result<JobHandle, DispatchError> {
        let senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        let Some((mastery_tx, engagement_tx)) = senders.as_ref() else {
            return Err(DispatchError::Closed);
        };
        let (tx, stats) = match kind {
            JobKind::Mastery => (mastery_tx, &self.mastery_stats),
            JobKind::Engagement => (engagement_tx, &self.engagement_stats),
        };

        let handle = JobHandle(Uuid::new_v4());
        self.registry.insert(JobStatus {
            job_id: handle,
            kind,
            student_id,
            state: JobState::Accepted,
            attempts: 0,
            score: None,
            degraded: false,
            error: None,
        });

        let job = Job {
            handle,
            student_id,
            work,
        };
        if tx.send(job).is_err() {
            self.registry.lock().remove(&handle);
            return Err(DispatchError::Closed);
        }
        stats.accepted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(job_id = %handle, %kind, %student_id, "job accepted");
        Ok(handle)
    }

    /// Current status of a job, or `None` for an unknown handle.
    pub fn poll(&self, handle: JobHandle) -> Option<JobStatus> {
        self.registry.get(handle)
    }

    /// Receiver that observes every status change of a job.
    pub fn subscribe(&self, handle: JobHandle) -> Option<watch::Receiver<JobStatus>> {
        self.registry.subscribe(handle)
    }

    /// Waits until the job reaches a terminal state.
    pub async fn wait(&self, handle: JobHandle) -> Option<JobStatus> {
        let mut rx = self.registry.subscribe(handle)?;
        let status = rx.wait_for(|status| status.state.is_terminal()).await.ok()?;
        Some(JobStatus::clone(&status))
    }

    /// Drops terminal jobs from the registry. Returns how many were removed.
    pub fn prune_finished(&self) -> usize {
        let mut jobs = self.registry.lock();
        let before = jobs.len();
        jobs.retain(|_, tx| !tx.borrow().state.is_terminal());
        before - jobs.len()
    }

    pub fn stats(&self, kind: JobKind) -> QueueCounts {
        match kind {
            JobKind::Mastery => self.mastery_stats.counts(),
            JobKind::Engagement => self.engagement_stats.counts(),
        }
    }

    /// Stops intake and waits for queued and in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let mut loops = self.loops.lock().await;
        for handle in loops.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!("queue loop panicked: {e}");
            }
        }
        tracing::info!("dispatcher stopped");
    }
}

async fn run_queue(
    queue: Queue,
    mut rx: mpsc::UnboundedReceiver<Job>,
    ctx: Arc<EngineContext>,
    registry: Arc<Registry>,
) {
    let queue = Arc::new(queue);
    let semaphore = Arc::new(Semaphore::new(queue.workers));
    let locks = Arc::new(StudentLocks::default());
    let mut tasks = JoinSet::new();

    while let Some(job) = rx.recv().await {
        let worker_queue = queue.clone();
        let semaphore = semaphore.clone();
        let ctx = ctx.clone();
        let registry = registry.clone();
        let locks = locks.clone();

        // the student lock is taken before a worker slot, so jobs queued
        // behind a busy student never hold slots other students need
        tasks.spawn(async move {
            let student_id = job.student_id;
            let guard = locks.acquire(student_id).await;
            let Ok(_permit) = semaphore.acquire_owned().await else {
                locks.release(student_id, guard);
                return;
            };
            run_job(&worker_queue, &ctx, &registry, job).await;
            locks.release(student_id, guard);
        });

        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                tracing::error!(kind = %queue.kind, "worker panicked: {e}");
            }
        }
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(kind = %queue.kind, "worker panicked: {e}");
        }
    }
}

async fn run_job(queue: &Queue, ctx: &EngineContext, registry: &Registry, job: Job) {
    let mut progress = Progress::default();
    let mut attempt = 0u32;
    let max_attempts = queue.policy.max_attempts.max(1);

    loop {
        attempt += 1;
        registry.update(job.handle, |status| {
            status.state = JobState::Processing;
            status.attempts = attempt;
        });

        match execute(ctx, &job, &mut progress).await {
            Ok(outcome) => {
                registry.update(job.handle, |status| {
                    status.state = JobState::Completed;
                    status.score = Some(outcome.score);
                    status.degraded = outcome.degraded;
                });
                queue.stats.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    job_id = %job.handle,
                    kind = %queue.kind,
                    student_id = %job.student_id,
                    attempt,
                    score = outcome.score,
                    "job completed"
                );
                return;
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = queue.policy.backoff(attempt);
                queue.stats.retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    job_id = %job.handle,
                    kind = %queue.kind,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    "job attempt failed, retrying: {e}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                registry.update(job.handle, |status| {
                    status.state = JobState::Failed;
                    status.error = Some(format!("{} update failed", queue.kind));
                });
                queue.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    job_id = %job.handle,
                    kind = %queue.kind,
                    student_id = %job.student_id,
                    attempts = attempt,
                    "job failed permanently: {e}"
                );
                return;
            }
        }
    }
}

async fn execute(
    ctx: &EngineContext,
    job: &Job,
    progress: &mut Progress,
) -> Result<JobOutcome, StoreError> {
    let outcome = match &job.work {
        Work::Mastery(observation) => {
            let estimate = match progress.estimate.take() {
                Some(estimate) => estimate,
                None => ctx.estimate_response(observation).await?,
            };
            let outcome = JobOutcome {
                score: estimate.score(),
                degraded: estimate.is_degraded(),
            };
            progress.estimate = Some(estimate);

            if !progress.recorded {
                ctx.sink.record_mastery(observation, outcome.score).await?;
                progress.recorded = true;
            }
            outcome
        }
        Work::Engagement { score, occurred_at } => {
            if !progress.recorded {
                ctx.sink
                    .record_engagement(job.student_id, *score, *occurred_at)
                    .await?;
                progress.recorded = true;
            }
            JobOutcome {
                score: *score,
                degraded: false,
            }
        }
    };

    ctx.snapshots.refresh(job.student_id).await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hybrid::MasteryEngine;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            workers: 2,
            mastery: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 100,
                max_backoff_ms: 1_000,
            },
            engagement: RetryPolicy {
                max_attempts: 2,
                initial_backoff_ms: 50,
                max_backoff_ms: 100,
            },
        }
    }

    fn setup() -> (Arc<MemoryStore>, Dispatcher) {
        let store = Arc::new(MemoryStore::new());
        let ctx = EngineContext::with_store(MasteryEngine::default(), store.clone(), 50);
        let dispatcher = Dispatcher::start(Arc::new(ctx), &fast_config());
        (store, dispatcher)
    }

    #[tokio::test(start_paused = true)]
    async fn completed_job_carries_score() {
        let (store, dispatcher) = setup();
        let student = store.add_student("Avery Lee", "avery@example.com", None);

        let payload = json!({ "correct": true, "response_time": 12.5 });
        let handle = dispatcher.enqueue(JobKind::Mastery, student, payload).unwrap();
        assert_eq!(dispatcher.poll(handle).unwrap().state, JobState::Accepted);

        let status = dispatcher.wait(handle).await.unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.attempts, 1);
        assert!(!status.degraded);
        let score = status.score.unwrap();
        assert!((0.0..=100.0).contains(&score));
        assert_eq!(store.observation_count(student), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_is_rejected_at_intake() {
        let (_store, dispatcher) = setup();
        let result = dispatcher.enqueue(JobKind::Mastery, Uuid::new_v4(), json!({ "foo": 1 }));
        assert!(matches!(result, Err(DispatchError::InvalidPayload(_))));

        let payload = json!({ "score": 140 });
        let result = dispatcher.enqueue(JobKind::Engagement, Uuid::new_v4(), payload);
        assert!(matches!(result, Err(DispatchError::InvalidPayload(_))));
        assert_eq!(dispatcher.stats(JobKind::Mastery).accepted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_or_non_finite_response_time_is_rejected_at_intake() {
        let (store, dispatcher) = setup();
        let student = store.add_student("Avery Lee", "avery@example.com", None);

        let payload = json!({ "correct": true, "response_time": -30.0 });
        let result = dispatcher.enqueue(JobKind::Mastery, student, payload);
        assert!(matches!(result, Err(DispatchError::InvalidPayload(_))));

        let payload = ResponsePayload {
            concept_id: None,
            correct: true,
            response_time: Some(f64::NAN),
            occurred_at: None,
        };
        let result = dispatcher.submit_response(student, payload);
        assert!(matches!(result, Err(DispatchError::InvalidPayload(_))));

        assert_eq!(dispatcher.stats(JobKind::Mastery).accepted, 0);
        assert_eq!(store.observation_count(student), 0);

        let handle = dispatcher
            .enqueue(JobKind::Mastery, student, json!({ "correct": true, "response_time": 0.0 }))
            .unwrap();
        assert_eq!(dispatcher.wait(handle).await.unwrap().state, JobState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_without_double_write() {
        let (store, dispatcher) = setup();
        let student = store.add_student("Jules Moreno", "jules@example.com", None);
        store.fail_next_writes(1);

        let handle = dispatcher.submit_engagement(student, 64.0).unwrap();
        let status = dispatcher.wait(handle).await.unwrap();

        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.attempts, 2);
        assert_eq!(status.score, Some(64.0));
        assert_eq!(store.sink_calls(), 2);
        assert_eq!(dispatcher.stats(JobKind::Engagement).retried, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_student_fails_without_retry() {
        let (_store, dispatcher) = setup();
        let handle = dispatcher
            .enqueue(JobKind::Mastery, Uuid::new_v4(), json!({ "correct": false }))
            .unwrap();
        let status = dispatcher.wait(handle).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.attempts, 1);
        assert_eq!(status.error.as_deref(), Some("mastery update failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_intake() {
        let (store, dispatcher) = setup();
        let student = store.add_student("Kiara Patel", "kiara@example.com", None);
        let handle = dispatcher.submit_engagement(student, 50.0).unwrap();
        dispatcher.shutdown().await;

        assert_eq!(dispatcher.poll(handle).unwrap().state, JobState::Completed);
        let result = dispatcher.submit_engagement(student, 50.0);
        assert!(matches!(result, Err(DispatchError::Closed)));
        assert_eq!(dispatcher.prune_finished(), 1);
        assert!(dispatcher.poll(handle).is_none());
    }

    #[tokio::test]
    async fn student_locks_are_released_when_idle() {
        let locks = StudentLocks::default();
        let student = Uuid::new_v4();
        let guard = locks.acquire(student).await;
        locks.release(student, guard);
        assert!(locks.locks.lock().unwrap().is_empty());
    }
}
