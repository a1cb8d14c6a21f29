//! Durable job queue interface and an in-memory backend.

use crate::{BackendError, BackendResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    /// Whether the job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Backend-tagged job reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    pub backend: String,
    pub job_id: String,
    pub queue: String,
    pub state: JobState,
    /// Time of the last state change.
    pub timestamp: DateTime<Utc>,
}

/// Persistence-backed delivery the broker may hand work to.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit a job to `queue`.
    async fn send(&self, queue: &str, payload: serde_json::Value) -> BackendResult<JobRef>;

    /// Current state of a job.
    async fn get_status(&self, job_id: &str) -> BackendResult<JobRef>;

    /// Cancel a job that has not started. Returns `false` if it already ran or is running.
    async fn cancel(&self, job_id: &str) -> BackendResult<bool>;
}

#[derive(Debug)]
struct Job {
    job: JobRef,
    payload: serde_json::Value,
    run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Queues {
    jobs: HashMap<String, Job>,
    order: HashMap<String, VecDeque<String>>,
}

/// In-memory job queue.
///
/// Workers pull with `claim` and report with `complete` / `fail`.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    inner: Mutex<Queues>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a job that becomes claimable at `run_at`.
    pub fn send_delayed(
        &self,
        queue: &str,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
    ) -> JobRef {
        self.insert(queue, payload, Some(run_at))
    }

    fn insert(&self, queue: &str, payload: serde_json::Value, run_at: Option<DateTime<Utc>>) -> JobRef {
        let job = JobRef {
            backend: "memory".to_string(),
            job_id: uuid::Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            state: if run_at.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            timestamp: Utc::now(),
        };

        let mut inner = self.inner.lock();
        inner
            .order
            .entry(queue.to_string())
            .or_default()
            .push_back(job.job_id.clone());
        inner.jobs.insert(
            job.job_id.clone(),
            Job {
                job: job.clone(),
                payload,
                run_at,
            },
        );
        job
    }

    /// Take the oldest runnable job from `queue`, marking it active.
    pub fn claim(&self, queue: &str, now: DateTime<Utc>) -> Option<(JobRef, serde_json::Value)> {
        let mut guard = self.inner.lock();
        let Queues { jobs, order } = &mut *guard;
        let pending = order.get_mut(queue)?;

        let position = pending.iter().position(|id| {
            jobs.get(id)
                .is_some_and(|j| j.run_at.map_or(true, |at| at <= now))
        })?;
        let id = pending.remove(position)?;
        let job = jobs.get_mut(&id)?;
        job.job.state = JobState::Active;
        job.job.timestamp = now;
        Some((job.job.clone(), job.payload.clone()))
    }

    /// Mark an active job as completed.
    pub fn complete(&self, job_id: &str) -> BackendResult<JobRef> {
        self.finish(job_id, JobState::Completed)
    }

    /// Mark an active job as failed.
    pub fn fail(&self, job_id: &str) -> BackendResult<JobRef> {
        self.finish(job_id, JobState::Failed)
    }

    fn finish(&self, job_id: &str, state: JobState) -> BackendResult<JobRef> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| BackendError::NotFound(job_id.to_string()))?;
        if job.job.state != JobState::Active {
            return Err(BackendError::Unavailable(format!(
                "job {} is {:?}, not active",
                job_id, job.job.state
            )));
        }
        job.job.state = state;
        job.job.timestamp = Utc::now();
        Ok(job.job.clone())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn send(&self, queue: &str, payload: serde_json::Value) -> BackendResult<JobRef> {
        Ok(self.insert(queue, payload, None))
    }

    async fn get_status(&self, job_id: &str) -> BackendResult<JobRef> {
        self.inner
            .lock()
            .jobs
            .get(job_id)
            .map(|j| j.job.clone())
            .ok_or_else(|| BackendError::NotFound(job_id.to_string()))
    }

    async fn cancel(&self, job_id: &str) -> BackendResult<bool> {
        let mut guard = self.inner.lock();
        let Queues { jobs, order } = &mut *guard;
        let job = jobs
            .get(job_id)
            .ok_or_else(|| BackendError::NotFound(job_id.to_string()))?;

        if !matches!(job.job.state, JobState::Waiting | JobState::Delayed) {
            return Ok(false);
        }
        if let Some(pending) = order.get_mut(&job.job.queue) {
            pending.retain(|id| id != job_id);
        }
        jobs.remove(job_id);
        Ok(true)
    }
}
