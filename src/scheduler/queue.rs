use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{BatchError, Result};
use crate::scheduler::job::{clamp_progress, ExecutorKind, JobConfig, JobRecord, JobStatus};

/// Point-in-time counts taken under one lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub total: usize,
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub capacity: usize,
}

impl QueueStatistics {
    /// Jobs that reached `Completed`, `Failed` or `Skipped`.
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressSummary {
    /// Unweighted mean of every job's progress, floored.
    pub percentage: u8,
    pub completed: usize,
    pub total: usize,
    pub active: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: Vec<JobRecord>,
    index: HashMap<Uuid, usize>,
    completed: Vec<Uuid>,
    failed: Vec<Uuid>,
}

impl QueueState {
    fn running(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    fn job_mut(&mut self, id: &Uuid) -> Result<&mut JobRecord> {
        let idx = *self.index.get(id).ok_or(BatchError::JobNotFound(*id))?;
        Ok(&mut self.jobs[idx])
    }

    /// Validate and apply a status change, stamping timestamps and history.
    fn transition(
        &mut self,
        id: &Uuid,
        to: JobStatus,
        apply: impl FnOnce(&mut JobRecord),
    ) -> Result<JobRecord> {
        let job = self.job_mut(id)?;
        if job.status.is_terminal() {
            return Err(BatchError::JobAlreadyTerminal {
                id: *id,
                status: job.status,
            });
        }
        if !job.status.can_transition_to(to) {
            return Err(BatchError::InvalidTransition {
                id: *id,
                from: job.status,
                to,
            });
        }

        let now = Utc::now();
        job.status = to;
        if to == JobStatus::Running {
            job.started_at = Some(now);
        } else {
            job.completed_at = Some(now);
        }
        apply(job);
        let snapshot = job.clone();

        match to {
            JobStatus::Completed => self.completed.push(*id),
            JobStatus::Failed => self.failed.push(*id),
            _ => {}
        }
        Ok(snapshot)
    }

    fn lookup(&self, ids: &[Uuid]) -> Vec<JobRecord> {
        ids.iter()
            .filter_map(|id| self.index.get(id).map(|&idx| self.jobs[idx].clone()))
            .collect()
    }
}

fn set_message(job: &mut JobRecord, message: &str) {
    if !message.is_empty() {
        job.message = message.to_string();
    }
}

/// Thread-safe, insertion-ordered collection of jobs.
///
/// The queue is the only owner of [`JobRecord`]s; every read and write goes
/// through one mutex so aggregate snapshots never mix stale counters. Callers
/// receive clones. The lock is never held across `.await` or while an
/// executor runs.
#[derive(Debug)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    arrivals: Notify,
}

impl JobQueue {
    /// Create a queue allowing at most `max_parallel_jobs` jobs in `Running`.
    /// A capacity of zero is raised to one.
    pub fn new(max_parallel_jobs: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity: max_parallel_jobs.max(1),
            arrivals: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock leaves the data structurally intact.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a job for `source`. Fails if `source` does not exist.
    pub fn add(
        &self,
        source: impl AsRef<Path>,
        kind: ExecutorKind,
        config: JobConfig,
    ) -> Result<JobRecord> {
        let source = source.as_ref();
        if !source.exists() {
            return Err(BatchError::SourceNotFound(source.to_path_buf()));
        }

        let job = JobRecord::new(source, kind, config);
        {
            let mut state = self.lock();
            let idx = state.jobs.len();
            state.index.insert(job.id, idx);
            state.jobs.push(job.clone());
        }
        self.arrivals.notify_one();

        tracing::debug!(job_id = %job.id, source = %source.display(), kind = %kind, "Job added");
        Ok(job)
    }

    /// Add every source independently; invalid entries are logged and skipped.
    pub fn add_multiple<P: AsRef<Path>>(
        &self,
        sources: impl IntoIterator<Item = P>,
        kind: ExecutorKind,
        config: &JobConfig,
    ) -> Vec<JobRecord> {
        sources
            .into_iter()
            .filter_map(|source| match self.add(source, kind, config.clone()) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping batch entry");
                    None
                }
            })
            .collect()
    }

    /// Earliest-inserted pending job, but only while `Running` is below capacity.
    pub fn next_dispatchable(&self) -> Option<JobRecord> {
        let state = self.lock();
        if state.running() >= self.capacity {
            return None;
        }
        state
            .jobs
            .iter()
            .find(|j| j.status == JobStatus::Pending)
            .cloned()
    }

    /// [`next_dispatchable`](Self::next_dispatchable) and
    /// [`mark_started`](Self::mark_started) under a single lock acquisition.
    pub fn dispatch_next(&self) -> Option<JobRecord> {
        let mut state = self.lock();
        if state.running() >= self.capacity {
            return None;
        }
        let id = state
            .jobs
            .iter()
            .find(|j| j.status == JobStatus::Pending)
            .map(|j| j.id)?;
        state.transition(&id, JobStatus::Running, |_| {}).ok()
    }

    pub fn mark_started(&self, id: &Uuid) -> Result<JobRecord> {
        self.lock().transition(id, JobStatus::Running, |_| {})
    }

    /// Store a clamped progress value. Accepted for any non-terminal job.
    pub fn update_progress(&self, id: &Uuid, value: i64, message: &str) -> Result<JobRecord> {
        let mut state = self.lock();
        let job = state.job_mut(id)?;
        if job.status.is_terminal() {
            return Err(BatchError::JobAlreadyTerminal {
                id: *id,
                status: job.status,
            });
        }
        job.progress = clamp_progress(value);
        set_message(job, message);
        Ok(job.clone())
    }

    pub fn mark_completed(
        &self,
        id: &Uuid,
        output: Option<PathBuf>,
        message: &str,
    ) -> Result<JobRecord> {
        self.lock().transition(id, JobStatus::Completed, |job| {
            job.progress = 100;
            job.output = output;
            set_message(job, message);
        })
    }

    pub fn mark_failed(&self, id: &Uuid, message: &str) -> Result<JobRecord> {
        self.lock()
            .transition(id, JobStatus::Failed, |job| set_message(job, message))
    }

    pub fn mark_skipped(&self, id: &Uuid, reason: &str) -> Result<JobRecord> {
        self.lock()
            .transition(id, JobStatus::Skipped, |job| set_message(job, reason))
    }

    /// Move every still-pending job to `Skipped` atomically.
    pub fn skip_pending(&self, reason: &str) -> Vec<JobRecord> {
        let mut state = self.lock();
        let pending: Vec<Uuid> = state
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.id)
            .collect();
        pending
            .iter()
            .filter_map(|id| {
                state
                    .transition(id, JobStatus::Skipped, |job| set_message(job, reason))
                    .ok()
            })
            .collect()
    }

    pub fn get(&self, id: &Uuid) -> Option<JobRecord> {
        let state = self.lock();
        state.index.get(id).map(|&idx| state.jobs[idx].clone())
    }

    /// All jobs in insertion order.
    pub fn all_jobs(&self) -> Vec<JobRecord> {
        self.lock().jobs.clone()
    }

    pub fn pending_jobs(&self) -> Vec<JobRecord> {
        self.jobs_with_status(JobStatus::Pending)
    }

    pub fn active_jobs(&self) -> Vec<JobRecord> {
        self.jobs_with_status(JobStatus::Running)
    }

    fn jobs_with_status(&self, status: JobStatus) -> Vec<JobRecord> {
        self.lock()
            .jobs
            .iter()
            .filter(|j| j.status == status)
            .cloned()
            .collect()
    }

    /// Completed jobs retained since the last [`clear_history`](Self::clear_history).
    pub fn completed_history(&self) -> Vec<JobRecord> {
        let state = self.lock();
        state.lookup(&state.completed)
    }

    /// Failed jobs retained since the last [`clear_history`](Self::clear_history).
    pub fn failed_history(&self) -> Vec<JobRecord> {
        let state = self.lock();
        state.lookup(&state.failed)
    }

    /// Drop the completed/failed history lists. The jobs themselves stay.
    pub fn clear_history(&self) {
        let mut state = self.lock();
        state.completed.clear();
        state.failed.clear();
    }

    pub fn has_pending(&self) -> bool {
        self.lock()
            .jobs
            .iter()
            .any(|j| j.status == JobStatus::Pending)
    }

    pub fn statistics(&self) -> QueueStatistics {
        let state = self.lock();
        let mut stats = QueueStatistics {
            total: state.jobs.len(),
            capacity: self.capacity,
            ..QueueStatistics::default()
        };
        for job in &state.jobs {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Skipped => stats.skipped += 1,
            }
        }
        stats
    }

    pub fn progress_summary(&self) -> ProgressSummary {
        let state = self.lock();
        let total = state.jobs.len();
        if total == 0 {
            return ProgressSummary::default();
        }
        let sum: usize = state.jobs.iter().map(|j| j.progress as usize).sum();
        let mut summary = ProgressSummary {
            percentage: (sum / total) as u8,
            total,
            ..ProgressSummary::default()
        };
        for job in &state.jobs {
            match job.status {
                JobStatus::Completed => summary.completed += 1,
                JobStatus::Running => summary.active += 1,
                _ => {}
            }
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    /// Resolves after the next job is added (or immediately if one was added
    /// since the last wait).
    pub async fn job_added(&self) {
        self.arrivals.notified().await;
    }
}
