use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use uuid::Uuid;

use crate::events::{BatchEvent, EventBus};
use crate::scheduler::{JobConfig, JobQueue, JobRecord, JobStatus};

/// Message recorded when an executor reports failure without explaining why.
pub const GENERIC_FAILURE: &str = "Execution failed";

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExecutorResult = std::result::Result<bool, ExecutorError>;

/// The work performed for a single job.
///
/// Implementations are blocking and may take arbitrarily long. They are
/// invoked concurrently, once per active job, each with its own
/// [`JobContext`]. Returning `Ok(true)` means success, `Ok(false)` or `Err`
/// means failure; progress and the final outcome should be reported through
/// the context.
pub trait JobExecutor: Send + Sync + 'static {
    fn execute(&self, ctx: &JobContext) -> ExecutorResult;
}

impl<F> JobExecutor for F
where
    F: Fn(&JobContext) -> ExecutorResult + Send + Sync + 'static,
{
    fn execute(&self, ctx: &JobContext) -> ExecutorResult {
        self(ctx)
    }
}

/// Per-dispatch handle given to an executor: a snapshot of the job plus the
/// callbacks that feed progress and outcome back into the queue.
pub struct JobContext {
    job: JobRecord,
    queue: Arc<JobQueue>,
    events: EventBus,
    outcome_reported: AtomicBool,
    detached: Arc<Mutex<bool>>,
}

impl JobContext {
    fn new(job: JobRecord, queue: Arc<JobQueue>, events: EventBus) -> Self {
        Self {
            job,
            queue,
            events,
            outcome_reported: AtomicBool::new(false),
            detached: Arc::new(Mutex::new(false)),
        }
    }

    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    pub fn id(&self) -> Uuid {
        self.job.id
    }

    pub fn source(&self) -> &Path {
        &self.job.source
    }

    pub fn config(&self) -> &JobConfig {
        &self.job.config
    }

    /// Output used when a completion has to be synthesized.
    pub fn default_output(&self) -> Option<PathBuf> {
        self.job.configured_output()
    }

    pub fn has_reported_outcome(&self) -> bool {
        self.outcome_reported.load(Ordering::SeqCst)
    }

    /// Report progress; values outside `0..=100` are clamped by the queue.
    pub fn report_progress(&self, percent: i64, message: &str) {
        self.while_attached("progress", || {
            match self.queue.update_progress(&self.job.id, percent, message) {
                Ok(job) => {
                    self.events.emit(BatchEvent::JobProgress {
                        id: job.id,
                        percent: job.progress,
                        message: message.to_string(),
                    });
                    self.publish_stats();
                }
                Err(e) => {
                    tracing::warn!(job_id = %self.job.id, error = %e, "Ignoring progress update");
                }
            }
        });
    }

    /// Report success. Returns `false` if an outcome was already reported or
    /// the queue refused the transition.
    pub fn complete(&self, output: Option<PathBuf>) -> bool {
        if self.claim_outcome("completion") {
            return false;
        }
        self.while_attached("completion", || {
            match self.queue.mark_completed(&self.job.id, output, "") {
                Ok(job) => {
                    tracing::info!(job_id = %job.id, output = ?job.output, "Job completed");
                    self.events.emit(BatchEvent::JobCompleted {
                        id: job.id,
                        output: job.output,
                    });
                    self.publish_stats();
                    true
                }
                Err(e) => {
                    tracing::warn!(job_id = %self.job.id, error = %e, "Ignoring completion");
                    false
                }
            }
        })
        .unwrap_or(false)
    }

    /// Report failure. Same return contract as [`complete`](Self::complete).
    pub fn fail(&self, message: &str) -> bool {
        if self.claim_outcome("failure") {
            return false;
        }
        let message = if message.is_empty() {
            GENERIC_FAILURE
        } else {
            message
        };
        self.while_attached("failure", || {
            match self.queue.mark_failed(&self.job.id, message) {
                Ok(job) => {
                    tracing::warn!(job_id = %job.id, reason = message, "Job failed");
                    self.events.emit(BatchEvent::JobFailed {
                        id: job.id,
                        message: message.to_string(),
                    });
                    self.publish_stats();
                    true
                }
                Err(e) => {
                    tracing::warn!(job_id = %self.job.id, error = %e, "Ignoring failure report");
                    false
                }
            }
        })
        .unwrap_or(false)
    }

    /// Returns `true` if an outcome had already been claimed.
    fn claim_outcome(&self, what: &str) -> bool {
        let already = self.outcome_reported.swap(true, Ordering::SeqCst);
        if already {
            tracing::warn!(
                job_id = %self.job.id,
                callback = what,
                "Executor reported a second outcome, ignoring it"
            );
        }
        already
    }

    /// Run a callback unless the unit was detached. The detach lock is held for
    /// the whole callback, so once [`DetachHandle::detach`] returns no further
    /// state change or event comes from this context.
    fn while_attached<T>(&self, callback: &str, f: impl FnOnce() -> T) -> Option<T> {
        let detached = self.detached.lock().unwrap_or_else(PoisonError::into_inner);
        if *detached {
            tracing::warn!(
                job_id = %self.job.id,
                callback,
                "Ignoring callback from an abandoned execution unit"
            );
            return None;
        }
        Some(f())
    }

    fn publish_stats(&self) {
        self.events
            .emit_with(|| BatchEvent::QueueStatsUpdated(self.queue.statistics()));
    }
}

/// Cuts an abandoned [`ExecutionUnit`] off from its queue and event bus.
#[derive(Debug, Clone)]
pub struct DetachHandle {
    detached: Arc<Mutex<bool>>,
}

impl DetachHandle {
    /// Waits for any callback in flight, then silences the unit for good.
    pub fn detach(&self) {
        *self.detached.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

/// Runs one job through one executor invocation and guarantees the job ends
/// in a terminal state, whatever the executor does.
pub struct ExecutionUnit {
    ctx: JobContext,
    executor: Arc<dyn JobExecutor>,
}

impl ExecutionUnit {
    pub fn new(
        job: JobRecord,
        queue: Arc<JobQueue>,
        events: EventBus,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            ctx: JobContext::new(job, queue, events),
            executor,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.ctx.id()
    }

    pub fn detach_handle(&self) -> DetachHandle {
        DetachHandle {
            detached: self.ctx.detached.clone(),
        }
    }

    /// Execute on the calling thread. Blocks for the executor's full duration.
    ///
    /// Returns the job's status afterwards.
    pub fn run(self) -> Option<JobStatus> {
        let ctx = &self.ctx;
        tracing::info!(
            job_id = %ctx.id(),
            source = %ctx.source().display(),
            kind = %ctx.job().kind,
            "Executing job"
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.executor.execute(ctx)));

        match result {
            Ok(Ok(true)) => {
                if !ctx.has_reported_outcome() {
                    tracing::warn!(
                        job_id = %ctx.id(),
                        "Executor returned success without reporting completion, synthesizing it"
                    );
                    ctx.complete(ctx.default_output());
                }
            }
            Ok(Ok(false)) => {
                if !ctx.has_reported_outcome() {
                    ctx.fail(GENERIC_FAILURE);
                }
            }
            Ok(Err(e)) => {
                if ctx.has_reported_outcome() {
                    tracing::warn!(job_id = %ctx.id(), error = %e, "Executor errored after reporting an outcome");
                } else {
                    ctx.fail(&e.to_string());
                }
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                tracing::error!(job_id = %ctx.id(), panic = %reason, "Executor panicked");
                if !ctx.has_reported_outcome() {
                    ctx.fail(&format!("Executor panicked: {}", reason));
                }
            }
        }

        ctx.queue.get(&ctx.id()).map(|job| job.status)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
