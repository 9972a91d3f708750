use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{BatchError, Result};
use crate::events::{BatchEvent, EventBus};
use crate::scheduler::job::JobRecord;
use crate::scheduler::queue::{JobQueue, QueueStatistics};
use crate::worker::executor::{panic_message, DetachHandle, ExecutionUnit, JobExecutor};

/// Reason recorded on jobs that were still pending when a run was stopped.
pub const STOPPED_BEFORE_DISPATCH: &str = "Batch stopped before the job was dispatched";

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
    /// No new work will be dispatched; waiting on active units.
    Draining,
    Stopped,
}

/// Sends the unit's job id back to the control loop when the unit ends,
/// including when it unwinds.
struct CompletionGuard {
    id: Uuid,
    done_tx: mpsc::UnboundedSender<Uuid>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let _ = self.done_tx.send(self.id);
    }
}

/// A dispatched unit as seen by the control loop.
struct ActiveUnit {
    task: JoinHandle<()>,
    detach: DetachHandle,
}

/// Dispatches jobs from a [`JobQueue`] to execution units, never more than
/// the queue's capacity at a time, until the queue drains or the run is
/// stopped.
pub struct Scheduler {
    queue: Arc<JobQueue>,
    executor: Arc<dyn JobExecutor>,
    config: SchedulerConfig,
    events: EventBus,
    cancel: CancellationToken,
    state_tx: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        executor: Arc<dyn JobExecutor>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        Ok(Self {
            queue,
            executor,
            config,
            events: EventBus::new(),
            cancel: CancellationToken::new(),
            state_tx,
        })
    }

    /// Publish events on an existing bus instead of a private one.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BatchEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state_tx.borrow()
    }

    /// Effective parallelism: the tighter of the queue's and the config's limit.
    pub fn capacity(&self) -> usize {
        self.queue
            .capacity()
            .min(self.config.max_parallel_jobs.max(1))
    }

    /// Spawn the control loop onto the current tokio runtime.
    pub fn start(self) -> SchedulerHandle {
        let cancel = self.cancel.clone();
        let state = self.state_tx.subscribe();
        let task = tokio::spawn(self.run());
        SchedulerHandle {
            cancel,
            state,
            task,
        }
    }

    async fn run(self) -> QueueStatistics {
        let capacity = self.capacity();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Uuid>();
        // Owned by this task alone; never shared.
        let mut active: HashMap<Uuid, ActiveUnit> = HashMap::new();
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.set_state(SchedulerState::Running);
        tracing::info!(capacity, jobs = self.queue.len(), "Batch started");

        loop {
            while let Ok(id) = done_rx.try_recv() {
                self.reap(&mut active, id).await;
            }

            while !self.cancel.is_cancelled() && active.len() < capacity {
                let Some(job) = self.queue.dispatch_next() else {
                    break;
                };
                let id = job.id;
                tracing::info!(job_id = %id, source = %job.source.display(), "Job dispatched");
                self.events.emit(BatchEvent::JobStarted { id });
                active.insert(id, self.spawn_unit(job, done_tx.clone()));
            }

            self.events
                .emit_with(|| BatchEvent::QueueStatsUpdated(self.queue.statistics()));

            if self.cancel.is_cancelled() {
                break;
            }
            let has_pending = self.queue.has_pending();
            if active.is_empty() && !has_pending {
                break;
            }
            if !has_pending && self.state() == SchedulerState::Running {
                self.set_state(SchedulerState::Draining);
            }

            tokio::select! {
                Some(id) = done_rx.recv() => self.reap(&mut active, id).await,
                _ = self.queue.job_added() => {}
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => {}
            }
        }

        if self.cancel.is_cancelled() {
            self.shut_down(&mut active).await;
        }

        self.set_state(SchedulerState::Stopped);
        let stats = self.queue.statistics();
        tracing::info!(
            total = stats.total,
            completed = stats.completed,
            failed = stats.failed,
            skipped = stats.skipped,
            "Batch finished"
        );
        self.events.emit(BatchEvent::BatchFinished(stats));
        stats
    }

    fn spawn_unit(&self, job: JobRecord, done_tx: mpsc::UnboundedSender<Uuid>) -> ActiveUnit {
        let guard = CompletionGuard { id: job.id, done_tx };
        let unit = ExecutionUnit::new(
            job,
            self.queue.clone(),
            self.events.clone(),
            self.executor.clone(),
        );
        let detach = unit.detach_handle();
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            unit.run();
        });
        ActiveUnit { task, detach }
    }

    async fn reap(&self, active: &mut HashMap<Uuid, ActiveUnit>, id: Uuid) {
        let Some(unit) = active.remove(&id) else {
            return;
        };
        if let Err(e) = unit.task.await {
            self.unit_crashed(id, e);
        }
    }

    fn unit_crashed(&self, id: Uuid, err: JoinError) {
        let reason = if err.is_panic() {
            panic_message(err.into_panic().as_ref())
        } else {
            err.to_string()
        };
        tracing::error!(job_id = %id, error = %reason, "Execution unit crashed");
        self.fail_job(&id, &format!("Execution unit crashed: {}", reason));
    }

    fn fail_job(&self, id: &Uuid, message: &str) {
        if let Ok(job) = self.queue.mark_failed(id, message) {
            self.events.emit(BatchEvent::JobFailed {
                id: job.id,
                message: message.to_string(),
            });
        }
    }

    /// Skip undispatched work, then give active units until the shutdown
    /// deadline to finish. Units still running afterwards are abandoned.
    async fn shut_down(&self, active: &mut HashMap<Uuid, ActiveUnit>) {
        self.set_state(SchedulerState::Draining);

        for job in self.queue.skip_pending(STOPPED_BEFORE_DISPATCH) {
            tracing::info!(job_id = %job.id, "Job skipped");
            self.events.emit(BatchEvent::JobSkipped {
                id: job.id,
                reason: job.message,
            });
        }

        let timeout = self.config.shutdown_timeout();
        let deadline = Instant::now() + timeout;
        for (id, unit) in active.drain() {
            match tokio::time::timeout_at(deadline, unit.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.unit_crashed(id, e),
                Err(_) => {
                    // The blocking thread cannot be interrupted; it leaks until the executor
                    // returns. Once detached it can no longer touch the queue or emit.
                    unit.detach.detach();
                    let err = BatchError::ShutdownTimeout { id, timeout };
                    tracing::warn!(job_id = %id, error = %err, "Abandoning execution unit");
                    self.fail_job(&id, &err.to_string());
                }
            }
        }
    }

    fn set_state(&self, next: SchedulerState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            tracing::debug!(from = ?prev, to = ?next, "Scheduler state changed");
        }
    }
}

/// Handle to a running [`Scheduler`].
#[derive(Debug)]
pub struct SchedulerHandle {
    cancel: CancellationToken,
    state: watch::Receiver<SchedulerState>,
    task: JoinHandle<QueueStatistics>,
}

impl SchedulerHandle {
    /// Stop dispatching new jobs without waiting for the run to end.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end and return the final statistics.
    pub async fn wait(self) -> Result<QueueStatistics> {
        Ok(self.task.await?)
    }

    /// Stop dispatching, wait for active units (bounded by the shutdown
    /// timeout) and return the final statistics.
    pub async fn stop(self) -> Result<QueueStatistics> {
        tracing::info!("Stopping batch");
        self.cancel.cancel();
        self.wait().await
    }
}
