//! High-level entry point: queue files by engine name and run them as one batch.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{BatchError, Result};
use crate::events::{BatchEvent, EventBus};
use crate::scheduler::{
    ExecutorKind, JobConfig, JobQueue, QueueStatistics, Scheduler, SchedulerHandle,
};
use crate::worker::JobExecutor;

/// Owns a queue and at most one running scheduler over it.
pub struct BatchProcessor {
    config: SchedulerConfig,
    queue: Arc<JobQueue>,
    events: EventBus,
    handle: Option<SchedulerHandle>,
}

impl BatchProcessor {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            queue: Arc::new(JobQueue::new(config.max_parallel_jobs)),
            config,
            events: EventBus::new(),
            handle: None,
        })
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn statistics(&self) -> QueueStatistics {
        self.queue.statistics()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BatchEvent> {
        self.events.subscribe()
    }

    /// Queue every existing file for the engine named `kind`. Missing files are
    /// skipped; an unknown engine name rejects the whole call.
    pub fn add_files<P: AsRef<Path>>(
        &self,
        paths: impl IntoIterator<Item = P>,
        kind: &str,
        config: &JobConfig,
    ) -> Result<Vec<Uuid>> {
        let kind: ExecutorKind = kind.parse()?;
        Ok(self
            .queue
            .add_multiple(paths, kind, config)
            .into_iter()
            .map(|job| job.id)
            .collect())
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start processing the queue. Fails if a run is still in progress.
    pub fn start(&mut self, executor: Arc<dyn JobExecutor>) -> Result<()> {
        if self.is_running() {
            return Err(BatchError::AlreadyRunning);
        }
        let scheduler = Scheduler::new(self.queue.clone(), executor, self.config.clone())?
            .with_events(self.events.clone());
        self.handle = Some(scheduler.start());
        Ok(())
    }

    /// Ask the current run to stop dispatching; returns immediately.
    pub fn request_stop(&self) {
        if let Some(handle) = &self.handle {
            handle.request_stop();
        }
    }

    /// Stop the current run and wait for it. `None` if nothing was started.
    pub async fn stop(&mut self) -> Result<Option<QueueStatistics>> {
        match self.handle.take() {
            Some(handle) => handle.stop().await.map(Some),
            None => Ok(None),
        }
    }

    /// Wait for the current run to end on its own. `None` if nothing was started.
    pub async fn wait(&mut self) -> Result<Option<QueueStatistics>> {
        match self.handle.take() {
            Some(handle) => handle.wait().await.map(Some),
            None => Ok(None),
        }
    }
}
