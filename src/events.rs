//! Observer interface for batch runs.
//!
//! Every outward notification is a [`BatchEvent`] fanned out to all
//! subscribers over unbounded channels. Sending never blocks, so events can be
//! emitted from blocking executor threads as well as from the control loop.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::scheduler::QueueStatistics;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    JobStarted {
        id: Uuid,
    },
    JobProgress {
        id: Uuid,
        percent: u8,
        message: String,
    },
    JobCompleted {
        id: Uuid,
        output: Option<PathBuf>,
    },
    JobFailed {
        id: Uuid,
        message: String,
    },
    JobSkipped {
        id: Uuid,
        reason: String,
    },
    QueueStatsUpdated(QueueStatistics),
    /// Emitted exactly once per run, after the last unit has been joined or abandoned.
    BatchFinished(QueueStatistics),
}

#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<BatchEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, pruning closed ones.
    pub fn emit(&self, event: BatchEvent) {
        self.emit_with(|| event);
    }

    /// Build the event while holding the subscriber lock, so events built from
    /// snapshots are delivered in the order the snapshots were taken.
    ///
    /// `make` must not emit on this bus.
    pub fn emit_with(&self, make: impl FnOnce() -> BatchEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let event = make();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
