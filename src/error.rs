use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Unknown executor kind: {0}")]
    UnknownExecutorKind(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {id} is already {status}")]
    JobAlreadyTerminal { id: Uuid, status: JobStatus },

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id} did not finish within the {timeout:?} shutdown timeout and was abandoned")]
    ShutdownTimeout { id: Uuid, timeout: Duration },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("A batch is already running")]
    AlreadyRunning,

    #[error("Scheduler task failed: {0}")]
    SchedulerTask(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BatchError>;
