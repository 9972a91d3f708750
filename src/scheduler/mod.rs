pub mod control;
pub mod job;
pub mod queue;

pub use control::{Scheduler, SchedulerHandle, SchedulerState};
pub use job::{ExecutorKind, JobConfig, JobRecord, JobStatus};
pub use queue::{JobQueue, ProgressSummary, QueueStatistics};
