//! Job execution.
//!
//! This module is the bridge between the scheduler and the code that does the
//! actual work:
//! - **Executor contract**: [`JobExecutor`] is a blocking, fallible function of a [`JobContext`]
//! - **Execution unit**: [`ExecutionUnit`] runs one job through one executor call
//! - **Shell executor**: [`ShellExecutor`] runs a shell command per job
//!
//! # Execution Flow
//!
//! 1. The scheduler moves a job to `Running` and builds an [`ExecutionUnit`]
//! 2. The unit runs on a blocking thread and hands the executor a [`JobContext`]
//! 3. The executor reports progress and its outcome through the context
//! 4. When the executor returns, the unit makes sure the job is terminal,
//!    synthesizing a completion or failure if the executor forgot to report one
//!
//! A panicking executor fails only its own job.

pub mod executor;
pub mod shell;

pub use executor::{
    DetachHandle, ExecutionUnit, ExecutorError, ExecutorResult, JobContext, JobExecutor,
};
pub use shell::ShellExecutor;
