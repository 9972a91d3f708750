use std::time::Duration;

use crate::error::{BatchError, Result};

/// Settings for the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of jobs in `Running` at once. Must be at least 1.
    pub max_parallel_jobs: usize,
    /// Fallback wake-up interval of the control loop.
    pub poll_interval_ms: u64,
    /// How long `stop` waits for in-flight units before abandoning them.
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 2,
            poll_interval_ms: 200,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl SchedulerConfig {
    pub fn new(max_parallel_jobs: usize) -> Self {
        Self {
            max_parallel_jobs,
            ..Default::default()
        }
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.shutdown_timeout_ms = ms;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_jobs == 0 {
            return Err(BatchError::InvalidConfig(
                "max_parallel_jobs must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(BatchError::InvalidConfig(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the shell-command executor.
///
/// The command runs under `sh -c` with `INPUT_PATH`, `OUTPUT_PATH`, `JOB_ID`
/// and `EXECUTOR_KIND` exported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    pub command: String,
    /// Tag inserted before the input's extension to name the output
    /// (`movie.srt` -> `movie.<tag>.srt`).
    pub output_tag: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command: r#"cp "$INPUT_PATH" "$OUTPUT_PATH""#.to_string(),
            output_tag: "out".to_string(),
        }
    }
}
