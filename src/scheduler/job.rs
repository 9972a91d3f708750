use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BatchError;

/// Executor-specific key/value settings carried by a job (model name, API key,
/// output path override, ...). The scheduler never interprets them.
pub type JobConfig = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped
        )
    }

    /// Statuses only move forward: `Pending -> Running -> terminal`, and a job
    /// may also go straight from `Pending` to any terminal status.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Pending | JobStatus::Running, to) => to.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Which engine a job is meant for. Executors may branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Speech-to-text straight from a media file.
    Whisper,
    /// Offline machine translation of a subtitle file.
    Argos,
    /// Hosted machine translation of a subtitle file.
    #[serde(rename = "chatgpt")]
    ChatGpt,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Whisper => write!(f, "whisper"),
            ExecutorKind::Argos => write!(f, "argos"),
            ExecutorKind::ChatGpt => write!(f, "chatgpt"),
        }
    }
}

impl FromStr for ExecutorKind {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whisper" => Ok(ExecutorKind::Whisper),
            "argos" => Ok(ExecutorKind::Argos),
            "chatgpt" => Ok(ExecutorKind::ChatGpt),
            _ => Err(BatchError::UnknownExecutorKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub source: PathBuf,
    pub kind: ExecutorKind,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub output: Option<PathBuf>,
    pub config: JobConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(source: impl Into<PathBuf>, kind: ExecutorKind, config: JobConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            kind,
            status: JobStatus::Pending,
            progress: 0,
            message: String::new(),
            output: None,
            config,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Output location requested through the job config, if any.
    pub fn configured_output(&self) -> Option<PathBuf> {
        self.config
            .get("output_path")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }
}

/// Clamp an arbitrary progress report into `0..=100`.
pub fn clamp_progress(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}
