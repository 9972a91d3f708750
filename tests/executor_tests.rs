use std::path::{Path, PathBuf};
use std::sync::Arc;

use subtitle_batch::config::ShellConfig;
use subtitle_batch::events::{BatchEvent, EventBus};
use subtitle_batch::scheduler::{ExecutorKind, JobConfig, JobQueue, JobRecord, JobStatus};
use subtitle_batch::worker::{ExecutionUnit, ShellExecutor};
use tempfile::TempDir;

const SUBTITLE: &str = "1\n00:00:01,000 --> 00:00:04,000\nHello there\n";

fn write_source(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, SUBTITLE).unwrap();
    path
}

/// Queue one job for `source` and move it to `Running`.
fn running_job(queue: &JobQueue, source: &Path, kind: ExecutorKind, config: JobConfig) -> JobRecord {
    queue.add(source, kind, config).unwrap();
    queue.dispatch_next().unwrap()
}

fn run_shell(command: &str, source: &Path, config: JobConfig) -> (Arc<JobQueue>, JobRecord, Vec<BatchEvent>) {
    let queue = Arc::new(JobQueue::new(1));
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let job = running_job(&queue, source, ExecutorKind::Argos, config);

    let executor = ShellExecutor::new(ShellConfig {
        command: command.to_string(),
        output_tag: "ar".to_string(),
    });
    let unit = ExecutionUnit::new(job.clone(), queue.clone(), events, Arc::new(executor));
    unit.run();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    let job = queue.get(&job.id).unwrap();
    (queue, job, seen)
}

#[test]
fn test_default_command_copies_to_tagged_output() {
    let dir = TempDir::new().unwrap();
    let source = write_source(dir.path(), "episode.srt");
    let default = ShellConfig::default();

    let (_queue, job, events) = run_shell(&default.command, &source, JobConfig::new());

    let expected = dir.path().join("episode.ar.srt");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.output, Some(expected.clone()));
    assert_eq!(std::fs::read_to_string(&expected).unwrap(), SUBTITLE);
    assert!(events.contains(&BatchEvent::JobCompleted {
        id: job.id,
        output: Some(expected),
    }));
}

#[test]
fn test_progress_lines_are_forwarded() {
    let dir = TempDir::new().unwrap();
    let source = write_source(dir.path(), "lecture.srt");
    let command = r#"echo "PROGRESS 25 Reading file"; echo "unrelated output"; echo "PROGRESS 75 Saving"; cp "$INPUT_PATH" "$OUTPUT_PATH""#;

    let (_queue, job, events) = run_shell(command, &source, JobConfig::new());

    assert_eq!(job.status, JobStatus::Completed);
    let progress: Vec<(u8, String)> = events
        .into_iter()
        .filter_map(|e| match e {
            BatchEvent::JobProgress { percent, message, .. } => Some((percent, message)),
            _ => None,
        })
        .collect();
    assert_eq!(
        progress,
        vec![
            (25, "Reading file".to_string()),
            (75, "Saving".to_string())
        ]
    );
}

#[test]
fn test_non_utf8_stdout_does_not_fail_the_job() {
    let dir = TempDir::new().unwrap();
    let source = write_source(dir.path(), "cafe.srt");
    let command = r#"printf 'PROGRESS 10 caf\351\n'; printf '\377\376 noise\n'; cp "$INPUT_PATH" "$OUTPUT_PATH"; exit 0"#;

    let (_queue, job, events) = run_shell(command, &source, JobConfig::new());

    assert_eq!(job.status, JobStatus::Completed, "{}", job.message);
    assert!(job.output.as_ref().unwrap().exists());
    assert!(events.contains(&BatchEvent::JobProgress {
        id: job.id,
        percent: 10,
        message: "caf\u{FFFD}".to_string(),
    }));
}

#[test]
fn test_non_utf8_stderr_is_decoded_lossily() {
    let dir = TempDir::new().unwrap();
    let source = write_source(dir.path(), "movie.srt");

    let (_queue, job, _events) = run_shell(
        r#"printf 'bad \377 model\n' >&2; exit 1"#,
        &source,
        JobConfig::new(),
    );

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.message, "bad \u{FFFD} model");
}

#[test]
fn test_failure_reports_stderr() {
    let dir = TempDir::new().unwrap();
    let source = write_source(dir.path(), "movie.srt");

    let (_queue, job, events) = run_shell("echo 'model missing' >&2; exit 3", &source, JobConfig::new());

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.message, "model missing");
    assert!(job.output.is_none());
    assert!(events.contains(&BatchEvent::JobFailed {
        id: job.id,
        message: "model missing".to_string(),
    }));
}

#[test]
fn test_failure_without_stderr_reports_exit_code() {
    let dir = TempDir::new().unwrap();
    let source = write_source(dir.path(), "movie.srt");

    let (_queue, job, _events) = run_shell("exit 2", &source, JobConfig::new());

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.message, "Exit code: Some(2)");
}

#[test]
fn test_environment_is_exported() {
    let dir = TempDir::new().unwrap();
    let source = write_source(dir.path(), "clip.srt");

    let (_queue, job, _events) = run_shell(
        r#"printf '%s %s' "$JOB_ID" "$EXECUTOR_KIND" > "$OUTPUT_PATH""#,
        &source,
        JobConfig::new(),
    );

    assert_eq!(job.status, JobStatus::Completed);
    let written = std::fs::read_to_string(job.output.unwrap()).unwrap();
    assert_eq!(written, format!("{} argos", job.id));
}

#[test]
fn test_output_path_from_job_config() {
    let dir = TempDir::new().unwrap();
    let source = write_source(dir.path(), "clip.srt");
    let target = dir.path().join("translated").join("clip.srt");
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();

    let mut config = JobConfig::new();
    config.insert(
        "output_path".into(),
        target.to_string_lossy().into_owned().into(),
    );
    let (_queue, job, _events) = run_shell(&ShellConfig::default().command, &source, config);

    assert_eq!(job.output, Some(target.clone()));
    assert!(target.exists());
}

#[test]
fn test_unit_on_vanished_job_is_ignored() {
    let dir = TempDir::new().unwrap();
    let source = write_source(dir.path(), "clip.srt");
    let queue = Arc::new(JobQueue::new(1));
    let job = running_job(&queue, &source, ExecutorKind::Whisper, JobConfig::new());

    // The job is failed externally before the unit gets to report.
    queue.mark_failed(&job.id, "abandoned").unwrap();

    let unit = ExecutionUnit::new(
        job.clone(),
        queue.clone(),
        EventBus::new(),
        Arc::new(ShellExecutor::default()),
    );
    assert_eq!(unit.run(), Some(JobStatus::Failed));
    assert_eq!(queue.get(&job.id).unwrap().message, "abandoned");
}
