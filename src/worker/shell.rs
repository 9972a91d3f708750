use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::config::ShellConfig;
use crate::scheduler::JobRecord;
use crate::worker::executor::{ExecutorResult, JobContext, JobExecutor};

/// Runs a shell command for every job.
///
/// Stdout lines of the form `PROGRESS <percent> [message]` are forwarded as
/// progress reports; everything else on stdout is ignored. Exit status 0
/// completes the job with its output path, anything else fails it with the
/// captured stderr.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    config: ShellConfig,
}

impl ShellExecutor {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    /// `<dir>/<stem>.<tag>.<ext>` next to the source, unless the job config
    /// names an explicit `output_path`.
    pub fn output_path(&self, job: &JobRecord) -> PathBuf {
        job.configured_output()
            .unwrap_or_else(|| tagged_path(job.source(), &self.config.output_tag))
    }
}

impl JobExecutor for ShellExecutor {
    fn execute(&self, ctx: &JobContext) -> ExecutorResult {
        let job = ctx.job();
        let output = self.output_path(job);
        tracing::debug!(job_id = %job.id, command = %self.config.command, "Spawning shell command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.config.command)
            .env("INPUT_PATH", job.source())
            .env("OUTPUT_PATH", &output)
            .env("JOB_ID", job.id.to_string())
            .env("EXECUTOR_KIND", job.kind.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain stderr on its own thread so a chatty child cannot block on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let forwarded = match child.stdout.take() {
            Some(stdout) => forward_progress(stdout, ctx),
            None => Ok(()),
        };
        if let Err(e) = forwarded {
            tracing::warn!(job_id = %job.id, error = %e, "Lost the command's stdout, killing it");
            reap(&mut child);
            if let Some(handle) = stderr_reader {
                let _ = handle.join();
            }
            return Err(e.into());
        }

        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if status.success() {
            ctx.complete(Some(output));
            Ok(true)
        } else {
            let stderr = stderr.trim();
            let message = if stderr.is_empty() {
                format!("Exit code: {:?}", status.code())
            } else {
                stderr.to_string()
            };
            ctx.fail(&message);
            Ok(false)
        }
    }
}

/// Forward `PROGRESS` lines until stdout closes. Lines that are not valid
/// UTF-8 are decoded lossily.
fn forward_progress(stdout: impl Read, ctx: &JobContext) -> std::io::Result<()> {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        if let Some((percent, message)) = parse_progress_line(&line) {
            ctx.report_progress(percent, message);
        }
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn tagged_path(source: &Path, tag: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match source.extension() {
        Some(ext) => format!("{}.{}.{}", stem, tag, ext.to_string_lossy()),
        None => format!("{}.{}", stem, tag),
    };
    source.with_file_name(name)
}

/// Parse `PROGRESS <percent> [message]`.
fn parse_progress_line(line: &str) -> Option<(i64, &str)> {
    let rest = line.trim().strip_prefix("PROGRESS")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim_start();
    let (number, message) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let percent = number.parse().ok()?;
    Some((percent, message.trim()))
}
