use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use subtitle_batch::batch::BatchProcessor;
use subtitle_batch::config::{SchedulerConfig, ShellConfig};
use subtitle_batch::events::BatchEvent;
use subtitle_batch::scheduler::{JobConfig, QueueStatistics};
use subtitle_batch::shutdown::install_shutdown_handler;
use subtitle_batch::worker::ShellExecutor;

#[derive(Parser, Debug)]
#[command(name = "subtitle-batch")]
#[command(version)]
#[command(about = "Run transcription and translation jobs over many files in parallel")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Process a batch of files
    Run(RunArgs),
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Input files (missing files are skipped)
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Engine the jobs are meant for: whisper, argos or chatgpt
    #[arg(long, short = 'k', default_value = "argos")]
    kind: String,

    /// Maximum number of jobs running at once
    #[arg(long, short = 'p', default_value = "2")]
    parallel: usize,

    /// Shell command run per job; sees $INPUT_PATH, $OUTPUT_PATH, $JOB_ID, $EXECUTOR_KIND.
    /// Lines printed as "PROGRESS <n> [message]" are reported as progress.
    #[arg(long, short = 'c')]
    command: Option<String>,

    /// Tag inserted before the extension of each output file
    #[arg(long, default_value = "out")]
    output_tag: String,

    /// Per-job config entry (repeatable), format: "key=value"
    #[arg(long = "set", value_name = "KEY=VALUE")]
    settings: Vec<String>,

    /// How long to wait for running jobs after a stop request
    #[arg(long, default_value = "5000")]
    shutdown_timeout_ms: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn parse_settings(settings: &[String]) -> Result<JobConfig, Box<dyn std::error::Error>> {
    let mut config = JobConfig::new();
    for entry in settings {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("Invalid setting '{}', expected key=value", entry))?;
        config.insert(key.trim().to_string(), value.to_string().into());
    }
    Ok(config)
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn print_event(event: &BatchEvent, format: &OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
        },
        OutputFormat::Table => match event {
            BatchEvent::JobStarted { id } => println!("{:<10} {}", "STARTED", short_id(id)),
            BatchEvent::JobProgress {
                id,
                percent,
                message,
            } => println!("{:<10} {} {:>3}% {}", "PROGRESS", short_id(id), percent, message),
            BatchEvent::JobCompleted { id, output } => println!(
                "{:<10} {} {}",
                "DONE",
                short_id(id),
                output
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ),
            BatchEvent::JobFailed { id, message } => {
                println!("{:<10} {} {}", "FAILED", short_id(id), message)
            }
            BatchEvent::JobSkipped { id, reason } => {
                println!("{:<10} {} {}", "SKIPPED", short_id(id), reason)
            }
            // Stats arrive on every loop tick; only the final summary is printed.
            BatchEvent::QueueStatsUpdated(_) | BatchEvent::BatchFinished(_) => {}
        },
    }
}

fn print_summary(stats: &QueueStatistics, format: &OutputFormat) {
    if let OutputFormat::Table = format {
        println!();
        println!("{:<12} {}", "Total:", stats.total);
        println!("{:<12} {}", "Completed:", stats.completed);
        println!("{:<12} {}", "Failed:", stats.failed);
        println!("{:<12} {}", "Skipped:", stats.skipped);
    }
}

// =============================================================================
// Batch Run
// =============================================================================

async fn run_batch(args: RunArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let job_config = parse_settings(&args.settings)?;
    let config = SchedulerConfig::new(args.parallel).with_shutdown_timeout_ms(args.shutdown_timeout_ms);

    let mut shell = ShellConfig {
        output_tag: args.output_tag,
        ..ShellConfig::default()
    };
    if let Some(command) = args.command {
        shell.command = command;
    }

    let mut processor = BatchProcessor::new(config)?;
    let ids = processor.add_files(&args.files, &args.kind, &job_config)?;
    if ids.is_empty() {
        return Err("No valid input files".into());
    }
    tracing::info!(jobs = ids.len(), parallel = args.parallel, kind = %args.kind, "Queued batch");

    let shutdown = install_shutdown_handler();
    let mut events = processor.subscribe();
    processor.start(Arc::new(ShellExecutor::new(shell)))?;

    let mut stopping = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event, &args.output);
                if matches!(event, BatchEvent::BatchFinished(_)) {
                    break;
                }
            }
            _ = shutdown.cancelled(), if !stopping => {
                stopping = true;
                processor.request_stop();
            }
        }
    }

    let stats = processor
        .wait()
        .await?
        .unwrap_or_else(|| processor.statistics());
    print_summary(&stats, &args.output);

    if stats.failed > 0 {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = match args.command {
        Commands::Run(run_args) => runtime.block_on(run_batch(run_args)),
    };

    // Abandoned execution units may still hold blocking threads; the shutdown
    // timeout has already been spent on them, so do not wait again.
    runtime.shutdown_background();
    result
}
