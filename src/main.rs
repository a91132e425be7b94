use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use media_transcriptor::cli::{Cli, Commands, OutputFormat};
use media_transcriptor::config::Config;
use media_transcriptor::credentials::EnvCredentialStore;
use media_transcriptor::extractors::FfmpegExtractor;
use media_transcriptor::jobs::{
    BroadcastNotifier, InMemoryJobStore, JobId, JobStateMachine, JobStatus, JobStore,
    JsonFileJobStore, StatusEvent,
};
use media_transcriptor::providers::{ProviderKind, ProviderRegistry};
use media_transcriptor::queue::{InMemoryJobQueue, JobQueue};
use media_transcriptor::service::{Ingest, Submission, TranscriptionService};
use media_transcriptor::worker::{JobRunner, ScratchDir, WorkerPool};
use media_transcriptor::{output, utils};

const STATUS_POLL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().await?;
    init_tracing(cli.verbose, cli.json_logs || config.app.json_logs);

    match cli.command {
        Commands::Transcribe {
            file,
            provider,
            job_id,
            output,
            format,
        } => {
            let provider = provider.unwrap_or(config.app.default_provider);
            transcribe(config, file, provider, job_id, output, format, cli.quiet).await?;
        }
        Commands::Status { job_id } => {
            let dir = config
                .app
                .state_dir
                .as_ref()
                .context("No state_dir configured; job records are only kept in memory")?;
            let store = JsonFileJobStore::open(dir)?;
            let job = store
                .load(&job_id)
                .await?
                .with_context(|| format!("No job with ID {}", job_id))?;
            output::print_to_console(&job.view(), OutputFormat::Json)?;
        }
        Commands::Config { show } => {
            if show {
                config.display();
            } else {
                println!("Configuration file: {}", Config::config_path()?.display());
            }
        }
        Commands::Providers => list_providers(),
    }

    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "media_transcriptor=debug"
    } else {
        "media_transcriptor=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    // Logs go to stderr; stdout carries the transcript
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn list_providers() {
    println!("Supported providers:");
    for kind in ProviderKind::all() {
        let note = match kind {
            ProviderKind::Gemini => "Google Gemini, transcription with speaker labels in one pass",
            ProviderKind::Whisper => "OpenAI Whisper, 10 minute chunks plus a GPT cleanup pass",
        };
        println!("  • {:<8} {} (key: {})", kind.as_str(), note, kind.api_key_env());
    }
}

#[allow(clippy::too_many_arguments)]
async fn transcribe(
    config: Config,
    file: PathBuf,
    provider: ProviderKind,
    job_id: Option<JobId>,
    output_path: Option<PathBuf>,
    format: OutputFormat,
    quiet: bool,
) -> Result<()> {
    utils::check_file_accessible(&file)?;

    let missing_deps = utils::check_dependencies(&config.ffmpeg).await;
    if !missing_deps.is_empty() {
        eprintln!("{}", style("⚠️  Dependency check warnings:").yellow());
        for dep in missing_deps {
            eprintln!("   • {}", dep);
        }
    }

    let scratch =
        ScratchDir::create(config.scratch_dir()).context("Failed to create scratch directory")?;
    let store: Arc<dyn JobStore> = match &config.app.state_dir {
        Some(dir) => Arc::new(JsonFileJobStore::open(dir)?),
        None => Arc::new(InMemoryJobStore::new()),
    };
    let notifier = Arc::new(BroadcastNotifier::default());
    let events = notifier.subscribe();
    let machine = Arc::new(JobStateMachine::new(store, notifier));
    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new(config.lease_timeout()));

    let runner = Arc::new(JobRunner::new(
        machine.clone(),
        Arc::new(EnvCredentialStore),
        Arc::new(FfmpegExtractor::new(config.ffmpeg.clone())),
        ProviderRegistry::from_config(&config.providers),
        scratch.clone(),
        config.soft_time_limit(),
    ));
    let pool = Arc::new(WorkerPool::new(
        queue.clone(),
        runner,
        config.app.workers,
        config.hard_time_limit(),
        config.app.max_deliveries,
    ));
    let service = TranscriptionService::new(machine, queue, scratch);

    let recovered = service.recover().await?;
    if recovered > 0 {
        eprintln!("Resuming {} unfinished job(s) from a previous run", recovered);
    }

    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .context("Input path has no file name")?;
    let size = fs_err::metadata(&file)?.len();

    let job_id = service
        .submit(Submission {
            upload_path: &file,
            filename: &filename,
            provider,
            credential_ref: "local",
            job_id,
            ingest: Ingest::Copy,
        })
        .await?;

    tracing::info!(
        job_id = %job_id,
        provider = %provider,
        "Transcribing {} ({})",
        filename,
        utils::format_file_size(size)
    );

    let started = Instant::now();
    let shutdown = CancellationToken::new();
    let workers = tokio::spawn(pool.run_until(shutdown.clone()));
    let progress = if quiet {
        None
    } else {
        Some(track_progress(events, job_id.clone())?)
    };

    let view = service.wait_for_completion(&job_id, STATUS_POLL).await;

    if let Some((bar, task)) = progress {
        task.abort();
        bar.finish_and_clear();
    }
    shutdown.cancel();
    workers.await.context("Worker pool stopped unexpectedly")?;

    let view = view?;
    let elapsed = utils::format_duration(started.elapsed().as_secs_f64());

    if view.status == JobStatus::Failed {
        anyhow::bail!(
            "Job {} failed after {}: {}",
            job_id,
            elapsed,
            view.text.unwrap_or_default()
        );
    }

    match output_path {
        Some(path) => {
            output::save_to_file(&view, &path, format).await?;
            eprintln!(
                "{} Transcription saved to: {} ({})",
                style("✓").green(),
                path.display(),
                elapsed
            );
        }
        None => {
            output::print_to_console(&view, format)?;
            if !quiet {
                eprintln!("{} {}", style("✓").green(), output::summary(&view));
            }
        }
    }

    Ok(())
}

/// Drive a progress bar from the job's status events
fn track_progress(
    mut events: broadcast::Receiver<StatusEvent>,
    job_id: JobId,
) -> Result<(ProgressBar, tokio::task::JoinHandle<()>)> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?,
    );
    bar.set_message("Queued");
    bar.enable_steady_tick(Duration::from_millis(120));

    let handle = {
        let bar = bar.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.job_id == job_id => {
                        bar.set_position(u64::from(event.progress));
                        bar.set_message(event.message);
                        if event.status.is_terminal() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    Ok((bar, handle))
}
