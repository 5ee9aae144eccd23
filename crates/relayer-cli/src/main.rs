//! Headless CLI entry point: parses flags, loads configuration, wires a
//! `RemoteClient` implementation to the core's workflow driver, and runs one
//! fetch/group/distribute/(download|forward)/report pass to completion.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use relayer_core::config::RunConfig;
use relayer_core::driver::{self, WorkflowMode, WorkflowOptions};
use relayer_core::pipeline::SEND_BATCH_CAP;
use relayer_core::ratelimit::RateLimitController;
use relayer_core::session::mock::MockRemoteClient;
use relayer_core::session::{AuthArtifact, SessionPool};
use relayer_core::template;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Download,
    Forward,
}

/// Bulk retrieval and redistribution of media-bearing messages from a source
/// channel, either to disk or to one or more destination channels.
#[derive(Debug, Parser)]
#[command(name = "relayer", version, about)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Download)]
    mode: Mode,

    /// Source channel, `@username` or a raw numeric id.
    #[arg(long)]
    source: String,

    #[arg(long)]
    start: i64,

    #[arg(long)]
    end: i64,

    /// Destination channels; required for `--mode forward`, rejected for
    /// `--mode download`.
    #[arg(long)]
    targets: Vec<String>,

    /// Caption template; only meaningful in forward mode.
    #[arg(long, default_value = template::DEFAULT_TEMPLATE)]
    template: String,

    /// Forward-send batch size, clamped to 1..=10.
    #[arg(long, default_value_t = SEND_BATCH_CAP)]
    batch_size: usize,

    #[arg(long)]
    no_cleanup_success: bool,

    #[arg(long)]
    cleanup_failure: bool,

    /// Accepted for compatibility with the documented flag set; batches
    /// already never merge across distinct source units, so this is a no-op.
    #[arg(long)]
    preserve_structure: bool,

    /// Grouper flush deadline; accepted but not currently load-bearing since
    /// grouping runs over an already-fetched, finite message range.
    #[arg(long)]
    group_timeout: Option<u64>,

    /// Destination directory for `--mode download`.
    #[arg(long, default_value = "./downloads")]
    dest: PathBuf,

    /// Path to a JSON run configuration; defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let source = match driver::parse_channel_ref(&cli.source) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid --source");
            return ExitCode::from(2);
        }
    };

    let config = match &cli.config {
        Some(path) => match RunConfig::load(path).await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to load config");
                return ExitCode::from(2);
            }
        },
        None => RunConfig::default(),
    };

    if config.sessions.is_empty() {
        error!("no sessions enrolled in config");
        return ExitCode::from(2);
    }

    let mode = match build_mode(&cli) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "invalid arguments");
            return ExitCode::from(2);
        }
    };

    let rate_limiter = Arc::new(RateLimitController::new(config.rate_limits.clone()));
    // The real authenticated transport is out of scope (spec.md §6); this
    // demo wiring uses the in-memory mock so the CLI is runnable end to end
    // without a live session.
    let client = Arc::new(MockRemoteClient::new());
    let pool = Arc::new(SessionPool::new(client, rate_limiter));
    for session in &config.sessions {
        let artifact = session
            .auth_artifact_path
            .as_ref()
            .map(|_| AuthArtifact(vec![1]));
        pool.register(&session.name, session.enabled, artifact);
    }

    if pool.start_enabled().await.is_err() {
        error!("no sessions could be logged in");
        return ExitCode::from(2);
    }

    let options = WorkflowOptions {
        source: source.clone(),
        source_name: cli.source.trim_start_matches('@').to_string(),
        start_id: cli.start,
        end_id: cli.end,
        mode,
    };

    let cancel = CancellationToken::new();
    let report = driver::run_workflow(pool, &config, options, cancel).await;

    info!(
        success_rate = report.success_rate(),
        bytes = report.total_bytes(),
        "run complete"
    );
    if let Ok(json) = relayer_core::report::export_json(&report) {
        println!("{json}");
    }

    ExitCode::from(report.exit_code() as u8)
}

fn build_mode(cli: &Cli) -> Result<WorkflowMode, relayer_core::RelayError> {
    match cli.mode {
        Mode::Download => {
            if !cli.targets.is_empty() {
                return Err(relayer_core::RelayError::Validation(
                    "--targets is rejected for --mode download".to_string(),
                ));
            }
            Ok(WorkflowMode::Download {
                dest_root: cli.dest.clone(),
                filter: None,
            })
        }
        Mode::Forward => {
            if cli.targets.is_empty() {
                return Err(relayer_core::RelayError::Validation(
                    "--targets is required for --mode forward".to_string(),
                ));
            }
            let destinations = cli
                .targets
                .iter()
                .map(|t| driver::parse_channel_ref(t))
                .collect::<Result<Vec<_>, _>>()?;
            let cleanup_on_failure = cli.cleanup_failure && !cli.no_cleanup_success;
            Ok(WorkflowMode::Forward {
                destinations,
                template: cli.template.clone(),
                batch_size: cli.batch_size.clamp(1, SEND_BATCH_CAP),
                cleanup_on_failure,
            })
        }
    }
}
