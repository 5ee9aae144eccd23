//! Workflow Driver (C10): the top-level state machine that ties every other
//! module together for one end-to-end run —
//! `start -> fetch -> group -> distribute -> (local | forward) -> report -> done`.

use std::sync::Arc;

use std::sync::OnceLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::distribute;
use crate::download::{self, DownloadOptions, FilterFn};
use crate::error::RelayError;
use crate::fetch;
use crate::group;
use crate::model::ChannelRef;
use crate::pipeline;
use crate::pipeline::PipelineState;
use crate::report::{RunReport, UnitOutcome, UnitStatus};
use crate::session::SessionPool;

/// `@username` (5-32 alphanumerics/underscore, must start with a letter) or a
/// raw signed integer id — the two forms the remote service accepts.
fn username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{4,31}$").unwrap())
}

/// Parse a CLI/config-supplied channel reference string, rejecting anything
/// that cannot possibly resolve on the remote service.
pub fn parse_channel_ref(raw: &str) -> Result<ChannelRef, RelayError> {
    let trimmed = raw.trim();
    if let Some(handle) = trimmed.strip_prefix('@') {
        if username_re().is_match(handle) {
            return Ok(ChannelRef::Username(handle.to_string()));
        }
        return Err(RelayError::Validation(format!("invalid channel username: {raw}")));
    }
    match trimmed.parse::<i64>() {
        Ok(id) => Ok(ChannelRef::Id(id)),
        Err(_) => Err(RelayError::Validation(format!("invalid channel reference: {raw}"))),
    }
}

/// Which terminal workflow the driver runs after grouping and distribution.
pub enum WorkflowMode {
    /// Local-Download Workflow: write every unit's media under `dest_root`.
    Download {
        dest_root: std::path::PathBuf,
        filter: Option<FilterFn>,
    },
    /// Staged-Forward Pipeline: acquire into self-chat scratch, then
    /// redistribute to every destination.
    Forward {
        destinations: Vec<ChannelRef>,
        template: String,
        /// `--batch-size`, clamped to `1..=SEND_BATCH_CAP` by the caller.
        batch_size: usize,
        cleanup_on_failure: bool,
    },
}

pub struct WorkflowOptions {
    pub source: ChannelRef,
    pub source_name: String,
    pub start_id: i64,
    pub end_id: i64,
    pub mode: WorkflowMode,
}

/// Run one full workflow: fetch the message range, group it into atomic
/// units, distribute across logged-in sessions, execute the chosen terminal
/// workflow, and assemble the final report. Any stage error short-circuits
/// straight to the report rather than aborting the process — the operator
/// always gets a `RunReport`, even for a fully failed run.
pub async fn run_workflow(
    pool: Arc<SessionPool>,
    config: &RunConfig,
    options: WorkflowOptions,
    cancel: CancellationToken,
) -> RunReport {
    let started_at = chrono::Utc::now();
    let mut report = RunReport::new(started_at);

    if options.start_id > options.end_id {
        report.record_unit(UnitOutcome {
            source_id: 0,
            session: String::new(),
            status: UnitStatus::Failed {
                reason: "start id is greater than end id".to_string(),
            },
            bytes: 0,
        });
        report.finish(chrono::Utc::now());
        return report;
    }

    info!(source = %options.source, start = options.start_id, end = options.end_id, "workflow starting: fetch");
    let fetched = fetch::fetch(Arc::clone(&pool), options.source.clone(), options.start_id, options.end_id).await;
    for (range_start, range_end) in &fetched.failed_ranges {
        warn!(range_start, range_end, "message range could not be fetched on any session");
    }

    info!(count = fetched.messages.len(), "grouping into atomic units");
    let units = group::group(fetched.messages);

    if cancel.is_cancelled() {
        report.cancelled = true;
        report.finish(chrono::Utc::now());
        return report;
    }

    let sessions = pool.list_logged_in();
    let assignment = match distribute::distribute(units, &sessions) {
        Ok(a) => a,
        Err(e) => {
            report.record_unit(UnitOutcome {
                source_id: 0,
                session: String::new(),
                status: UnitStatus::Failed { reason: e.to_string() },
                bytes: 0,
            });
            report.finish(chrono::Utc::now());
            return report;
        }
    };
    info!(
        units = assignment.total_units(),
        imbalance = assignment.load_imbalance(),
        "distribution complete"
    );

    match options.mode {
        WorkflowMode::Download { dest_root, filter } => {
            let download_options = Arc::new(DownloadOptions {
                dest_root,
                naming: config.file_naming.clone(),
                filter,
            });
            let outcomes = download::download_all(
                Arc::clone(&pool),
                assignment,
                options.source,
                options.source_name,
                download_options,
                cancel.clone(),
            )
            .await;
            for outcome in outcomes {
                report.record_unit(outcome);
            }
        }
        WorkflowMode::Forward {
            destinations,
            template,
            batch_size,
            cleanup_on_failure,
        } => {
            let table = Arc::new(pipeline::ScratchTable::new());
            info!(state = ?PipelineState::Staging, "pipeline: acquiring");
            let acquisition = pipeline::acquire(Arc::clone(&pool), assignment, Arc::clone(&table), cancel.clone()).await;

            for source_id in &acquisition.failed_units {
                report.record_unit(UnitOutcome {
                    source_id: *source_id,
                    session: String::new(),
                    status: UnitStatus::Failed {
                        reason: "stage 1 acquisition failed".to_string(),
                    },
                    bytes: 0,
                });
            }

            let post_acquisition = PipelineState::after_acquisition(acquisition.acquired.is_empty());
            info!(state = ?post_acquisition, "pipeline: acquisition complete");

            if post_acquisition == PipelineState::EmergencyCleanup {
                let residual = pipeline::emergency_cleanup(Arc::clone(&pool), table, std::time::Duration::from_secs(30)).await;
                report.unreclaimed_scratch = residual;
                let done = PipelineState::after_cleanup(post_acquisition);
                info!(state = ?done, "pipeline: emergency cleanup complete");
                report.pipeline_state = Some(done);
                report.finish(chrono::Utc::now());
                return report;
            }

            for unit in &acquisition.acquired {
                report.record_unit(UnitOutcome {
                    source_id: unit.source_id,
                    session: unit.scratch.owning_session().to_string(),
                    status: UnitStatus::Success,
                    bytes: 0,
                });
            }

            info!(state = ?PipelineState::Distributing, "pipeline: distributing");
            let destination_outcomes = pipeline::distribute_and_send(
                Arc::clone(&pool),
                acquisition.acquired,
                destinations,
                template,
                options.source_name,
                batch_size,
                cancel.clone(),
            )
            .await;

            for outcome in &destination_outcomes {
                report.record_destination(outcome.clone());
            }

            let any_destination_failed = destination_outcomes.iter().any(|o| !o.success);
            let post_distribution = PipelineState::after_distribution(any_destination_failed);
            info!(state = ?post_distribution, "pipeline: distribution complete");

            info!(state = ?PipelineState::Cleaning, "pipeline: cleaning up scratch");
            let unreclaimed = pipeline::cleanup(Arc::clone(&pool), table, &destination_outcomes, cleanup_on_failure).await;
            report.unreclaimed_scratch = unreclaimed;
            let done = PipelineState::after_cleanup(post_distribution);
            info!(state = ?done, "pipeline: cleanup complete");
            report.pipeline_state = Some(done);
        }
    }

    report.cancelled = cancel.is_cancelled();
    report.finish(chrono::Utc::now());
    info!(
        success_rate = report.success_rate(),
        exit_code = report.exit_code(),
        "workflow done"
    );
    report
}
