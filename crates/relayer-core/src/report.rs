//! RunReport: terminal aggregation of per-unit and per-destination outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ChannelRef;
use crate::pipeline::PipelineState;

/// Outcome of processing a single [`crate::model::AtomicUnit`] (download mode
/// or the acquisition half of forward mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UnitOutcome {
    pub source_id: i64,
    pub session: String,
    pub status: UnitStatus,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitStatus {
    Success,
    Skipped,
    Failed { reason: String },
}

/// Outcome of one [`crate::model::SendBatch`] sent to one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DestinationOutcome {
    pub source_id: i64,
    pub destination: ChannelRef,
    pub success: bool,
    pub remote_message_ids: Vec<i64>,
    pub error: Option<String>,
    pub retry_count: u32,
}

/// Terminal run state, one per [`crate::driver::WorkflowDriver`] run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub unit_outcomes: Vec<UnitOutcome>,
    pub destination_outcomes: Vec<DestinationOutcome>,
    /// ScratchHandles that were explicitly retained rather than reclaimed,
    /// per the `cleanup-on-failure` policy, surfaced so the operator can
    /// inspect or manually clean them up.
    pub unreclaimed_scratch: Vec<String>,
    pub cancelled: bool,
    /// The Staged-Forward Pipeline's terminal state, for runs that took that
    /// path. `None` for the Local-Download Workflow, which has no staging
    /// state machine of its own.
    pub pipeline_state: Option<PipelineState>,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            unit_outcomes: Vec::new(),
            destination_outcomes: Vec::new(),
            unreclaimed_scratch: Vec::new(),
            cancelled: false,
            pipeline_state: None,
        }
    }

    pub fn record_unit(&mut self, outcome: UnitOutcome) {
        self.unit_outcomes.push(outcome);
    }

    pub fn record_destination(&mut self, outcome: DestinationOutcome) {
        self.destination_outcomes.push(outcome);
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = finished_at;
    }

    pub fn total_bytes(&self) -> u64 {
        self.unit_outcomes.iter().map(|u| u.bytes).sum()
    }

    pub fn wall_time(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn success_rate(&self) -> f64 {
        if self.unit_outcomes.is_empty() {
            return 1.0;
        }
        let successes = self
            .unit_outcomes
            .iter()
            .filter(|u| matches!(u.status, UnitStatus::Success))
            .count();
        successes as f64 / self.unit_outcomes.len() as f64
    }

    pub fn failed_units(&self) -> Vec<&UnitOutcome> {
        self.unit_outcomes
            .iter()
            .filter(|u| matches!(u.status, UnitStatus::Failed { .. }))
            .collect()
    }

    /// 0 on full success, 1 on partial success, 2 on fatal failure (no
    /// units recorded at all and the run did not complete normally).
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            return 1;
        }
        if self.unit_outcomes.is_empty() {
            return 2;
        }
        if self.failed_units().is_empty() {
            0
        } else {
            1
        }
    }
}

/// Export a [`RunReport`] as CSV: summary comment lines followed by one data
/// row per unit outcome.
pub fn export_csv(report: &RunReport) -> Result<String, crate::RelayError> {
    let mut out = String::new();
    out.push_str(&format!(
        "# run started {} finished {}\n",
        report.started_at.to_rfc3339(),
        report.finished_at.to_rfc3339()
    ));
    out.push_str(&format!("# success rate {:.4}\n", report.success_rate()));
    out.push_str(&format!("# total bytes {}\n", report.total_bytes()));
    if !report.unreclaimed_scratch.is_empty() {
        out.push_str(&format!(
            "# unreclaimed scratch handles: {}\n",
            report.unreclaimed_scratch.join(", ")
        ));
    }

    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    for outcome in &report.unit_outcomes {
        let (status, reason) = match &outcome.status {
            UnitStatus::Success => ("success", String::new()),
            UnitStatus::Skipped => ("skipped", String::new()),
            UnitStatus::Failed { reason } => ("failed", reason.clone()),
        };
        writer
            .write_record([
                outcome.source_id.to_string(),
                outcome.session.clone(),
                status.to_string(),
                outcome.bytes.to_string(),
                reason,
            ])
            .map_err(|e| crate::RelayError::Internal(e.to_string()))?;
    }
    let body = writer
        .into_inner()
        .map_err(|e| crate::RelayError::Internal(e.to_string()))?;
    out.push_str("source_id,session,status,bytes,reason\n");
    out.push_str(&String::from_utf8_lossy(&body));
    Ok(out)
}

pub fn export_json(report: &RunReport) -> Result<String, crate::RelayError> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}
