//! The staged-forward pipeline's state machine, tracked for observability
//! and so the driver can decide which branch to take on partial failure.
//!
//! ```text
//! idle -> staging -> staged -> distributing -> distributed -> cleaning -> done(success)
//!           |                                       |
//!           v (all units fail)                      v (any destination failed)
//!   emergency-cleanup -> done(failure)        partial-distributed -> cleaning -> done(partial)
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Staging,
    Staged,
    Distributing,
    Distributed,
    PartialDistributed,
    Cleaning,
    EmergencyCleanup,
    Done { success: bool },
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done { .. })
    }

    /// Advance from Stage 1's outcome: every unit failing takes the
    /// emergency-cleanup branch, anything else proceeds to distribution.
    pub fn after_acquisition(all_units_failed: bool) -> PipelineState {
        if all_units_failed {
            PipelineState::EmergencyCleanup
        } else {
            PipelineState::Staged
        }
    }

    /// Advance from Stage 2's outcome: any destination failure routes through
    /// the partial branch, which still runs Stage 3 but retains scratch for
    /// the units it touched unless `cleanup_on_failure` is set.
    pub fn after_distribution(any_destination_failed: bool) -> PipelineState {
        if any_destination_failed {
            PipelineState::PartialDistributed
        } else {
            PipelineState::Distributed
        }
    }

    pub fn after_cleanup(prior: PipelineState) -> PipelineState {
        match prior {
            PipelineState::PartialDistributed => PipelineState::Done { success: false },
            PipelineState::EmergencyCleanup => PipelineState::Done { success: false },
            _ => PipelineState::Done { success: true },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_units_failed_routes_to_emergency_cleanup() {
        assert_eq!(
            PipelineState::after_acquisition(true),
            PipelineState::EmergencyCleanup
        );
    }

    #[test]
    fn partial_acquisition_proceeds_to_staged() {
        assert_eq!(PipelineState::after_acquisition(false), PipelineState::Staged);
    }

    #[test]
    fn any_destination_failure_routes_to_partial() {
        assert_eq!(
            PipelineState::after_distribution(true),
            PipelineState::PartialDistributed
        );
    }

    #[test]
    fn full_success_reaches_done_success() {
        let cleaned = PipelineState::after_cleanup(PipelineState::Distributed);
        assert_eq!(cleaned, PipelineState::Done { success: true });
    }

    #[test]
    fn partial_distribution_reaches_done_failure_after_cleanup() {
        let cleaned = PipelineState::after_cleanup(PipelineState::PartialDistributed);
        assert_eq!(cleaned, PipelineState::Done { success: false });
    }

    #[test]
    fn done_is_terminal() {
        assert!(PipelineState::Done { success: true }.is_terminal());
        assert!(!PipelineState::Staging.is_terminal());
    }
}
