//! Task Distributor: greedy longest-processing-time bin-packing of
//! [`AtomicUnit`]s across sessions, never splitting a group.

use crate::error::RelayError;
use crate::model::{Assignment, AtomicUnit};

/// Distribute `units` across `sessions` by greedy longest-processing-time
/// bin-packing: units are placed, heaviest first, into whichever session
/// currently carries the least total weight. Ties are broken by
/// session-name so that identical inputs always yield identical
/// assignments.
pub fn distribute(mut units: Vec<AtomicUnit>, sessions: &[String]) -> Result<Assignment, RelayError> {
    if sessions.is_empty() {
        return Err(RelayError::NoSessionsAvailable);
    }

    let mut ordered_sessions = sessions.to_vec();
    ordered_sessions.sort();

    let mut assignment = Assignment::new();
    if units.is_empty() {
        return Ok(assignment);
    }

    units.sort_by(|a, b| b.weight().cmp(&a.weight()));

    for unit in units {
        let target = ordered_sessions
            .iter()
            .min_by(|a, b| {
                assignment
                    .total_weight(a)
                    .cmp(&assignment.total_weight(b))
                    .then_with(|| a.cmp(b))
            })
            .expect("sessions is non-empty")
            .clone();
        assignment.push(&target, unit);
    }

    // Placement above runs heaviest-first for balance; restore source-id
    // order within each session before anything downstream consumes it.
    assignment.sort_by_source_id();

    Ok(assignment)
}
