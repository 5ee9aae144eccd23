use std::collections::BTreeMap;

use crate::model::unit::AtomicUnit;

/// Mapping `session-name -> ordered list of AtomicUnits`, produced by the
/// Task Distributor. `BTreeMap` keeps iteration in session-name order for
/// deterministic reporting and logging.
#[derive(Debug, Default, Clone)]
pub struct Assignment {
    per_session: BTreeMap<String, Vec<AtomicUnit>>,
}

impl Assignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, session: &str, unit: AtomicUnit) {
        self.per_session
            .entry(session.to_string())
            .or_default()
            .push(unit);
    }

    pub fn units_for(&self, session: &str) -> &[AtomicUnit] {
        self.per_session
            .get(session)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn sessions(&self) -> impl Iterator<Item = &str> {
        self.per_session.keys().map(String::as_str)
    }

    pub fn total_weight(&self, session: &str) -> u64 {
        self.units_for(session).iter().map(AtomicUnit::weight).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.per_session.values().all(Vec::is_empty)
    }

    pub fn total_units(&self) -> usize {
        self.per_session.values().map(Vec::len).sum()
    }

    /// (max_load - min_load) / max_load across non-empty sessions, used by
    /// the Distributor's optional load-balance check.
    pub fn load_imbalance(&self) -> f64 {
        let loads: Vec<u64> = self
            .per_session
            .keys()
            .map(|s| self.total_weight(s))
            .collect();
        let max = loads.iter().copied().max().unwrap_or(0);
        let min = loads.iter().copied().min().unwrap_or(0);
        if max == 0 {
            0.0
        } else {
            (max - min) as f64 / max as f64
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[AtomicUnit])> {
        self.per_session
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Reorder every session's list by ascending `source_id`, restoring
    /// intra-session source order after the distributor's weight-descending
    /// placement pass.
    pub fn sort_by_source_id(&mut self) {
        for units in self.per_session.values_mut() {
            units.sort_by_key(AtomicUnit::source_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::{MediaKind, Message};

    fn singleton(id: i64, weight: u64) -> AtomicUnit {
        AtomicUnit::Singleton(Message {
            channel_id: 1,
            message_id: id,
            author_date: chrono::Utc::now(),
            text: None,
            caption: None,
            media_payload_ref: None,
            group_id: None,
            media_kind: MediaKind::Photo,
            file_size: weight,
            file_name: None,
        })
    }

    #[test]
    fn push_and_units_for_roundtrip() {
        let mut a = Assignment::new();
        a.push("s1", singleton(1, 10));
        a.push("s1", singleton(2, 20));
        assert_eq!(a.units_for("s1").len(), 2);
        assert_eq!(a.total_weight("s1"), 30);
    }

    #[test]
    fn units_for_missing_session_is_empty() {
        let a = Assignment::new();
        assert!(a.units_for("nope").is_empty());
    }

    #[test]
    fn empty_assignment_has_zero_imbalance() {
        let a = Assignment::new();
        assert_eq!(a.load_imbalance(), 0.0);
    }

    #[test]
    fn balanced_assignment_has_zero_imbalance() {
        let mut a = Assignment::new();
        a.push("s1", singleton(1, 100));
        a.push("s2", singleton(2, 100));
        assert_eq!(a.load_imbalance(), 0.0);
    }

    #[test]
    fn imbalanced_assignment_reports_ratio() {
        let mut a = Assignment::new();
        a.push("s1", singleton(1, 100));
        a.push("s2", singleton(2, 50));
        assert!((a.load_imbalance() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn total_units_counts_across_sessions() {
        let mut a = Assignment::new();
        a.push("s1", singleton(1, 1));
        a.push("s2", singleton(2, 1));
        a.push("s2", singleton(3, 1));
        assert_eq!(a.total_units(), 3);
    }
}
