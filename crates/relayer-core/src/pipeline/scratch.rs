//! Scratch bookkeeping: every media item Stage 1 uploads into a session's
//! self-chat is tracked here until Stage 3 reclaims it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::MediaKind;
use crate::session::MediaIdentifier;

/// One uploaded-but-not-yet-sent media item, identified by
/// `(owning_session, remote_message_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchHandle {
    pub owning_session: String,
    /// The source [`crate::model::AtomicUnit`] this handle belongs to, used
    /// by Stage 3 to gate reclamation on that unit's send outcome.
    pub source_id: i64,
    pub remote_message_id: i64,
    pub media_kind: MediaKind,
    pub media_identifier: MediaIdentifier,
    pub original_caption: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Mirrors an [`crate::model::AtomicUnit`]'s shape over [`ScratchHandle`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScratchUnit {
    Singleton(ScratchHandle),
    Group(Vec<ScratchHandle>),
}

impl ScratchUnit {
    pub fn handles(&self) -> &[ScratchHandle] {
        match self {
            ScratchUnit::Singleton(h) => std::slice::from_ref(h),
            ScratchUnit::Group(hs) => hs,
        }
    }

    pub fn owning_session(&self) -> &str {
        &self.handles()[0].owning_session
    }
}

/// Per-session scratch table. Partitioned by owning session so unrelated
/// sessions' Stage 1/3 work never contends on the same lock.
#[derive(Default)]
pub struct ScratchTable {
    by_session: DashMap<String, Vec<ScratchHandle>>,
}

impl ScratchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, unit: &ScratchUnit) {
        for handle in unit.handles() {
            self.by_session
                .entry(handle.owning_session.clone())
                .or_default()
                .push(handle.clone());
        }
    }

    /// Remove the given remote-message-ids from `session`'s outstanding set.
    /// Reclaiming an id that is not present is a no-op (idempotent).
    pub fn reclaim(&self, session: &str, remote_message_ids: &[i64]) {
        if let Some(mut bucket) = self.by_session.get_mut(session) {
            bucket.retain(|h| !remote_message_ids.contains(&h.remote_message_id));
        }
    }

    pub fn outstanding(&self, session: &str) -> Vec<ScratchHandle> {
        self.by_session
            .get(session)
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    pub fn sessions_with_outstanding(&self) -> Vec<String> {
        self.by_session
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.iter().all(|e| e.value().is_empty())
    }
}
