//! Stage 1 — Acquisition: move each assigned unit's media into its owning
//! session's self-chat scratch space.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::model::{AtomicUnit, Assignment, ChannelRef, Message};
use crate::pipeline::scratch::{ScratchHandle, ScratchTable, ScratchUnit};
use crate::ratelimit::OpClass;
use crate::session::{MediaSource, SessionPool};

/// Sentinel destination representing a session's own self-chat. The real
/// transport resolves this to the session's saved-messages peer; the core
/// never needs more than an opaque marker.
pub const SELF_CHAT: ChannelRef = ChannelRef::Id(0);

/// A successfully acquired unit, carrying its representative source message
/// (the first constituent) for caption templating in Stage 2.
#[derive(Debug, Clone)]
pub struct AcquiredUnit {
    pub source_id: i64,
    pub scratch: ScratchUnit,
    pub representative: Message,
}

#[derive(Debug, Default)]
pub struct AcquisitionOutcome {
    pub acquired: Vec<AcquiredUnit>,
    /// Source ids of units that failed acquisition on every constituent
    /// message; any partial scratch they produced is already recorded in
    /// the shared [`ScratchTable`] for emergency cleanup.
    pub failed_units: Vec<i64>,
}

/// Run Stage 1 across every session's assignment concurrently; within a
/// session, units and their constituent messages are acquired sequentially.
pub async fn acquire(
    pool: Arc<SessionPool>,
    assignment: Assignment,
    table: Arc<ScratchTable>,
    cancel: CancellationToken,
) -> AcquisitionOutcome {
    let mut join_set: JoinSet<AcquisitionOutcome> = JoinSet::new();

    for (session, units) in assignment.iter() {
        let session = session.to_string();
        let units = units.to_vec();
        let pool = Arc::clone(&pool);
        let table = Arc::clone(&table);
        let cancel = cancel.clone();
        join_set.spawn(async move { acquire_session(pool, session, units, table, cancel).await });
    }

    let mut outcome = AcquisitionOutcome::default();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(mut partial) => {
                outcome.acquired.append(&mut partial.acquired);
                outcome.failed_units.append(&mut partial.failed_units);
            }
            Err(e) => warn!(error = %e, "acquisition worker task panicked"),
        }
    }
    outcome
}

async fn acquire_session(
    pool: Arc<SessionPool>,
    session: String,
    units: Vec<AtomicUnit>,
    table: Arc<ScratchTable>,
    cancel: CancellationToken,
) -> AcquisitionOutcome {
    let mut outcome = AcquisitionOutcome::default();

    for unit in units {
        if cancel.is_cancelled() {
            break;
        }
        let source_id = unit.source_id();
        let messages = unit.messages().to_vec();
        let mut handles = Vec::with_capacity(messages.len());
        let mut failed = false;

        for message in &messages {
            match acquire_one(&pool, &session, source_id, message, &cancel).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(session = %session, source_id, error = %e, "stage 1 acquisition failed");
                    failed = true;
                    break;
                }
            }
        }

        if !handles.is_empty() {
            let scratch = match (&unit, handles.len() == messages.len()) {
                (AtomicUnit::Singleton(_), true) => ScratchUnit::Singleton(handles.remove(0)),
                _ => ScratchUnit::Group(handles),
            };
            table.record(&scratch);

            if failed {
                outcome.failed_units.push(source_id);
            } else {
                outcome.acquired.push(AcquiredUnit {
                    source_id,
                    scratch,
                    representative: messages[0].clone(),
                });
            }
        } else if failed {
            outcome.failed_units.push(source_id);
        }
    }

    outcome
}

async fn acquire_one(
    pool: &Arc<SessionPool>,
    session: &str,
    source_id: i64,
    message: &Message,
    cancel: &CancellationToken,
) -> Result<ScratchHandle, crate::RelayError> {
    pool.rate_limiter.admit(session, OpClass::Upload, cancel).await?;
    let handle = pool.lease(session).await?;

    let bytes = if message.media_kind.prefers_small_file_path(message.file_size) {
        handle.client.download_media_small(session, message).await?
    } else {
        return stream_upload(&handle, session, source_id, message).await;
    };

    let remote = handle
        .client
        .send_media(
            session,
            &SELF_CHAT,
            message.media_kind,
            MediaSource::InMemory(bytes),
            message.caption.as_deref(),
        )
        .await?;
    handle.touch();

    Ok(ScratchHandle {
        owning_session: session.to_string(),
        source_id,
        remote_message_id: remote.message_id,
        media_kind: message.media_kind,
        media_identifier: remote.media_identifier,
        original_caption: message.caption.clone(),
        created_at: chrono::Utc::now(),
    })
}

async fn stream_upload(
    handle: &crate::session::SessionHandle,
    session: &str,
    source_id: i64,
    message: &Message,
) -> Result<ScratchHandle, crate::RelayError> {
    let stream = handle.client.stream_media(session, message).await?;
    let remote = handle
        .client
        .send_media(
            session,
            &SELF_CHAT,
            message.media_kind,
            MediaSource::Stream(stream),
            message.caption.as_deref(),
        )
        .await?;
    handle.touch();

    Ok(ScratchHandle {
        owning_session: session.to_string(),
        source_id,
        remote_message_id: remote.message_id,
        media_kind: message.media_kind,
        media_identifier: remote.media_identifier,
        original_caption: message.caption.clone(),
        created_at: chrono::Utc::now(),
    })
}
