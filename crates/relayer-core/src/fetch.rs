//! Message Fetcher: parallel range retrieval across logged-in sessions.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use crate::model::{ChannelRef, Message};
use crate::ratelimit::OpClass;
use crate::session::SessionPool;

/// Remote calls fetch at most this many message-ids per round trip.
const BATCH_SIZE: usize = 100;

/// Outcome of a fetch, including whatever was retrieved even if some slices
/// ultimately failed on every candidate session.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub messages: Vec<Message>,
    /// Slices that could not be retrieved on any session.
    pub failed_ranges: Vec<(i64, i64)>,
}

/// Partition `[start_id, end_id]` into `session_count` contiguous slices,
/// fetch each slice (in id-batches of [`BATCH_SIZE`]) on its assigned
/// session, retry on an alternate session on failure, then merge in
/// ascending message-id order.
pub async fn fetch(
    pool: Arc<SessionPool>,
    channel: ChannelRef,
    start_id: i64,
    end_id: i64,
) -> FetchOutcome {
    let sessions = pool.list_logged_in();
    if sessions.is_empty() || start_id > end_id {
        return FetchOutcome::default();
    }

    let slices = slice_range(start_id, end_id, sessions.len());

    let mut join_set: JoinSet<(usize, Option<Vec<Message>>)> = JoinSet::new();
    for (idx, (slice_start, slice_end)) in slices.iter().copied().enumerate() {
        let pool = Arc::clone(&pool);
        let channel = channel.clone();
        let sessions = sessions.clone();
        let primary = sessions[idx % sessions.len()].clone();
        join_set.spawn(async move {
            let result = fetch_slice_with_retry(&pool, &channel, slice_start, slice_end, &primary, &sessions).await;
            (idx, result)
        });
    }

    let mut per_slice: Vec<Option<Vec<Message>>> = vec![None; slices.len()];
    while let Some(joined) = join_set.join_next().await {
        if let Ok((idx, result)) = joined {
            per_slice[idx] = result;
        }
    }

    let mut outcome = FetchOutcome::default();
    for (idx, result) in per_slice.into_iter().enumerate() {
        match result {
            Some(mut messages) => outcome.messages.append(&mut messages),
            None => outcome.failed_ranges.push(slices[idx]),
        }
    }
    outcome.messages.sort_by_key(|m| m.message_id);
    outcome
}

/// Try `primary` first, then every other candidate session in order, for the
/// whole slice. Returns `None` only once every session has been tried.
async fn fetch_slice_with_retry(
    pool: &Arc<SessionPool>,
    channel: &ChannelRef,
    slice_start: i64,
    slice_end: i64,
    primary: &str,
    candidates: &[String],
) -> Option<Vec<Message>> {
    let mut order = vec![primary.to_string()];
    order.extend(candidates.iter().filter(|s| s.as_str() != primary).cloned());

    for session in &order {
        match fetch_slice_on_session(pool, channel, slice_start, slice_end, session).await {
            Ok(messages) => return Some(messages),
            Err(e) => warn!(session = %session, %slice_start, %slice_end, error = %e, "slice fetch failed, trying next session"),
        }
    }
    None
}

async fn fetch_slice_on_session(
    pool: &Arc<SessionPool>,
    channel: &ChannelRef,
    slice_start: i64,
    slice_end: i64,
    session: &str,
) -> Result<Vec<Message>, crate::RelayError> {
    let ids: Vec<i64> = (slice_start..=slice_end).collect();
    let handle = pool.lease(session).await?;
    let cancel = tokio_util::sync::CancellationToken::new();

    let mut out = Vec::new();
    for batch in ids.chunks(BATCH_SIZE) {
        pool.rate_limiter.admit(session, OpClass::Other, &cancel).await?;
        let fetched = handle.client.fetch_messages(session, channel, batch).await?;
        out.extend(fetched);
        handle.touch();
    }
    Ok(out)
}

/// Split `[start, end]` inclusive into `k` contiguous, near-equal ranges.
fn slice_range(start: i64, end: i64, k: usize) -> Vec<(i64, i64)> {
    let total = (end - start + 1) as u64;
    let k = k.max(1) as u64;
    let base = total / k;
    let remainder = total % k;

    let mut slices = Vec::new();
    let mut cursor = start;
    for i in 0..k {
        let size = base + if i < remainder { 1 } else { 0 };
        if size == 0 {
            continue;
        }
        let slice_end = cursor + size as i64 - 1;
        slices.push((cursor, slice_end));
        cursor = slice_end + 1;
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{RateLimitConfig, RateLimitController};
    use crate::session::mock::MockRemoteClient;
    use crate::session::{AuthArtifact, SessionPool};

    fn msg(id: i64) -> Message {
        Message {
            channel_id: 1,
            message_id: id,
            author_date: chrono::Utc::now(),
            text: None,
            caption: None,
            media_payload_ref: None,
            group_id: None,
            media_kind: crate::model::MediaKind::None,
            file_size: 0,
            file_name: None,
        }
    }

    #[test]
    fn slice_range_splits_evenly() {
        let slices = slice_range(1, 10, 2);
        assert_eq!(slices, vec![(1, 5), (6, 10)]);
    }

    #[test]
    fn slice_range_distributes_remainder_to_early_slices() {
        let slices = slice_range(1, 10, 3);
        assert_eq!(slices, vec![(1, 4), (5, 7), (8, 10)]);
    }

    #[test]
    fn slice_range_single_session() {
        assert_eq!(slice_range(5, 5, 1), vec![(5, 5)]);
    }

    async fn build_pool(messages: Vec<Message>) -> (Arc<SessionPool>, Arc<MockRemoteClient>) {
        let client = Arc::new(MockRemoteClient::new());
        client.seed(messages);
        let rl = Arc::new(RateLimitController::new(RateLimitConfig::default()));
        let pool = Arc::new(SessionPool::new(client.clone(), rl));
        pool.register("s1", true, Some(AuthArtifact(vec![1])));
        pool.register("s2", true, Some(AuthArtifact(vec![2])));
        pool.start_enabled().await.unwrap();
        (pool, client)
    }

    #[tokio::test]
    async fn fetch_merges_results_in_ascending_order() {
        let messages = vec![msg(103), msg(100), msg(101)];
        let (pool, _client) = build_pool(messages).await;
        let outcome = fetch(pool, ChannelRef::Username("src".into()), 100, 104).await;
        let ids: Vec<i64> = outcome.messages.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![100, 101, 103]);
        assert!(outcome.failed_ranges.is_empty());
    }

    #[tokio::test]
    async fn fetch_with_no_sessions_returns_empty() {
        let client = Arc::new(MockRemoteClient::new());
        let rl = Arc::new(RateLimitController::new(RateLimitConfig::default()));
        let pool = Arc::new(SessionPool::new(client, rl));
        let outcome = fetch(pool, ChannelRef::Username("src".into()), 1, 10).await;
        assert!(outcome.messages.is_empty());
        assert!(outcome.failed_ranges.is_empty());
    }

    #[tokio::test]
    async fn missing_message_ids_are_silently_skipped() {
        let messages = vec![msg(100), msg(102)];
        let (pool, _client) = build_pool(messages).await;
        let outcome = fetch(pool, ChannelRef::Username("src".into()), 100, 102).await;
        assert_eq!(outcome.messages.len(), 2);
    }
}
