//! Stage 3 — Cleanup: reclaim every [`ScratchHandle`] once its consuming
//! sends have all completed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::pipeline::scratch::ScratchTable;
use crate::report::DestinationOutcome;
use crate::session::SessionPool;

/// Reclaim scratch for every unit whose sends all succeeded; units with at
/// least one failed destination are retained unless `cleanup_on_failure`.
/// Returns a description of every handle left outstanding, for the report.
pub async fn cleanup(
    pool: Arc<SessionPool>,
    table: Arc<ScratchTable>,
    destination_outcomes: &[DestinationOutcome],
    cleanup_on_failure: bool,
) -> Vec<String> {
    let failed_units: HashSet<i64> = destination_outcomes
        .iter()
        .filter(|o| !o.success)
        .map(|o| o.source_id)
        .collect();

    let sessions = table.sessions_with_outstanding();
    let mut join_set: JoinSet<Vec<String>> = JoinSet::new();

    for session in sessions {
        let pool = Arc::clone(&pool);
        let table = Arc::clone(&table);
        let failed_units = failed_units.clone();
        join_set.spawn(async move { cleanup_session(pool, table, session, failed_units, cleanup_on_failure).await });
    }

    let mut unreclaimed = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(mut partial) => unreclaimed.append(&mut partial),
            Err(e) => warn!(error = %e, "cleanup worker task panicked"),
        }
    }
    unreclaimed
}

async fn cleanup_session(
    pool: Arc<SessionPool>,
    table: Arc<ScratchTable>,
    session: String,
    failed_units: HashSet<i64>,
    cleanup_on_failure: bool,
) -> Vec<String> {
    let outstanding = table.outstanding(&session);
    if outstanding.is_empty() {
        return Vec::new();
    }

    let (reclaimable, retained): (Vec<_>, Vec<_>) = outstanding.into_iter().partition(|h| {
        cleanup_on_failure || !failed_units.contains(&h.source_id)
    });

    let mut unreclaimed: Vec<String> = retained
        .iter()
        .map(|h| format!("{}:{}", session, h.remote_message_id))
        .collect();

    if reclaimable.is_empty() {
        return unreclaimed;
    }

    let ids: Vec<i64> = reclaimable.iter().map(|h| h.remote_message_id).collect();
    match pool.lease(&session).await {
        Ok(handle) => match handle.client.delete_messages(&session, &crate::pipeline::stage1::SELF_CHAT, &ids).await {
            Ok(()) => {
                table.reclaim(&session, &ids);
                info!(session = %session, count = ids.len(), "stage 3 reclaimed scratch");
            }
            Err(e) => {
                warn!(session = %session, error = %e, "stage 3 delete failed, scratch retained");
                unreclaimed.extend(reclaimable.iter().map(|h| format!("{}:{}", session, h.remote_message_id)));
            }
        },
        Err(e) => {
            warn!(session = %session, error = %e, "could not lease session for cleanup");
            unreclaimed.extend(reclaimable.iter().map(|h| format!("{}:{}", session, h.remote_message_id)));
        }
    }

    unreclaimed
}

/// Best-effort reclamation within `deadline`, invoked when the pipeline is
/// aborted while scratch handles still exist. Residual handles are reported,
/// never silently dropped.
pub async fn emergency_cleanup(pool: Arc<SessionPool>, table: Arc<ScratchTable>, deadline: Duration) -> Vec<String> {
    let sessions = table.sessions_with_outstanding();
    let mut join_set: JoinSet<Vec<String>> = JoinSet::new();

    for session in sessions {
        let pool = Arc::clone(&pool);
        let table = Arc::clone(&table);
        join_set.spawn(async move {
            let outstanding = table.outstanding(&session);
            let ids: Vec<i64> = outstanding.iter().map(|h| h.remote_message_id).collect();
            let result = tokio::time::timeout(deadline, async {
                let handle = pool.lease(&session).await?;
                handle.client.delete_messages(&session, &crate::pipeline::stage1::SELF_CHAT, &ids).await
            })
            .await;

            match result {
                Ok(Ok(())) => {
                    table.reclaim(&session, &ids);
                    Vec::new()
                }
                _ => outstanding
                    .iter()
                    .map(|h| format!("{}:{}", session, h.remote_message_id))
                    .collect(),
            }
        });
    }

    let mut unreclaimed = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        if let Ok(mut partial) = joined {
            unreclaimed.append(&mut partial);
        }
    }
    unreclaimed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelRef, MediaKind};
    use crate::pipeline::scratch::ScratchHandle;
    use crate::pipeline::scratch::ScratchUnit;
    use crate::ratelimit::{RateLimitConfig, RateLimitController};
    use crate::session::mock::MockRemoteClient;
    use crate::session::{AuthArtifact, MediaIdentifier};

    async fn build_pool() -> (Arc<SessionPool>, Arc<MockRemoteClient>) {
        let client = Arc::new(MockRemoteClient::new());
        let rl = Arc::new(RateLimitController::new(RateLimitConfig::default()));
        let pool = Arc::new(SessionPool::new(client.clone(), rl));
        pool.register("s1", true, Some(AuthArtifact(vec![1])));
        pool.start_enabled().await.unwrap();
        (pool, client)
    }

    fn handle(id: i64) -> ScratchHandle {
        ScratchHandle {
            owning_session: "s1".to_string(),
            source_id: id,
            remote_message_id: id,
            media_kind: MediaKind::Photo,
            media_identifier: MediaIdentifier(format!("media-{id}")),
            original_caption: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn success_outcome(source_id: i64) -> DestinationOutcome {
        DestinationOutcome {
            source_id,
            destination: ChannelRef::Username("dest".into()),
            success: true,
            remote_message_ids: vec![source_id],
            error: None,
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn successful_run_reclaims_all_scratch() {
        let (pool, _client) = build_pool().await;
        let table = Arc::new(ScratchTable::new());
        table.record(&ScratchUnit::Singleton(handle(1)));

        let unreclaimed = cleanup(pool, table.clone(), &[success_outcome(1)], false).await;
        assert!(unreclaimed.is_empty());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn failed_run_retains_scratch_by_default() {
        let (pool, _client) = build_pool().await;
        let table = Arc::new(ScratchTable::new());
        table.record(&ScratchUnit::Singleton(handle(1)));

        let failure = DestinationOutcome {
            source_id: 1,
            destination: ChannelRef::Username("dest".into()),
            success: false,
            remote_message_ids: Vec::new(),
            error: Some("boom".to_string()),
            retry_count: 3,
        };

        let unreclaimed = cleanup(pool, table.clone(), &[failure], false).await;
        assert_eq!(unreclaimed.len(), 1);
        assert!(!table.is_empty());
    }

    #[tokio::test]
    async fn gating_is_per_unit_not_per_session() {
        let (pool, _client) = build_pool().await;
        let table = Arc::new(ScratchTable::new());
        // Two distinct units sharing a session: unit 1 failed, unit 2 succeeded.
        table.record(&ScratchUnit::Singleton(handle(1)));
        table.record(&ScratchUnit::Singleton(handle(2)));

        let outcomes = vec![
            DestinationOutcome {
                source_id: 1,
                destination: ChannelRef::Username("dest".into()),
                success: false,
                remote_message_ids: Vec::new(),
                error: Some("boom".to_string()),
                retry_count: 3,
            },
            success_outcome(2),
        ];

        let unreclaimed = cleanup(pool, table.clone(), &outcomes, false).await;
        assert_eq!(unreclaimed, vec!["s1:1".to_string()]);
        let remaining = table.outstanding("s1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].remote_message_id, 1);
    }

    #[tokio::test]
    async fn cleanup_on_failure_flag_forces_reclaim() {
        let (pool, _client) = build_pool().await;
        let table = Arc::new(ScratchTable::new());
        table.record(&ScratchUnit::Singleton(handle(1)));

        let failure = DestinationOutcome {
            source_id: 1,
            destination: ChannelRef::Username("dest".into()),
            success: false,
            remote_message_ids: Vec::new(),
            error: Some("boom".to_string()),
            retry_count: 3,
        };

        let unreclaimed = cleanup(pool, table.clone(), &[failure], true).await;
        assert!(unreclaimed.is_empty());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn emergency_cleanup_reports_residual_on_timeout() {
        let (pool, client) = build_pool().await;
        client.fail_session("s1", "unreachable");
        let table = Arc::new(ScratchTable::new());
        table.record(&ScratchUnit::Singleton(handle(1)));

        let residual = emergency_cleanup(pool, table, Duration::from_millis(50)).await;
        assert_eq!(residual.len(), 1);
    }
}
