//! Stage 2 — Regroup + Distribute: turn each acquired unit into per-
//! destination [`SendBatch`]es and execute the sends.

use std::sync::Arc;

use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::model::ChannelRef;
use crate::pipeline::batch::{regroup_with_cap, SendBatch, SEND_BATCH_CAP};
use crate::pipeline::stage1::AcquiredUnit;
use crate::ratelimit::{FloodWaitDecision, OpClass};
use crate::report::DestinationOutcome;
use crate::session::{MediaIdentifier, SessionPool};
use crate::template;

const DEFAULT_RETRY_COUNT: u32 = 3;

/// Run Stage 2 for one destination at a time, each destination's units
/// processed in source order; destinations themselves run concurrently.
pub async fn distribute_and_send(
    pool: Arc<SessionPool>,
    acquired: Vec<AcquiredUnit>,
    destinations: Vec<ChannelRef>,
    template: String,
    source_channel_name: String,
    batch_cap: usize,
    cancel: CancellationToken,
) -> Vec<DestinationOutcome> {
    let mut join_set: JoinSet<Vec<DestinationOutcome>> = JoinSet::new();

    for destination in destinations {
        let pool = Arc::clone(&pool);
        let acquired = acquired.clone();
        let template = template.clone();
        let source_channel_name = source_channel_name.clone();
        let cancel = cancel.clone();
        join_set.spawn(async move {
            send_to_destination(pool, acquired, destination, template, source_channel_name, batch_cap, cancel).await
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(mut partial) => outcomes.append(&mut partial),
            Err(e) => warn!(error = %e, "distribution worker task panicked"),
        }
    }
    outcomes
}

async fn send_to_destination(
    pool: Arc<SessionPool>,
    acquired: Vec<AcquiredUnit>,
    destination: ChannelRef,
    template: String,
    source_channel_name: String,
    batch_cap: usize,
    cancel: CancellationToken,
) -> Vec<DestinationOutcome> {
    let mut outcomes = Vec::new();

    for unit in &acquired {
        if cancel.is_cancelled() {
            break;
        }
        let session = unit.scratch.owning_session().to_string();
        let cap = pool.caption_cap(&session);
        let rendered = template::render_caption(&template, &unit.representative, &source_channel_name, cap);

        let mut batches = regroup_with_cap(&unit.scratch, batch_cap);
        for batch in &mut batches {
            batch.caption = Some(rendered.caption.clone());
        }

        for batch in batches {
            let outcome = send_batch_with_retry(&pool, &session, &destination, unit.source_id, batch, &cancel).await;
            outcomes.push(outcome);
        }
    }

    outcomes
}

async fn send_batch_with_retry(
    pool: &Arc<SessionPool>,
    session: &str,
    destination: &ChannelRef,
    source_id: i64,
    batch: SendBatch,
    cancel: &CancellationToken,
) -> DestinationOutcome {
    let mut retry_count = 0;

    loop {
        match pool.rate_limiter.admit(session, OpClass::Upload, cancel).await {
            Ok(()) => {}
            Err(e) => {
                return DestinationOutcome {
                    source_id,
                    destination: destination.clone(),
                    success: false,
                    remote_message_ids: Vec::new(),
                    error: Some(e.to_string()),
                    retry_count,
                };
            }
        }

        match send_batch_once(pool, session, destination, &batch).await {
            Ok(ids) => {
                pool.rate_limiter.observe_success();
                return DestinationOutcome {
                    source_id,
                    destination: destination.clone(),
                    success: true,
                    remote_message_ids: ids,
                    error: None,
                    retry_count,
                };
            }
            Err(crate::RelayError::RateLimited { seconds }) => {
                match pool.rate_limiter.observe_flood_wait(session, seconds) {
                    FloodWaitDecision::Absorb { seconds } => {
                        tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
                    }
                    FloodWaitDecision::Suspend { seconds } => {
                        if retry_count >= DEFAULT_RETRY_COUNT {
                            return DestinationOutcome {
                                source_id,
                                destination: destination.clone(),
                                success: false,
                                remote_message_ids: Vec::new(),
                                error: Some(format!("suspended for {seconds}s, retry budget exhausted")),
                                retry_count,
                            };
                        }
                        while let Some(remaining) = pool.rate_limiter.suspended_for(session) {
                            if cancel.is_cancelled() {
                                return DestinationOutcome {
                                    source_id,
                                    destination: destination.clone(),
                                    success: false,
                                    remote_message_ids: Vec::new(),
                                    error: Some("cancelled while suspended".to_string()),
                                    retry_count,
                                };
                            }
                            tokio::time::sleep(std::time::Duration::from_secs(remaining.min(5))).await;
                        }
                        retry_count += 1;
                    }
                }
            }
            Err(e) => {
                if retry_count >= DEFAULT_RETRY_COUNT {
                    return DestinationOutcome {
                        source_id,
                        destination: destination.clone(),
                        success: false,
                        remote_message_ids: Vec::new(),
                        error: Some(e.to_string()),
                        retry_count,
                    };
                }
                retry_count += 1;
                let jitter_ms = rand::thread_rng().gen_range(50..250);
                tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
            }
        }
    }
}

async fn send_batch_once(
    pool: &Arc<SessionPool>,
    session: &str,
    destination: &ChannelRef,
    batch: &SendBatch,
) -> Result<Vec<i64>, crate::RelayError> {
    let handle = pool.lease(session).await?;

    // Every batch — including singletons — forwards already-uploaded scratch
    // media by identifier, never re-uploading bytes.
    let items: Vec<(MediaIdentifier, crate::model::MediaKind)> = batch
        .handles
        .iter()
        .map(|h| (h.media_identifier.clone(), h.media_kind))
        .collect();
    let refs = handle
        .client
        .send_media_group(session, destination, &items, batch.caption.as_deref())
        .await?;
    handle.touch();
    Ok(refs.into_iter().map(|r| r.message_id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MediaKind, Message};
    use crate::pipeline::scratch::{ScratchHandle, ScratchUnit};
    use crate::ratelimit::{RateLimitConfig, RateLimitController};
    use crate::session::mock::MockRemoteClient;
    use crate::session::AuthArtifact;

    fn acquired_unit(id: i64, kind: MediaKind) -> AcquiredUnit {
        let handle = ScratchHandle {
            owning_session: "s1".to_string(),
            source_id: id,
            remote_message_id: id,
            media_kind: kind,
            media_identifier: MediaIdentifier(format!("media-{id}")),
            original_caption: Some("orig".to_string()),
            created_at: chrono::Utc::now(),
        };
        AcquiredUnit {
            source_id: id,
            scratch: ScratchUnit::Singleton(handle),
            representative: Message {
                channel_id: 1,
                message_id: id,
                author_date: chrono::Utc::now(),
                text: None,
                caption: Some("orig".to_string()),
                media_payload_ref: None,
                group_id: None,
                media_kind: kind,
                file_size: 10,
                file_name: None,
            },
        }
    }

    fn acquired_group(source_id: i64, kinds: &[MediaKind]) -> AcquiredUnit {
        let handles: Vec<ScratchHandle> = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| ScratchHandle {
                owning_session: "s1".to_string(),
                source_id,
                remote_message_id: source_id + i as i64,
                media_kind: *kind,
                media_identifier: MediaIdentifier(format!("media-{source_id}-{i}")),
                original_caption: Some("orig".to_string()),
                created_at: chrono::Utc::now(),
            })
            .collect();
        AcquiredUnit {
            source_id,
            scratch: ScratchUnit::Group(handles),
            representative: Message {
                channel_id: 1,
                message_id: source_id,
                author_date: chrono::Utc::now(),
                text: None,
                caption: Some("orig".to_string()),
                media_payload_ref: None,
                group_id: Some("g".to_string()),
                media_kind: kinds[0],
                file_size: 10,
                file_name: None,
            },
        }
    }

    async fn build_pool() -> (Arc<SessionPool>, Arc<MockRemoteClient>) {
        let client = Arc::new(MockRemoteClient::new());
        let rl = Arc::new(RateLimitController::new(RateLimitConfig::default()));
        let pool = Arc::new(SessionPool::new(client.clone(), rl));
        pool.register("s1", true, Some(AuthArtifact(vec![1])));
        pool.start_enabled().await.unwrap();
        (pool, client)
    }

    #[tokio::test]
    async fn successful_send_records_remote_ids() {
        let (pool, _client) = build_pool().await;
        let acquired = vec![acquired_unit(1, MediaKind::Photo)];
        let outcomes = distribute_and_send(
            pool,
            acquired,
            vec![ChannelRef::Username("dest".into())],
            template::DEFAULT_TEMPLATE.to_string(),
            "src".to_string(),
            SEND_BATCH_CAP,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].remote_message_ids.len(), 1);
    }

    #[tokio::test]
    async fn ordering_preserved_across_units_for_one_destination() {
        let (pool, _client) = build_pool().await;
        let acquired = vec![acquired_unit(1, MediaKind::Photo), acquired_unit(2, MediaKind::Photo)];
        let outcomes = distribute_and_send(
            pool,
            acquired,
            vec![ChannelRef::Username("dest".into())],
            template::DEFAULT_TEMPLATE.to_string(),
            "src".to_string(),
            SEND_BATCH_CAP,
            CancellationToken::new(),
        )
        .await;
        let ids: Vec<i64> = outcomes.iter().map(|o| o.source_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn caption_is_attached_to_every_batch_split_from_one_unit() {
        let (pool, client) = build_pool().await;
        // Photos then a document force a split into two compatibility-class
        // batches; both must carry the rendered caption.
        let acquired = vec![acquired_group(1, &[MediaKind::Photo, MediaKind::Photo, MediaKind::Document])];
        let _outcomes = distribute_and_send(
            pool,
            acquired,
            vec![ChannelRef::Username("dest".into())],
            "{original_caption}".to_string(),
            "src".to_string(),
            SEND_BATCH_CAP,
            CancellationToken::new(),
        )
        .await;
        // One send_media_group call per batch, each with its own first item
        // carrying the caption.
        let sent = client.sent.lock().unwrap();
        let captioned: Vec<_> = sent.iter().filter(|r| r.caption.is_some()).collect();
        assert_eq!(captioned.len(), 2);
        assert!(captioned.iter().all(|r| r.caption.as_deref() == Some("orig")));
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_succeeds() {
        let (pool, client) = build_pool().await;
        // The mock arms exactly one failure; the retry should then succeed.
        client.fail_session("s1", "down");
        let acquired = vec![acquired_unit(1, MediaKind::Photo)];
        let outcomes = distribute_and_send(
            pool,
            acquired,
            vec![ChannelRef::Username("dest".into())],
            template::DEFAULT_TEMPLATE.to_string(),
            "src".to_string(),
            SEND_BATCH_CAP,
            CancellationToken::new(),
        )
        .await;
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].retry_count, 1);
    }
}
