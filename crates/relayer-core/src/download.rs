//! Local-Download Workflow (C7): per-session sequential download of every
//! assigned [`AtomicUnit`]'s constituent media to a per-channel directory.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::FileNamingConfig;
use crate::distribute;
use crate::model::{Assignment, AtomicUnit, ChannelRef, MediaKind, Message};
use crate::ratelimit::{FloodWaitDecision, OpClass};
use crate::report::{UnitOutcome, UnitStatus};
use crate::session::SessionPool;

/// Consecutive hard (non-rate-limit) failures on one session before its
/// remaining queued messages are reassigned to another logged-in session.
const SESSION_ERROR_THRESHOLD: u32 = 3;

/// Errors that indicate the session itself, not just the one call, is
/// broken — these mark the session `error` immediately rather than waiting
/// out [`SESSION_ERROR_THRESHOLD`].
fn is_fatal_to_session(e: &crate::RelayError) -> bool {
    matches!(
        e,
        crate::RelayError::Authorization(_) | crate::RelayError::SessionNotFound(_)
    )
}

/// `(kind, size) -> include?` predicate supplied by the driver.
pub type FilterFn = Arc<dyn Fn(MediaKind, u64) -> bool + Send + Sync>;

pub struct DownloadOptions {
    pub dest_root: PathBuf,
    pub naming: FileNamingConfig,
    pub filter: Option<FilterFn>,
}

impl DownloadOptions {
    fn allows(&self, kind: MediaKind, size: u64) -> bool {
        match &self.filter {
            Some(f) => f(kind, size),
            None => true,
        }
    }
}

/// Download every unit in `assignment`, one worker task per session, running
/// concurrently. If a session enters `error` mid-run, its unfinished queued
/// messages are re-distributed across the remaining logged-in sessions and
/// another round of workers runs for just those; this repeats until nothing
/// is left or no sessions remain. Returns one [`UnitOutcome`] per
/// constituent `Message`.
pub async fn download_all(
    pool: Arc<SessionPool>,
    assignment: Assignment,
    source_channel: ChannelRef,
    source_channel_name: String,
    options: Arc<DownloadOptions>,
    cancel: CancellationToken,
) -> Vec<UnitOutcome> {
    let mut outcomes = Vec::new();
    let mut pending: Vec<(String, Vec<Message>)> = assignment
        .iter()
        .map(|(session, units)| {
            let messages = units.iter().flat_map(|u| u.messages().to_vec()).collect();
            (session.to_string(), messages)
        })
        .collect();

    loop {
        if cancel.is_cancelled() || pending.is_empty() {
            break;
        }

        let mut join_set: JoinSet<(Vec<UnitOutcome>, Vec<Message>)> = JoinSet::new();
        for (session, messages) in pending.drain(..) {
            let pool = Arc::clone(&pool);
            let channel = source_channel.clone();
            let channel_name = source_channel_name.clone();
            let options = Arc::clone(&options);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                download_session(pool, session, messages, channel, channel_name, options, cancel).await
            });
        }

        let mut orphaned: Vec<Message> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((mut batch, mut leftover)) => {
                    outcomes.append(&mut batch);
                    orphaned.append(&mut leftover);
                }
                Err(e) => warn!(error = %e, "download worker task panicked"),
            }
        }

        if orphaned.is_empty() {
            break;
        }

        let live_sessions = pool.list_logged_in();
        if live_sessions.is_empty() {
            for message in orphaned {
                outcomes.push(failed_outcome(&message, "", "no sessions available for reassignment"));
            }
            break;
        }

        info!(
            count = orphaned.len(),
            sessions = live_sessions.len(),
            "reassigning unfinished downloads from an errored session"
        );
        let orphan_units: Vec<AtomicUnit> = orphaned.into_iter().map(AtomicUnit::Singleton).collect();
        let reassigned = match distribute::distribute(orphan_units, &live_sessions) {
            Ok(a) => a,
            Err(_) => break,
        };
        pending = reassigned
            .iter()
            .map(|(session, units)| {
                let messages = units.iter().flat_map(|u| u.messages().to_vec()).collect();
                (session.to_string(), messages)
            })
            .collect();
    }

    outcomes
}

/// Process one session's queue; returns the outcomes it recorded plus any
/// messages still queued when the session was marked `error`, for the
/// caller to reassign.
async fn download_session(
    pool: Arc<SessionPool>,
    session: String,
    messages: Vec<Message>,
    channel: ChannelRef,
    channel_name: String,
    options: Arc<DownloadOptions>,
    cancel: CancellationToken,
) -> (Vec<UnitOutcome>, Vec<Message>) {
    let mut outcomes = Vec::new();
    let mut retry_queue: VecDeque<Message> = VecDeque::new();
    let mut primary: VecDeque<Message> = messages.into();
    let mut consecutive_failures: u32 = 0;

    'outer: while !primary.is_empty() || !retry_queue.is_empty() {
        if cancel.is_cancelled() {
            break;
        }

        let message = match primary.pop_front() {
            Some(m) => m,
            None => {
                // Primary queue drained; wait for the session's back-off, if
                // any, then drain the retry queue.
                while let Some(secs) = pool.rate_limiter.suspended_for(&session) {
                    if cancel.is_cancelled() {
                        break 'outer;
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(secs.min(5))).await;
                }
                match retry_queue.pop_front() {
                    Some(m) => m,
                    None => break,
                }
            }
        };

        if !options.allows(message.media_kind, message.file_size) {
            outcomes.push(UnitOutcome {
                source_id: message.message_id,
                session: session.clone(),
                status: UnitStatus::Skipped,
                bytes: 0,
            });
            continue;
        }

        match pool.rate_limiter.admit(&session, OpClass::Download, &cancel).await {
            Ok(()) => {}
            Err(crate::RelayError::RateLimited { seconds }) => {
                match pool.rate_limiter.observe_flood_wait(&session, seconds) {
                    FloodWaitDecision::Absorb { seconds } => {
                        tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
                        primary.push_front(message);
                    }
                    FloodWaitDecision::Suspend { .. } => {
                        retry_queue.push_back(message);
                    }
                }
                continue;
            }
            Err(e) => {
                outcomes.push(failed_outcome(&message, &session, "admission failed"));
                consecutive_failures += 1;
                if is_fatal_to_session(&e) || consecutive_failures >= SESSION_ERROR_THRESHOLD {
                    pool.mark_error(&session, e.to_string());
                    return (outcomes, drain_remaining(primary, retry_queue));
                }
                continue;
            }
        }

        match download_one(&pool, &session, &channel, &channel_name, &message, &options).await {
            Ok(bytes) => {
                pool.rate_limiter.observe_success();
                consecutive_failures = 0;
                outcomes.push(UnitOutcome {
                    source_id: message.message_id,
                    session: session.clone(),
                    status: UnitStatus::Success,
                    bytes,
                });
            }
            Err(crate::RelayError::RateLimited { seconds }) => {
                match pool.rate_limiter.observe_flood_wait(&session, seconds) {
                    FloodWaitDecision::Absorb { seconds } => {
                        tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
                        primary.push_front(message);
                    }
                    FloodWaitDecision::Suspend { .. } => {
                        retry_queue.push_back(message);
                    }
                }
            }
            Err(e) => {
                warn!(session = %session, message_id = message.message_id, error = %e, "download failed");
                outcomes.push(failed_outcome(&message, &session, &e.to_string()));
                consecutive_failures += 1;
                if is_fatal_to_session(&e) || consecutive_failures >= SESSION_ERROR_THRESHOLD {
                    pool.mark_error(&session, e.to_string());
                    return (outcomes, drain_remaining(primary, retry_queue));
                }
            }
        }
    }

    (outcomes, Vec::new())
}

fn drain_remaining(primary: VecDeque<Message>, retry_queue: VecDeque<Message>) -> Vec<Message> {
    primary.into_iter().chain(retry_queue).collect()
}

fn failed_outcome(message: &Message, session: &str, reason: &str) -> UnitOutcome {
    UnitOutcome {
        source_id: message.message_id,
        session: session.to_string(),
        status: UnitStatus::Failed {
            reason: reason.to_string(),
        },
        bytes: 0,
    }
}

async fn download_one(
    pool: &Arc<SessionPool>,
    session: &str,
    channel: &ChannelRef,
    channel_name: &str,
    message: &Message,
    options: &DownloadOptions,
) -> Result<u64, crate::RelayError> {
    let handle = pool.lease(session).await?;

    let bytes = if message.media_kind.prefers_small_file_path(message.file_size) {
        handle.client.download_media_small(session, message).await?
    } else {
        let mut stream = handle.client.stream_media(session, message).await?;
        let mut buf = Vec::with_capacity(message.file_size as usize);
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        buf
    };
    handle.touch();

    if message.file_size > 0 && bytes.len() as u64 != message.file_size {
        return Err(crate::RelayError::Transient(format!(
            "short read: expected {} bytes, got {}",
            message.file_size,
            bytes.len()
        )));
    }

    let dir = options.dest_root.join(sanitize_component(channel_name));
    tokio::fs::create_dir_all(&dir).await?;
    let file_name = build_file_name(&options.naming, message, channel_name, channel);
    let final_path = dir.join(&file_name);
    let tmp_path = dir.join(format!("{file_name}.partial"));

    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
    }
    tokio::fs::rename(&tmp_path, &final_path).await?;

    Ok(bytes.len() as u64)
}

/// Render the `{source-date}_{message-id}_{channel-name}_{original-filename}`
/// pattern and sanitize the result for the filesystem.
fn build_file_name(
    naming: &FileNamingConfig,
    message: &Message,
    channel_name: &str,
    channel: &ChannelRef,
) -> String {
    let source_date = message.author_date.format("%Y%m%d").to_string();
    let original = message
        .file_name
        .clone()
        .unwrap_or_else(|| format!("media_{}", media_kind_extension(message.media_kind)));
    let channel_label = if channel_name.is_empty() {
        channel.to_string()
    } else {
        channel_name.to_string()
    };

    let rendered = naming
        .pattern
        .replace("{source-date}", &source_date)
        .replace("{message-id}", &message.message_id.to_string())
        .replace("{channel-name}", &channel_label)
        .replace("{original-filename}", &original);

    sanitize_file_name(&rendered, naming)
}

fn media_kind_extension(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "jpg",
        MediaKind::Video => "mp4",
        MediaKind::Audio => "mp3",
        MediaKind::Voice => "ogg",
        MediaKind::VideoNote => "mp4",
        MediaKind::Animation => "gif",
        MediaKind::Document => "bin",
        MediaKind::None => "bin",
    }
}

fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

/// Strip path separators and control characters, reject reserved names, and
/// truncate to `naming.max_length`, guaranteeing a non-empty result.
fn sanitize_file_name(name: &str, naming: &FileNamingConfig) -> String {
    let mut cleaned: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();

    if cleaned.trim().is_empty() {
        cleaned = "unnamed".to_string();
    }

    let stem = cleaned.split('.').next().unwrap_or(&cleaned).to_uppercase();
    if naming.reserved_names.iter().any(|r| r == &stem) {
        cleaned = format!("_{cleaned}");
    }

    if cleaned.chars().count() > naming.max_length {
        cleaned = cleaned.chars().take(naming.max_length).collect();
    }

    cleaned
}
