//! An in-memory [`RemoteClient`] fixture used by the crate's own test suite
//! (and available to `relayer-cli` for smoke tests) in place of a real
//! transport, which is out of scope for this crate.
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream;

use crate::error::RelayError;
use crate::model::{ChannelRef, MediaKind, Message};
use crate::session::transport::{
    AuthArtifact, MediaByteStream, MediaIdentifier, MediaSource, RemoteClient, RemoteMessageRef,
    SessionIdentity,
};

#[derive(Debug, Clone)]
pub struct SentRecord {
    pub session: String,
    pub dest: ChannelRef,
    pub kind: MediaKind,
    pub caption: Option<String>,
}

/// Deterministic fixture implementing [`RemoteClient`] purely in memory.
pub struct MockRemoteClient {
    fixture: DashMap<i64, Message>,
    media_bytes: DashMap<i64, Vec<u8>>,
    pub sent: Mutex<Vec<SentRecord>>,
    pub deleted: Mutex<Vec<(String, Vec<i64>)>>,
    next_remote_id: AtomicI64,
    flood_waits: DashMap<String, u64>,
    failing_sessions: DashMap<String, String>,
    permanently_failing: DashMap<String, String>,
}

impl Default for MockRemoteClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemoteClient {
    pub fn new() -> Self {
        Self {
            fixture: DashMap::new(),
            media_bytes: DashMap::new(),
            sent: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            next_remote_id: AtomicI64::new(1),
            flood_waits: DashMap::new(),
            failing_sessions: DashMap::new(),
            permanently_failing: DashMap::new(),
        }
    }

    pub fn seed(&self, messages: Vec<Message>) {
        for m in messages {
            self.fixture.insert(m.message_id, m);
        }
    }

    pub fn seed_media(&self, message_id: i64, bytes: Vec<u8>) {
        self.media_bytes.insert(message_id, bytes);
    }

    /// Arrange for the next call from `session` to fail with a flood-wait.
    pub fn arm_flood_wait(&self, session: &str, seconds: u64) {
        self.flood_waits.insert(session.to_string(), seconds);
    }

    pub fn fail_session(&self, session: &str, reason: &str) {
        self.failing_sessions
            .insert(session.to_string(), reason.to_string());
    }

    /// Unlike [`Self::fail_session`], this is never consumed — every call
    /// against `session` fails until the test drops the client.
    pub fn fail_session_permanently(&self, session: &str, reason: &str) {
        self.permanently_failing
            .insert(session.to_string(), reason.to_string());
    }

    fn check_armed_failures(&self, session: &str) -> Result<(), RelayError> {
        if let Some(reason) = self.permanently_failing.get(session) {
            return Err(RelayError::Transient(reason.clone()));
        }
        if let Some((_, seconds)) = self.flood_waits.remove(session) {
            return Err(RelayError::RateLimited { seconds });
        }
        if let Some((_, reason)) = self.failing_sessions.remove(session) {
            return Err(RelayError::Transient(reason));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for MockRemoteClient {
    async fn connect(&self, artifact: &AuthArtifact) -> Result<SessionIdentity, RelayError> {
        let is_premium = artifact.0.first() == Some(&9);
        Ok(SessionIdentity {
            remote_id: 1,
            name: "mock".to_string(),
            is_premium,
        })
    }

    async fn disconnect(&self, _session: &str) {}

    async fn fetch_messages(
        &self,
        session: &str,
        _channel: &ChannelRef,
        ids: &[i64],
    ) -> Result<Vec<Message>, RelayError> {
        self.check_armed_failures(session)?;
        let mut out: Vec<Message> = ids
            .iter()
            .filter_map(|id| self.fixture.get(id).map(|e| e.clone()))
            .collect();
        out.sort_by_key(|m| m.message_id);
        Ok(out)
    }

    async fn download_media_small(
        &self,
        session: &str,
        message: &Message,
    ) -> Result<Vec<u8>, RelayError> {
        self.check_armed_failures(session)?;
        Ok(self
            .media_bytes
            .get(&message.message_id)
            .map(|e| e.clone())
            .unwrap_or_else(|| vec![0u8; message.file_size as usize]))
    }

    async fn stream_media(
        &self,
        session: &str,
        message: &Message,
    ) -> Result<MediaByteStream, RelayError> {
        self.check_armed_failures(session)?;
        let bytes = self
            .media_bytes
            .get(&message.message_id)
            .map(|e| e.clone())
            .unwrap_or_else(|| vec![0u8; message.file_size as usize]);
        let chunks: Vec<Result<Vec<u8>, RelayError>> =
            bytes.chunks(4096).map(|c| Ok(c.to_vec())).collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn send_media(
        &self,
        session: &str,
        dest: &ChannelRef,
        kind: MediaKind,
        _source: MediaSource,
        caption: Option<&str>,
    ) -> Result<RemoteMessageRef, RelayError> {
        self.check_armed_failures(session)?;
        let id = self.next_remote_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(SentRecord {
            session: session.to_string(),
            dest: dest.clone(),
            kind,
            caption: caption.map(|s| s.to_string()),
        });
        Ok(RemoteMessageRef {
            message_id: id,
            media_identifier: MediaIdentifier(format!("media-{id}")),
        })
    }

    async fn send_media_group(
        &self,
        session: &str,
        dest: &ChannelRef,
        items: &[(MediaIdentifier, MediaKind)],
        caption_on_first: Option<&str>,
    ) -> Result<Vec<RemoteMessageRef>, RelayError> {
        self.check_armed_failures(session)?;
        let mut out = Vec::with_capacity(items.len());
        for (i, (_media_id, kind)) in items.iter().enumerate() {
            let id = self.next_remote_id.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().unwrap().push(SentRecord {
                session: session.to_string(),
                dest: dest.clone(),
                kind: *kind,
                caption: if i == 0 {
                    caption_on_first.map(|s| s.to_string())
                } else {
                    None
                },
            });
            out.push(RemoteMessageRef {
                message_id: id,
                media_identifier: MediaIdentifier(format!("media-{id}")),
            });
        }
        Ok(out)
    }

    async fn delete_messages(
        &self,
        session: &str,
        _chat: &ChannelRef,
        ids: &[i64],
    ) -> Result<(), RelayError> {
        self.check_armed_failures(session)?;
        self.deleted
            .lock()
            .unwrap()
            .push((session.to_string(), ids.to_vec()));
        Ok(())
    }
}

/// Count how many messages were sent to a given destination, for test
/// assertions.
pub fn sent_count(client: &MockRemoteClient, dest: &ChannelRef) -> usize {
    client
        .sent
        .lock()
        .unwrap()
        .iter()
        .filter(|r| &r.dest == dest)
        .count()
}
