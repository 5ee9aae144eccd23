use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::model::{ChannelRef, MediaKind, Message};

/// Opaque per-session authentication blob managed by the transport library;
/// the core never inspects its contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthArtifact(pub Vec<u8>);

/// Identity information returned by a successful connect, used to record
/// Premium capability (governs the caption-length cap).
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub remote_id: i64,
    pub name: String,
    pub is_premium: bool,
}

/// Bytes to upload for a media send: either fully in memory (small-file path)
/// or a streaming source (large-file path).
pub enum MediaSource {
    InMemory(Vec<u8>),
    Stream(MediaByteStream),
}

/// A boxed async byte stream, used for `stream_media` downloads and large
/// uploads.
pub type MediaByteStream =
    Pin<Box<dyn Stream<Item = Result<Vec<u8>, RelayError>> + Send>>;

/// An opaque media identifier usable in a subsequent batch-send call without
/// re-uploading bytes (the ScratchHandle's payload reference).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaIdentifier(pub String);

/// A reference to a message the remote service has just created (the result
/// of a send/send-group call).
#[derive(Debug, Clone)]
pub struct RemoteMessageRef {
    pub message_id: i64,
    pub media_identifier: MediaIdentifier,
}

/// The remote chat/channel service's client surface, as consumed by the core
/// Implementations of this trait — the
/// authenticated transport itself — are explicitly out of scope; the core
/// only depends on this contract.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn connect(&self, artifact: &AuthArtifact) -> Result<SessionIdentity, RelayError>;

    async fn disconnect(&self, session: &str);

    async fn fetch_messages(
        &self,
        session: &str,
        channel: &ChannelRef,
        ids: &[i64],
    ) -> Result<Vec<Message>, RelayError>;

    async fn download_media_small(
        &self,
        session: &str,
        message: &Message,
    ) -> Result<Vec<u8>, RelayError>;

    async fn stream_media(
        &self,
        session: &str,
        message: &Message,
    ) -> Result<MediaByteStream, RelayError>;

    /// Send one media item; used both for genuine singleton sends and for
    /// Stage 1's self-chat acquisition.
    async fn send_media(
        &self,
        session: &str,
        dest: &ChannelRef,
        kind: MediaKind,
        source: MediaSource,
        caption: Option<&str>,
    ) -> Result<RemoteMessageRef, RelayError>;

    /// Send a group of already-uploaded media identifiers as one album.
    async fn send_media_group(
        &self,
        session: &str,
        dest: &ChannelRef,
        items: &[(MediaIdentifier, MediaKind)],
        caption_on_first: Option<&str>,
    ) -> Result<Vec<RemoteMessageRef>, RelayError>;

    async fn delete_messages(
        &self,
        session: &str,
        chat: &ChannelRef,
        ids: &[i64],
    ) -> Result<(), RelayError>;
}
