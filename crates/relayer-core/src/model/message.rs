use serde::{Deserialize, Serialize};

/// A channel reference as accepted on the CLI or in config: either a
/// `@username` handle or a raw numeric channel id (negative ids are the
/// service's convention for supergroups/channels).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRef {
    Username(String),
    Id(i64),
}

impl std::fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelRef::Username(name) => write!(f, "@{name}"),
            ChannelRef::Id(id) => write!(f, "{id}"),
        }
    }
}

/// Kind of media carried by a message; `None` for plain-text messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Voice,
    VideoNote,
    Animation,
    Document,
    None,
}

impl MediaKind {
    /// Declared size < 50 MiB *and* kind not video uses the
    /// small-file API path.
    pub fn prefers_small_file_path(self, declared_size: u64) -> bool {
        const SMALL_FILE_THRESHOLD: u64 = 50 * 1024 * 1024;
        declared_size < SMALL_FILE_THRESHOLD && self != MediaKind::Video
    }

    /// Stage-2 regrouping compatibility class.
    pub fn batch_class(self) -> BatchClass {
        match self {
            MediaKind::Photo | MediaKind::Video => BatchClass::PhotoVideoMixed,
            MediaKind::Document => BatchClass::DocumentGroup,
            MediaKind::Audio => BatchClass::AudioGroup,
            MediaKind::Voice | MediaKind::VideoNote | MediaKind::Animation => {
                BatchClass::Singleton
            }
            MediaKind::None => BatchClass::Singleton,
        }
    }
}

/// The compatibility class a [`MediaKind`] belongs to for batch regrouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchClass {
    PhotoVideoMixed,
    DocumentGroup,
    AudioGroup,
    Singleton,
}

/// An immutable message as retrieved from the source channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Message {
    pub channel_id: i64,
    pub message_id: i64,
    pub author_date: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_payload_ref: Option<String>,
    /// Present iff the message is part of an atomic media group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub media_kind: MediaKind,
    /// Declared file size in bytes; 0 if no media.
    #[serde(default)]
    pub file_size: u64,
    /// Original on-service filename, if any (documents mainly).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl Message {
    pub fn has_media(&self) -> bool {
        self.media_kind != MediaKind::None
    }

    pub fn weight(&self) -> u64 {
        self.file_size
    }
}
