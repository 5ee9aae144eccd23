pub mod pool;
pub mod state;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use pool::{SessionHandle, SessionPool, SessionRecord, CAPTION_CAP_NORMAL, CAPTION_CAP_PREMIUM};
pub use state::SessionState;
pub use transport::{
    AuthArtifact, MediaByteStream, MediaIdentifier, MediaSource, RemoteClient, RemoteMessageRef,
    SessionIdentity,
};
