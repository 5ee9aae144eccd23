use std::collections::HashMap;

/// A point-in-time view of the controller's state, used by schedulers to
/// choose which session to dispatch next.
#[derive(Debug, Clone, Default)]
pub struct RateLimitSnapshot {
    pub per_session_calls: HashMap<String, u64>,
    /// Seconds remaining before a suspended session may be dispatched again.
    pub backoff_remaining_secs: HashMap<String, u64>,
    pub success_rate: f64,
    pub download_quota_per_minute: u32,
    pub upload_quota_per_minute: u32,
}
