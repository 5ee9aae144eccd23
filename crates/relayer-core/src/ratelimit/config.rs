use serde::{Deserialize, Serialize};

/// Tuning overrides for the three-tier Rate-Limit Controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
    /// Global service-wide permits per minute across all sessions.
    pub global_per_minute: u32,
    /// Permits per minute for the download op-class.
    pub download_per_minute: u32,
    /// Permits per minute for the upload op-class.
    pub upload_per_minute: u32,
    /// Permits per minute for an individual session.
    pub per_session_per_minute: u32,
    /// Flood-waits at or below this many seconds are absorbed inline;
    /// above it the session is suspended.
    pub flood_wait_absorb_threshold_secs: u64,
    /// Number of recent flood-waits (within `flood_wait_window_secs`) that
    /// triggers a multiplicative rate reduction.
    pub flood_wait_trigger_count: u32,
    /// Window over which recent flood-waits are counted.
    pub flood_wait_window_secs: u64,
    /// Multiplier applied to a tier's quota when tuning down (e.g. 0.5).
    pub tune_down_factor: f64,
    /// Multiplier applied to a tier's quota when tuning up (e.g. 1.1).
    pub tune_up_factor: f64,
    /// Success rate (0.0-1.0) above which sustained-success recovery fires.
    pub success_recovery_threshold: f64,
    /// Default bounded retry count for transient errors.
    pub default_retry_count: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_per_minute: 30,
            download_per_minute: 20,
            upload_per_minute: 20,
            per_session_per_minute: 10,
            flood_wait_absorb_threshold_secs: 10,
            flood_wait_trigger_count: 3,
            flood_wait_window_secs: 300,
            tune_down_factor: 0.5,
            tune_up_factor: 1.1,
            success_recovery_threshold: 0.95,
            default_retry_count: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_reasonable() {
        let c = RateLimitConfig::default();
        assert_eq!(c.global_per_minute, 30);
        assert_eq!(c.download_per_minute, 20);
        assert_eq!(c.upload_per_minute, 20);
        assert_eq!(c.per_session_per_minute, 10);
        assert_eq!(c.flood_wait_absorb_threshold_secs, 10);
    }
}
