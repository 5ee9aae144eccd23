//! Run configuration: read once at startup from a JSON document, never
//! re-read during a run.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::ratelimit::RateLimitConfig;

/// One configured session enrolment entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    pub name: String,
    /// Path to the session's persisted, opaque auth artifact, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_artifact_path: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// The `{source-date}_{message-id}_{channel-name}_{original-filename}.{ext}`
/// pattern plus filesystem-safety bounds for the Local-Download Workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FileNamingConfig {
    pub pattern: String,
    pub max_length: usize,
    pub reserved_names: Vec<String>,
}

impl Default for FileNamingConfig {
    fn default() -> Self {
        Self {
            pattern: "{source-date}_{message-id}_{channel-name}_{original-filename}".to_string(),
            max_length: 200,
            reserved_names: [
                "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2",
                "LPT3", "LPT4",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

/// A single `(media-kind, size-range) -> include?` filter rule. Rules are
/// evaluated in order; the first matching rule decides. An item matching no
/// rule is included.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FilterRule {
    pub kind: Option<crate::model::MediaKind>,
    #[serde(default)]
    pub min_size: Option<u64>,
    #[serde(default)]
    pub max_size: Option<u64>,
    pub include: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MediaFilterConfig {
    pub rules: Vec<FilterRule>,
}

impl MediaFilterConfig {
    pub fn allows(&self, kind: crate::model::MediaKind, size: u64) -> bool {
        for rule in &self.rules {
            if let Some(want) = rule.kind {
                if want != kind {
                    continue;
                }
            }
            if let Some(min) = rule.min_size {
                if size < min {
                    continue;
                }
            }
            if let Some(max) = rule.max_size {
                if size > max {
                    continue;
                }
            }
            return rule.include;
        }
        true
    }
}

/// Top-level run configuration, read once at process startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunConfig {
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub file_naming: FileNamingConfig,
    #[serde(default)]
    pub default_filters: MediaFilterConfig,
}

impl RunConfig {
    /// Load a `RunConfig` from a JSON document on disk.
    pub async fn load(path: impl AsRef<Path>) -> Result<RunConfig, RelayError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: RunConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Persist the configuration as pretty-printed JSON, mainly for tests
    /// and the CLI's `--init-config` helper.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), RelayError> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path.as_ref(), content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaKind;

    fn sample_config() -> RunConfig {
        RunConfig {
            sessions: vec![SessionConfig {
                name: "alpha".to_string(),
                auth_artifact_path: Some("/var/lib/relayer/alpha.bin".to_string()),
                enabled: true,
            }],
            rate_limits: RateLimitConfig::default(),
            file_naming: FileNamingConfig::default(),
            default_filters: MediaFilterConfig::default(),
        }
    }

    #[tokio::test]
    async fn round_trip_save_then_load_preserves_config() {
        let config = sample_config();
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("relayer.json");

        config.save(&path).await.expect("save should succeed");
        let loaded = RunConfig::load(&path).await.expect("load should succeed");

        assert_eq!(loaded.sessions.len(), 1);
        assert_eq!(loaded.sessions[0].name, "alpha");
        assert_eq!(
            loaded.rate_limits.global_per_minute,
            config.rate_limits.global_per_minute
        );
    }

    #[tokio::test]
    async fn load_error_for_nonexistent_file() {
        let result = RunConfig::load("/nonexistent/path/relayer.json").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn load_error_for_invalid_json() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, b"not json")
            .await
            .expect("write should succeed");
        let result = RunConfig::load(&path).await;
        assert!(result.is_err());
    }

    #[test]
    fn default_file_naming_matches_documented_pattern() {
        let naming = FileNamingConfig::default();
        assert!(naming.pattern.contains("{source-date}"));
        assert!(naming.pattern.contains("{message-id}"));
        assert!(naming.pattern.contains("{channel-name}"));
        assert!(naming.pattern.contains("{original-filename}"));
    }

    #[test]
    fn filter_with_no_rules_allows_everything() {
        let filters = MediaFilterConfig::default();
        assert!(filters.allows(MediaKind::Video, 10_000_000_000));
    }

    #[test]
    fn filter_first_matching_rule_wins() {
        let filters = MediaFilterConfig {
            rules: vec![
                FilterRule {
                    kind: Some(MediaKind::Video),
                    min_size: None,
                    max_size: None,
                    include: false,
                },
                FilterRule {
                    kind: None,
                    min_size: None,
                    max_size: None,
                    include: true,
                },
            ],
        };
        assert!(!filters.allows(MediaKind::Video, 100));
        assert!(filters.allows(MediaKind::Photo, 100));
    }

    #[test]
    fn filter_size_bounds_are_inclusive() {
        let filters = MediaFilterConfig {
            rules: vec![FilterRule {
                kind: None,
                min_size: Some(100),
                max_size: Some(200),
                include: true,
            }],
        };
        assert!(filters.allows(MediaKind::Document, 100));
        assert!(filters.allows(MediaKind::Document, 200));
        assert!(!filters.allows(MediaKind::Document, 99));
    }
}
