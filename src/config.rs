//! Crawler configuration: serde-backed file config plus typed conversions
//! into the runtime policy objects.
//!
//! Every duration here is a tuning default, not a contract; tests zero the
//! pacing fields and shrink the retry windows. The JSON shape is stable:
//! unknown fields are rejected so a typo in a knob name fails loudly at
//! load time instead of silently running with defaults.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::BatchConfig;
use crate::fetch::Pacing;
use crate::platform::Platform;
use crate::proxy::{ProxyEndpoint, ProxyPool, Strategy, DEFAULT_DEACTIVATE_AFTER};
use crate::retry::RetryPolicy;

/// Configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file content is not a valid config document.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level crawler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CrawlerConfig {
    /// Per-request transport timeout in seconds.
    pub request_timeout_secs: u64,
    /// Cap on posts/videos collected per crawl.
    pub max_notes: usize,
    /// Cap on root comments collected per post.
    pub max_comments_per_item: usize,
    /// Cap on sub-comments collected under each root comment.
    pub max_sub_comments_per_item: usize,
    /// Fetch comments at all.
    pub enable_comments: bool,
    /// Descend into second-level comments.
    pub enable_sub_comments: bool,
    /// Random wait window between page fetches, seconds.
    pub crawl_interval_secs: (f64, f64),
    pub batch: BatchSettings,
    pub retry: RetrySettings,
    pub proxy: ProxySettings,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            max_notes: 200,
            max_comments_per_item: 100,
            max_sub_comments_per_item: 20,
            enable_comments: true,
            enable_sub_comments: false,
            crawl_interval_secs: (1.0, 3.0),
            batch: BatchSettings::default(),
            retry: RetrySettings::default(),
            proxy: ProxySettings::default(),
        }
    }
}

/// Batch scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BatchSettings {
    /// Maximum in-flight tasks per group.
    pub max_concurrency: usize,
    /// Tasks per sequential group.
    pub batch_size: usize,
    /// Per-group deadline in seconds; 0 disables the deadline.
    pub group_timeout_secs: u64,
    /// Random wait window between groups, seconds.
    pub group_interval_secs: (f64, f64),
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            batch_size: 10,
            group_timeout_secs: 120,
            group_interval_secs: (1.0, 3.0),
        }
    }
}

/// Retry policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    /// Wait window after an IP block, seconds.
    pub ip_block_wait_secs: (u64, u64),
    /// Wait window after a rate limit, seconds.
    pub frequency_wait_secs: (u64, u64),
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            ip_block_wait_secs: (30, 180),
            frequency_wait_secs: (10, 30),
            base_backoff_ms: 1000,
            max_backoff_ms: 60_000,
        }
    }
}

/// Proxy pool knobs and the endpoint roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProxySettings {
    pub strategy: Strategy,
    /// Consecutive failures before an endpoint leaves rotation.
    pub deactivate_after: u32,
    /// Configured endpoints; empty means every request goes direct.
    pub endpoints: Vec<ProxyEndpoint>,
    /// Acceptable exit regions per platform, for the geo strategy.
    pub geo_regions: BTreeMap<Platform, Vec<String>>,
    /// URL the health checker probes through benched endpoints.
    pub health_check_url: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            deactivate_after: DEFAULT_DEACTIVATE_AFTER,
            endpoints: Vec::new(),
            geo_regions: BTreeMap::new(),
            health_check_url: None,
        }
    }
}

impl CrawlerConfig {
    /// Loads a config document from a JSON file.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when the file is unreadable or does not match the
    /// schema.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Transport timeout as a duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Inter-page pacing profile.
    #[must_use]
    pub fn pacing(&self) -> Pacing {
        let (low, high) = self.crawl_interval_secs;
        Pacing {
            page_interval: (
                Duration::from_secs_f64(low.max(0.0)),
                Duration::from_secs_f64(high.max(0.0)),
            ),
        }
    }

    /// Retry policy derived from the retry settings.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            ip_block_wait: (
                Duration::from_secs(self.retry.ip_block_wait_secs.0),
                Duration::from_secs(self.retry.ip_block_wait_secs.1),
            ),
            frequency_wait: (
                Duration::from_secs(self.retry.frequency_wait_secs.0),
                Duration::from_secs(self.retry.frequency_wait_secs.1),
            ),
            base_backoff: Duration::from_millis(self.retry.base_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    /// Batch scheduler configuration.
    #[must_use]
    pub fn batch_config(&self) -> BatchConfig {
        let (low, high) = self.batch.group_interval_secs;
        BatchConfig {
            concurrency: self.batch.max_concurrency.max(1),
            batch_size: self.batch.batch_size.max(1),
            group_timeout: (self.batch.group_timeout_secs > 0)
                .then(|| Duration::from_secs(self.batch.group_timeout_secs)),
            group_interval: (
                Duration::from_secs_f64(low.max(0.0)),
                Duration::from_secs_f64(high.max(0.0)),
            ),
        }
    }

    /// Builds the proxy pool the settings describe.
    #[must_use]
    pub fn proxy_pool(&self) -> ProxyPool {
        let mut pool = ProxyPool::new(self.proxy.strategy)
            .with_endpoints(self.proxy.endpoints.iter().cloned())
            .with_deactivate_after(self.proxy.deactivate_after);
        for (platform, regions) in &self.proxy.geo_regions {
            pool = pool.with_geo_regions(*platform, regions.clone());
        }
        pool
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trips_through_json() {
        let config = CrawlerConfig::default();
        let raw = serde_json::to_string(&config).unwrap();
        let back: CrawlerConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.max_notes, config.max_notes);
        assert_eq!(back.proxy.strategy, Strategy::RoundRobin);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let raw = r#"{"max_notes": 10, "max_nots": 10}"#;
        assert!(serde_json::from_str::<CrawlerConfig>(raw).is_err());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let raw = r#"{"max_notes": 25, "proxy": {"strategy": "smart"}}"#;
        let config: CrawlerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.max_notes, 25);
        assert_eq!(config.proxy.strategy, Strategy::Smart);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.max_sub_comments_per_item, 20);
    }

    #[test]
    fn test_zero_group_timeout_disables_deadline() {
        let config = CrawlerConfig {
            batch: BatchSettings {
                group_timeout_secs: 0,
                ..BatchSettings::default()
            },
            ..CrawlerConfig::default()
        };
        assert!(config.batch_config().group_timeout.is_none());
    }

    #[test]
    fn test_geo_regions_deserialize_by_platform_name() {
        let raw = r#"{"proxy": {"geo_regions": {"xhs": ["CN", "HK"]}}}"#;
        let config: CrawlerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(
            config.proxy.geo_regions.get(&Platform::Xhs).unwrap(),
            &vec!["CN".to_string(), "HK".to_string()]
        );
    }

    #[test]
    fn test_retry_policy_conversion() {
        let config = CrawlerConfig::default();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.ip_block_wait.0, Duration::from_secs(30));
        assert_eq!(policy.max_backoff, Duration::from_secs(60));
    }
}
