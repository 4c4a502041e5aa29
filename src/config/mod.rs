use crate::actor::Feature;
use crate::error::{GatewayError, Result};
use crate::observability::TracingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Shared counter and lock store; in-memory when absent
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    /// Quota limiter behaviour
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Actor sources
    #[serde(default)]
    pub sources: SourcesConfig,
    /// Usage alerting
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Operator endpoints
    #[serde(default)]
    pub admin: AdminConfig,
    /// Where admitted requests are forwarded, per feature
    #[serde(default)]
    pub upstreams: HashMap<Feature, String>,
    /// OpenTelemetry export
    #[serde(default)]
    pub observability: Option<ObservabilityConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

/// Quota limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Rewrite counter TTLs that are longer than the configured interval
    #[serde(default = "default_true")]
    pub update_rate_limit_ttl: bool,
    /// Concurrency sub-quota derivation
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

/// Concurrency sub-quota derivation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyConfig {
    /// Fraction of the 24h-equivalent limit allowed within one concurrency interval
    #[serde(default = "default_concurrency_percentage")]
    pub percentage: f64,
    /// Length of the rolling "in flight" window in seconds
    #[serde(default = "default_concurrency_interval")]
    pub interval_secs: u64,
}

impl ConcurrencyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// A per-feature quota as written in configuration or returned by an entitlement service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Models this quota applies to
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Maximum requests per interval
    pub limit: i64,
    /// Quota window in seconds
    pub interval_secs: u64,
}

impl RateLimitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Actor source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Base period of the leader-elected sync worker in seconds
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Anonymous access
    #[serde(default)]
    pub anonymous: Option<AnonymousSourceConfig>,
    /// Subscription token resolution
    #[serde(default)]
    pub subscriptions: Option<SubscriptionSourceConfig>,
}

impl SourcesConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

/// Anonymous source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymousSourceConfig {
    /// Whether requests without credentials are admitted at all
    #[serde(default)]
    pub allow: bool,
    /// Quotas shared by all anonymous requests
    #[serde(default)]
    pub rate_limits: HashMap<Feature, RateLimitConfig>,
}

/// Subscription source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSourceConfig {
    /// Prefix identifying tokens this source owns
    #[serde(default = "default_token_prefix")]
    pub token_prefix: String,
    /// Entitlement service base URL; static entitlements are used when absent
    #[serde(default)]
    pub entitlements_url: Option<String>,
    /// Bearer token for the entitlement service (supports `env://` and `file://`)
    #[serde(default)]
    pub entitlements_token: Option<String>,
    /// Entitlements served without an external service
    #[serde(default)]
    pub entitlements: Vec<crate::actor::subscription::Entitlement>,
    /// How long resolved entitlements stay cached, in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Maximum number of cached entitlements
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    /// Minimum time between on-demand refreshes of one actor, in seconds
    #[serde(default = "default_update_cooldown")]
    pub update_cooldown_secs: u64,
}

/// Usage alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Slack incoming webhook (supports `env://` and `file://`); alerts are logged when absent
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
    /// Ascending usage percentages per actor source name
    #[serde(default)]
    pub thresholds: HashMap<String, Vec<u32>>,
    /// Expiry of the per-actor alert lock in seconds
    #[serde(default = "default_alert_lock_ttl")]
    pub lock_ttl_secs: u64,
}

/// Operator endpoint configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Bearer secret for diagnostics endpoints (supports `env://` and `file://`);
    /// diagnostics are disabled when absent
    #[serde(default)]
    pub diagnostics_secret: Option<String>,
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// OTLP endpoint
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    /// Sample rate (0.0 to 1.0)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

impl ObservabilityConfig {
    pub fn tracing_config(&self) -> TracingConfig {
        TracingConfig {
            otlp_endpoint: self.otlp_endpoint.clone(),
            sample_rate: self.sample_rate,
            ..TracingConfig::default()
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

fn default_concurrency_percentage() -> f64 {
    0.1
}

fn default_concurrency_interval() -> u64 {
    10
}

fn default_sync_interval() -> u64 {
    60
}

fn default_token_prefix() -> String {
    "gw_".to_string()
}

fn default_cache_ttl() -> u64 {
    24 * 60 * 60
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_update_cooldown() -> u64 {
    5 * 60
}

fn default_alert_lock_ttl() -> u64 {
    30
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            update_rate_limit_ttl: default_true(),
            concurrency: ConcurrencyConfig::default(),
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            percentage: default_concurrency_percentage(),
            interval_secs: default_concurrency_interval(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval(),
            anonymous: None,
            subscriptions: None,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            slack_webhook_url: None,
            thresholds: HashMap::new(),
            lock_ttl_secs: default_alert_lock_ttl(),
        }
    }
}

fn validate_rate_limit(what: &str, feature: &Feature, limit: &RateLimitConfig) -> Result<()> {
    if limit.limit <= 0 {
        return Err(GatewayError::Config(format!(
            "{} rate limit for {} must be > 0",
            what, feature
        )));
    }
    if limit.interval_secs == 0 {
        return Err(GatewayError::Config(format!(
            "{} rate limit interval for {} must be > 0",
            what, feature
        )));
    }
    if limit.allowed_models.is_empty() {
        return Err(GatewayError::Config(format!(
            "{} rate limit for {} must allow at least one model",
            what, feature
        )));
    }
    Ok(())
}

fn validate_url(what: &str, value: &str) -> Result<()> {
    // Secret references are resolved later
    if value.starts_with("env://") || value.starts_with("file://") {
        return Ok(());
    }
    let url = Url::parse(value)
        .map_err(|e| GatewayError::Config(format!("Invalid {} '{}': {}", what, value, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(GatewayError::Config(format!(
            "{} must start with http:// or https://",
            what
        )));
    }
    Ok(())
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(redis) = &self.redis {
            if !redis.url.starts_with("redis://") && !redis.url.starts_with("rediss://") {
                return Err(GatewayError::Config(
                    "Redis URL must start with redis:// or rediss://".to_string(),
                ));
            }
        }

        let concurrency = &self.limits.concurrency;
        if !(concurrency.percentage > 0.0 && concurrency.percentage <= 1.0) {
            return Err(GatewayError::Config(
                "Concurrency percentage must be in (0, 1]".to_string(),
            ));
        }
        if concurrency.interval_secs == 0 {
            return Err(GatewayError::Config(
                "Concurrency interval must be > 0".to_string(),
            ));
        }

        if self.sources.sync_interval_secs == 0 {
            return Err(GatewayError::Config(
                "Source sync interval must be > 0".to_string(),
            ));
        }

        if let Some(anonymous) = &self.sources.anonymous {
            for (feature, limit) in &anonymous.rate_limits {
                validate_rate_limit("Anonymous", feature, limit)?;
            }
        }

        if let Some(subscriptions) = &self.sources.subscriptions {
            if subscriptions.token_prefix.is_empty() {
                return Err(GatewayError::Config(
                    "Subscription token prefix cannot be empty".to_string(),
                ));
            }
            if let Some(url) = &subscriptions.entitlements_url {
                validate_url("entitlements_url", url)?;
            }
            for entitlement in &subscriptions.entitlements {
                if entitlement.id.is_empty() {
                    return Err(GatewayError::Config(
                        "Entitlement id cannot be empty".to_string(),
                    ));
                }
                for (feature, limit) in &entitlement.rate_limits {
                    validate_rate_limit(&format!("Entitlement {}", entitlement.id), feature, limit)?;
                }
            }
        }

        for (feature, upstream) in &self.upstreams {
            validate_url(&format!("upstream for {}", feature), upstream)?;
        }

        if let Some(webhook) = &self.notify.slack_webhook_url {
            validate_url("slack_webhook_url", webhook)?;
        }
        for (source, thresholds) in &self.notify.thresholds {
            if thresholds.windows(2).any(|w| w[0] >= w[1]) {
                return Err(GatewayError::Config(format!(
                    "Alert thresholds for {} must be strictly ascending",
                    source
                )));
            }
        }
        if self.notify.lock_ttl_secs == 0 {
            return Err(GatewayError::Config(
                "Alert lock TTL must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a default configuration for testing
    pub fn default_config() -> Self {
        Self {
            server: ServerConfig::default(),
            redis: None,
            limits: LimitsConfig::default(),
            sources: SourcesConfig::default(),
            notify: NotifyConfig::default(),
            admin: AdminConfig::default(),
            upstreams: HashMap::new(),
            observability: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_config() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 9090

redis:
  url: "redis://localhost:6379"

limits:
  update_rate_limit_ttl: false
  concurrency:
    percentage: 0.05
    interval_secs: 15

sources:
  sync_interval_secs: 120
  anonymous:
    allow: true
    rate_limits:
      chat_completions:
        allowed_models: ["anthropic/claude-3-haiku"]
        limit: 50
        interval_secs: 86400
  subscriptions:
    entitlements:
      - id: "sub-1"
        name: "Acme"
        token_hashes: ["abc123"]
        rate_limits:
          code_completions:
            allowed_models: ["fireworks/starcoder"]
            limit: 1000
            interval_secs: 86400

upstreams:
  chat_completions: "http://llm-proxy.internal:8000/v1/chat/completions"

notify:
  slack_webhook_url: "https://hooks.slack.com/services/T/B/X"
  thresholds:
    subscription: [90, 95, 100]
"#;

        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert!(!config.limits.update_rate_limit_ttl);
        assert_eq!(config.limits.concurrency.interval(), Duration::from_secs(15));
        assert_eq!(config.sources.sync_interval(), Duration::from_secs(120));

        let anonymous = config.sources.anonymous.as_ref().unwrap();
        assert!(anonymous.allow);
        assert_eq!(anonymous.rate_limits[&Feature::ChatCompletions].limit, 50);

        let subscriptions = config.sources.subscriptions.as_ref().unwrap();
        assert_eq!(subscriptions.token_prefix, "gw_");
        assert_eq!(subscriptions.entitlements[0].id, "sub-1");
        assert_eq!(config.notify.thresholds["subscription"], vec![90, 95, 100]);
        assert!(config.upstreams.contains_key(&Feature::ChatCompletions));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_values() {
        let config = GatewayConfig::from_yaml("{}").unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert!(config.redis.is_none());
        assert!(config.limits.update_rate_limit_ttl);
        assert_eq!(config.limits.concurrency.percentage, 0.1);
        assert_eq!(config.limits.concurrency.interval_secs, 10);
        assert_eq!(config.sources.sync_interval_secs, 60);
        assert_eq!(config.notify.lock_ttl_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rate_limit_without_models() {
        let yaml = r#"
sources:
  anonymous:
    allow: true
    rate_limits:
      embeddings:
        limit: 10
        interval_secs: 60
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_thresholds_ascending() {
        let mut config = GatewayConfig::default_config();
        config
            .notify
            .thresholds
            .insert("anonymous".to_string(), vec![90, 50]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_webhook() {
        let mut config = GatewayConfig::default_config();
        config.notify.slack_webhook_url = Some("ftp://example.com".to_string());
        assert!(config.validate().is_err());

        config.notify.slack_webhook_url = Some("env://SLACK_WEBHOOK".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_redis_url() {
        let mut config = GatewayConfig::default_config();
        config.redis = Some(RedisConfig {
            url: "localhost:6379".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  port: 7000").unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 7000);
        assert!(GatewayConfig::from_file("/nonexistent/gateway.yaml").is_err());
    }
}
