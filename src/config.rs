use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::domain::MediaKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,

    pub collection: CollectionConfig,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    pub normalizer: NormalizerConfig,

    pub filter: FilterConfig,

    pub dedup: DedupConfig,

    pub notifications: NotificationConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            collection: CollectionConfig::default(),
            sources: vec![SourceConfig::default()],
            normalizer: NormalizerConfig::default(),
            filter: FilterConfig::default(),
            dedup: DedupConfig::default(),
            notifications: NotificationConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub database_path: String,

    pub log_level: String,

    /// Number of tokio worker threads (default: 2)
    /// Set to 0 to use the number of CPU cores
    pub worker_threads: usize,

    /// Maximum database connections (default: 5)
    pub max_db_connections: u32,

    /// Minimum database connections (default: 1)
    pub min_db_connections: u32,

    /// SQLite busy timeout applied to every pooled connection.
    pub busy_timeout_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: "sqlite:data/shinkan.db".to_string(),
            log_level: "info".to_string(),
            worker_threads: 2,
            max_db_connections: 5,
            min_db_connections: 1,
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Upper bound on sources fetched at the same time.
    pub max_concurrent_sources: usize,

    /// HTTP user agent sent to every upstream.
    pub user_agent: String,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sources: 3,
            user_agent: "Shinkan/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Anilist,
    Feed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub id: String,

    pub kind: SourceKind,

    pub enabled: bool,

    /// Endpoint override. Required for `feed` sources.
    pub url: Option<String>,

    /// Media kind assumed for records that carry no hint of their own.
    pub media_kind: Option<MediaKind>,

    /// Channel stamped on records that do not name one.
    pub default_channel: Option<String>,

    /// Published request quota of the upstream.
    pub requests_per_minute: u32,

    /// Requests allowed back-to-back before the limiter starts spacing them.
    pub burst: u32,

    pub request_timeout_seconds: u64,

    /// How far ahead of the since marker to ask for scheduled releases.
    pub lookahead_days: u32,

    pub breaker: BreakerConfig,

    pub retry: RetryConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            id: "anilist".to_string(),
            kind: SourceKind::Anilist,
            enabled: true,
            url: None,
            media_kind: None,
            default_channel: None,
            requests_per_minute: 30,
            burst: 1,
            request_timeout_seconds: 30,
            lookahead_days: 7,
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,

    /// Failures older than this no longer count towards the threshold.
    pub window_seconds: u64,

    /// How long an open breaker short-circuits before allowing a trial call.
    pub cooldown_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_seconds: 120,
            cooldown_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,

    pub initial_delay_ms: u64,

    pub max_delay_ms: u64,

    pub multiplier: f64,

    /// Randomization applied to each delay (0.0 disables jitter).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Lookup from lowercased channel spellings to their canonical name.
    pub channel_aliases: HashMap<String, String>,

    /// Channel used when neither the record nor the source names one.
    pub default_channel: String,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        let mut aliases = HashMap::new();
        for (alias, canonical) in [
            ("crunchyroll", "Crunchyroll"),
            ("cr", "Crunchyroll"),
            ("netflix", "Netflix"),
            ("hidive", "HIDIVE"),
            ("amazon", "Prime Video"),
            ("amazon prime video", "Prime Video"),
            ("prime video", "Prime Video"),
            ("kodansha", "Kodansha"),
            ("講談社", "Kodansha"),
            ("shueisha", "Shueisha"),
            ("集英社", "Shueisha"),
        ] {
            aliases.insert(alias.to_string(), canonical.to_string());
        }

        Self {
            channel_aliases: aliases,
            default_channel: "unspecified".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub exclude_keywords: Vec<String>,

    pub fuzzy_enabled: bool,

    pub fuzzy_threshold: f64,

    pub exclude_categories: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            exclude_keywords: vec![],
            fuzzy_enabled: true,
            fuzzy_threshold: 0.8,
            exclude_categories: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasGroup {
    pub canonical: String,
    pub variants: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub fuzzy_enabled: bool,

    pub fuzzy_threshold: f64,

    pub phonetic_enabled: bool,

    /// Phonetic keys shorter than this never match; short skeletons collide too easily.
    pub phonetic_min_key_len: usize,

    #[serde(default)]
    pub aliases: Vec<AliasGroup>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fuzzy_enabled: true,
            fuzzy_threshold: 0.85,
            phonetic_enabled: true,
            phonetic_min_key_len: 4,
            aliases: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Below this many pending releases a single immediate batch is sent (T1).
    pub single_batch_threshold: usize,

    /// At or above this many pending releases three batches are planned (T2).
    pub triple_batch_threshold: usize,

    /// Send times ("HH:MM") for the two-batch plan.
    pub two_batch_times: Vec<String>,

    /// Send times ("HH:MM") for the three-batch plan.
    pub three_batch_times: Vec<String>,

    /// Percentage of the pending set assigned to each batch of the two-batch plan.
    pub two_batch_split: Vec<u32>,

    /// Percentage of the pending set assigned to each batch of the three-batch plan.
    pub three_batch_split: Vec<u32>,

    /// Outbound send limit per channel and batch; overflow waits for the next run.
    pub max_per_batch: usize,

    /// Failed deliveries after which a release is flagged for manual review.
    pub max_attempts: u32,

    /// Notification channels that must all succeed before a release counts as notified.
    pub channels: Vec<String>,

    /// Offset of the operator's wall clock from UTC, used for batch send times.
    pub utc_offset_minutes: i32,

    /// Releases scheduled up to this many days ahead are already announced.
    pub lookahead_days: u32,

    /// Notified releases older than this are archived.
    pub retention_days: u32,

    pub webhook_url: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            single_batch_threshold: 50,
            triple_batch_threshold: 200,
            two_batch_times: vec!["09:00".to_string(), "18:00".to_string()],
            three_batch_times: vec![
                "08:00".to_string(),
                "13:00".to_string(),
                "19:00".to_string(),
            ],
            two_batch_split: vec![50, 50],
            three_batch_split: vec![40, 30, 30],
            max_per_batch: 100,
            max_attempts: 5,
            channels: vec!["log".to_string()],
            utc_offset_minutes: 0,
            lookahead_days: 0,
            retention_days: 90,
            webhook_url: None,
        }
    }
}

impl NotificationConfig {
    pub fn parsed_two_batch_times(&self) -> Result<Vec<NaiveTime>> {
        parse_times(&self.two_batch_times)
    }

    pub fn parsed_three_batch_times(&self) -> Result<Vec<NaiveTime>> {
        parse_times(&self.three_batch_times)
    }
}

fn parse_times(raw: &[String]) -> Result<Vec<NaiveTime>> {
    raw.iter()
        .map(|t| {
            NaiveTime::parse_from_str(t, "%H:%M")
                .with_context(|| format!("Invalid send time '{t}', expected HH:MM"))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,

    pub metrics_port: Option<u16>,

    pub loki_enabled: bool,

    pub loki_url: String,

    pub loki_labels: HashMap<String, String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "shinkan".to_string());

        Self {
            metrics_enabled: true,
            metrics_port: None,
            loki_enabled: false,
            loki_url: "http://localhost:3100".to_string(),
            loki_labels: labels,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        if let Ok(path) = std::env::var("SHINKAN_CONFIG") {
            info!("Loading config from SHINKAN_CONFIG: {}", path);
            return Self::load_from_path(Path::new(&path));
        }

        for path in &Self::config_paths() {
            if path.exists() {
                info!("Loading config from: {}", path.display());
                return Self::load_from_path(path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Config saved to: {}", path.display());
        Ok(())
    }

    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("shinkan").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".shinkan").join("config.toml"));
        }

        paths
    }

    pub fn create_default_if_missing() -> Result<bool> {
        let path = PathBuf::from("config.toml");
        if path.exists() {
            Ok(false)
        } else {
            Self::default().save_to_path(&path)?;
            info!("Created default config file: {}", path.display());
            Ok(true)
        }
    }

    /// Rejects configurations the run cannot safely start with.
    pub fn validate(&self) -> Result<()> {
        if self.general.max_db_connections == 0 {
            anyhow::bail!("general.max_db_connections must be > 0");
        }

        if self.collection.max_concurrent_sources == 0 {
            anyhow::bail!("collection.max_concurrent_sources must be > 0");
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                anyhow::bail!("Source id cannot be empty");
            }
            if !seen.insert(source.id.as_str()) {
                anyhow::bail!("Duplicate source id '{}'", source.id);
            }
            if source.requests_per_minute == 0 {
                anyhow::bail!("Source '{}': requests_per_minute must be > 0", source.id);
            }
            if source.breaker.failure_threshold == 0 {
                anyhow::bail!("Source '{}': breaker.failure_threshold must be > 0", source.id);
            }
            if source.retry.multiplier < 1.0 {
                anyhow::bail!("Source '{}': retry.multiplier must be >= 1.0", source.id);
            }
            if !(0.0..=1.0).contains(&source.retry.jitter) {
                anyhow::bail!("Source '{}': retry.jitter must be within 0..=1", source.id);
            }
            if source.kind == SourceKind::Feed && source.url.is_none() {
                anyhow::bail!("Feed source '{}' requires a url", source.id);
            }
            if let Some(raw) = &source.url {
                url::Url::parse(raw)
                    .with_context(|| format!("Source '{}': invalid url '{raw}'", source.id))?;
            }
        }

        for (name, value) in [
            ("filter.fuzzy_threshold", self.filter.fuzzy_threshold),
            ("dedup.fuzzy_threshold", self.dedup.fuzzy_threshold),
        ] {
            if value <= 0.0 || value > 1.0 {
                anyhow::bail!("{name} must be within (0, 1], got {value}");
            }
        }

        let n = &self.notifications;
        if n.single_batch_threshold == 0 || n.single_batch_threshold >= n.triple_batch_threshold {
            anyhow::bail!(
                "notifications thresholds must satisfy 0 < single_batch_threshold < triple_batch_threshold"
            );
        }
        if n.max_per_batch == 0 {
            anyhow::bail!("notifications.max_per_batch must be > 0");
        }
        if n.max_attempts == 0 {
            anyhow::bail!("notifications.max_attempts must be > 0");
        }
        if n.channels.is_empty() {
            anyhow::bail!("notifications.channels cannot be empty");
        }
        if n.parsed_two_batch_times()?.len() != 2 || n.two_batch_split.len() != 2 {
            anyhow::bail!("The two-batch plan needs exactly two send times and two split shares");
        }
        if n.parsed_three_batch_times()?.len() != 3 || n.three_batch_split.len() != 3 {
            anyhow::bail!(
                "The three-batch plan needs exactly three send times and three split shares"
            );
        }
        for split in [&n.two_batch_split, &n.three_batch_split] {
            if split.iter().sum::<u32>() != 100 {
                anyhow::bail!("Batch split shares must add up to 100, got {split:?}");
            }
        }
        if n.channels.iter().any(|c| c == "webhook") && n.webhook_url.is_none() {
            anyhow::bail!("The webhook channel requires notifications.webhook_url");
        }

        Ok(())
    }

    #[must_use]
    pub fn find_source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.notifications.single_batch_threshold, 50);
        assert_eq!(config.notifications.triple_batch_threshold, 200);
        assert!((config.dedup.fuzzy_threshold - 0.85).abs() < f64::EPSILON);
        assert!((config.filter.fuzzy_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.sources[0].breaker.failure_threshold, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[notifications]"));
        assert!(toml_str.contains("[[sources]]"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [general]
            log_level = "debug"

            [[sources]]
            id = "publisher"
            kind = "feed"
            url = "https://example.com/volumes.rss"
            media_kind = "serial-print"
            requests_per_minute = 10

            [dedup]
            fuzzy_threshold = 0.9

            [[dedup.aliases]]
            canonical = "Demon Tale"
            variants = ["デーモンテイル"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].kind, SourceKind::Feed);
        assert_eq!(config.sources[0].media_kind, Some(MediaKind::SerialPrint));
        assert_eq!(config.sources[0].retry.max_retries, 3);
        assert_eq!(config.dedup.aliases[0].variants[0], "デーモンテイル");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = Config::default();
        config.notifications.single_batch_threshold = 300;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.notifications.three_batch_split = vec![50, 30, 30];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.notifications.two_batch_times = vec!["9am".to_string(), "18:00".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_feed_without_url() {
        let mut config = Config::default();
        config.sources.push(SourceConfig {
            id: "feed".to_string(),
            kind: SourceKind::Feed,
            ..SourceConfig::default()
        });
        assert!(config.validate().is_err());
    }
}
