use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::IndexError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// How long one store call waits on a locked database before reporting
    /// it busy to the batch retry loop.
    #[serde(default = "default_db_busy_timeout_ms")]
    pub db_busy_timeout_ms: u64,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    #[serde(default)]
    pub duplicates: DuplicateConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Files handed to one prepare/persist transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Capacity of the walker → scanner channel.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Directory entries read per second by the walker. 0 disables pacing.
    #[serde(default)]
    pub io_rate_per_sec: u32,

    #[serde(default = "default_stat_retries")]
    pub stat_retries: u32,

    #[serde(default = "default_stat_backoff_ms")]
    pub stat_backoff_ms: u64,

    /// Default scan mode when the caller does not choose one.
    #[serde(default)]
    pub fast_scan: bool,

    /// Upper bound on paths one fast scan may hand to the enrichment worker.
    #[serde(default = "default_max_enrich_backlog")]
    pub max_enrich_backlog: usize,

    /// Retries of a whole batch when the store reports lock contention.
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,

    /// Index/enrichment operations allowed in flight at once.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Additional extension → kind mappings, e.g. `{ "jxl" = "image" }`.
    #[serde(default)]
    pub extra_extensions: HashMap<String, String>,
}

fn default_batch_size() -> usize {
    200
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_stat_retries() -> u32 {
    3
}

fn default_stat_backoff_ms() -> u64 {
    25
}

fn default_max_enrich_backlog() -> usize {
    10_000
}

fn default_busy_retries() -> u32 {
    3
}

fn default_max_in_flight() -> usize {
    4
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            queue_capacity: default_queue_capacity(),
            io_rate_per_sec: 0,
            stat_retries: default_stat_retries(),
            stat_backoff_ms: default_stat_backoff_ms(),
            fast_scan: false,
            max_enrich_backlog: default_max_enrich_backlog(),
            busy_retries: default_busy_retries(),
            max_in_flight: default_max_in_flight(),
            extra_extensions: HashMap::new(),
        }
    }
}

impl ScannerConfig {
    pub fn stat_backoff(&self) -> Duration {
        Duration::from_millis(self.stat_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_days")]
    pub ttl_days: u32,

    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// Minimum spacing between two maintenance passes.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_cache_ttl_days() -> u32 {
    30
}

fn default_cache_max_entries() -> usize {
    100_000
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_cache_ttl_days(),
            max_entries: default_cache_max_entries(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.ttl_days) * 24 * 60 * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_max_queue")]
    pub max_queue: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// How long an interactive read holds the worker off the store.
    #[serde(default = "default_interaction_pause_ms")]
    pub interaction_pause_ms: u64,

    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

fn default_chunk_size() -> usize {
    16
}

fn default_max_queue() -> usize {
    50_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_interaction_pause_ms() -> u64 {
    1500
}

fn default_idle_poll_ms() -> u64 {
    250
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_queue: default_max_queue(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            interaction_pause_ms: default_interaction_pause_ms(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl EnrichmentConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn interaction_pause(&self) -> Duration {
        Duration::from_millis(self.interaction_pause_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateConfig {
    /// Maximum Hamming distance for two perceptual hashes to count as near duplicates.
    #[serde(default = "default_hamming_threshold")]
    pub hamming_threshold: u32,

    #[serde(default = "default_max_group_members")]
    pub max_group_members: usize,

    #[serde(default = "default_max_pairs")]
    pub max_pairs: usize,

    #[serde(default = "default_hash_chunk_bytes")]
    pub hash_chunk_bytes: usize,

    /// Assets hashed per background pass.
    #[serde(default = "default_hash_batch")]
    pub hash_batch: usize,
}

fn default_hamming_threshold() -> u32 {
    10
}

fn default_max_group_members() -> usize {
    50
}

fn default_max_pairs() -> usize {
    1000
}

fn default_hash_chunk_bytes() -> usize {
    64 * 1024
}

fn default_hash_batch() -> usize {
    64
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            hamming_threshold: default_hamming_threshold(),
            max_group_members: default_max_group_members(),
            max_pairs: default_max_pairs(),
            hash_chunk_bytes: default_hash_chunk_bytes(),
            hash_batch: default_hash_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_exiftool_path")]
    pub exiftool_path: PathBuf,

    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,

    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,

    /// Extra time granted per file in a batched call.
    #[serde(default = "default_per_item_timeout_ms")]
    pub per_item_timeout_ms: u64,

    /// Read EXIF in-process when the exiftool binary is missing.
    #[serde(default = "default_native_exif_fallback")]
    pub native_exif_fallback: bool,
}

fn default_exiftool_path() -> PathBuf {
    PathBuf::from("exiftool")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_tool_timeout_secs() -> u64 {
    15
}

fn default_per_item_timeout_ms() -> u64 {
    500
}

fn default_native_exif_fallback() -> bool {
    true
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            exiftool_path: default_exiftool_path(),
            ffprobe_path: default_ffprobe_path(),
            timeout_secs: default_tool_timeout_secs(),
            per_item_timeout_ms: default_per_item_timeout_ms(),
            native_exif_fallback: default_native_exif_fallback(),
        }
    }
}

impl ToolsConfig {
    /// Wall-clock budget for one invocation covering `items` files.
    pub fn timeout_for(&self, items: usize) -> Duration {
        let extra = self.per_item_timeout_ms.saturating_mul(items.saturating_sub(1) as u64);
        Duration::from_secs(self.timeout_secs) + Duration::from_millis(extra)
    }
}

fn default_db_busy_timeout_ms() -> u64 {
    5_000
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mediadex")
        .join("mediadex.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            db_busy_timeout_ms: default_db_busy_timeout_ms(),
            scanner: ScannerConfig::default(),
            cache: CacheConfig::default(),
            enrichment: EnrichmentConfig::default(),
            duplicates: DuplicateConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl Config {
    pub fn db_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.db_busy_timeout_ms)
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.scanner.batch_size == 0 {
            return Err(IndexError::InvalidInput("scanner.batch_size must be > 0".into()));
        }
        if self.scanner.queue_capacity == 0 {
            return Err(IndexError::InvalidInput("scanner.queue_capacity must be > 0".into()));
        }
        if self.scanner.max_in_flight == 0 {
            return Err(IndexError::InvalidInput("scanner.max_in_flight must be > 0".into()));
        }
        if self.enrichment.chunk_size == 0 {
            return Err(IndexError::InvalidInput("enrichment.chunk_size must be > 0".into()));
        }
        if self.enrichment.max_attempts == 0 {
            return Err(IndexError::InvalidInput("enrichment.max_attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mediadex")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("MEDIADEX_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}
