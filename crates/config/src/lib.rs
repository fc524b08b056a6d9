//! # Config - ShoalKV engine settings
//!
//! [`EngineConfig`] gathers every tunable of the storage engine. Values come
//! from [`Default`], can be overridden through `SHOALKV_*` environment
//! variables with [`EngineConfig::from_env`], and are checked with
//! [`EngineConfig::validate`] before the engine opens.
//!
//! ```text
//! SHOALKV_DATA_DIR                data directory              (default: "data")
//! SHOALKV_MEMTABLE_KB             memtable flush threshold    (default: 4096 KiB)
//! SHOALKV_WAL_SYNC                fsync every WAL append      (default: true)
//! SHOALKV_BLOCK_SIZE              segment data block bytes    (default: 4096)
//! SHOALKV_BLOOM_FPR               bloom false positive rate   (default: 0.01)
//! SHOALKV_COMPACTION_TRIGGER      segments before compaction  (default: 4, 0 = off)
//! SHOALKV_MAX_COMPACTION_INPUTS   segments merged per run     (default: 8)
//! SHOALKV_TARGET_SEGMENT_MB       max compaction output size  (default: 64)
//! SHOALKV_BACKGROUND              run background worker       (default: true)
//! SHOALKV_BACKGROUND_INTERVAL_MS  worker poll interval        (default: 1000)
//! SHOALKV_MAX_RETRIES             flush/compaction retries    (default: 3)
//! SHOALKV_RETRY_BACKOFF_MS        first retry delay           (default: 50)
//! SHOALKV_VERIFY_SEGMENTS         check block CRCs on open    (default: true)
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Prefix shared by every environment variable this crate reads.
pub const ENV_PREFIX: &str = "SHOALKV_";

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable was set but could not be parsed.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    /// A setting is outside its allowed range.
    #[error("{field} {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

/// Storage engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Directory holding the WAL files, segments, manifest and lock file.
    pub data_dir: PathBuf,
    /// Memtable size in bytes at which it is sealed and queued for flush.
    pub memtable_size_limit: usize,
    /// fsync the WAL on every append.
    pub wal_sync: bool,
    /// Target size of a segment data block.
    pub block_size: usize,
    /// Bloom filter false positive rate for new segments.
    pub bloom_fpr: f64,
    /// Number of live segments that triggers compaction. `0` disables
    /// automatic compaction.
    pub compaction_trigger: usize,
    /// Upper bound on segments merged by one compaction run.
    pub max_compaction_inputs: usize,
    /// Compaction output is split into segments of at most this many bytes.
    pub target_segment_bytes: u64,
    /// Run flush and compaction on a background thread. When `false`,
    /// sealed memtables are flushed inline by the writer that sealed them.
    pub background_work: bool,
    /// How often the background worker wakes up without being signalled.
    pub background_interval: Duration,
    /// Retries for a failed flush or compaction before giving up the cycle.
    pub max_retries: u32,
    /// Delay before the first retry; doubled on each further attempt.
    pub retry_backoff: Duration,
    /// Validate every block checksum when opening segments at startup.
    pub verify_segments_on_open: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            memtable_size_limit: 4 * 1024 * 1024,
            wal_sync: true,
            block_size: 4 * 1024,
            bloom_fpr: 0.01,
            compaction_trigger: 4,
            max_compaction_inputs: 8,
            target_segment_bytes: 64 * 1024 * 1024,
            background_work: true,
            background_interval: Duration::from_millis(1000),
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
            verify_segments_on_open: true,
        }
    }
}

impl EngineConfig {
    /// Default settings rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `SHOALKV_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut cfg = Self::default();

        if let Some(dir) = env.raw("DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(kb) = env.parse::<usize>("MEMTABLE_KB")? {
            cfg.memtable_size_limit = kb.saturating_mul(1024);
        }
        if let Some(sync) = env.parse_bool("WAL_SYNC")? {
            cfg.wal_sync = sync;
        }
        if let Some(bs) = env.parse("BLOCK_SIZE")? {
            cfg.block_size = bs;
        }
        if let Some(fpr) = env.parse("BLOOM_FPR")? {
            cfg.bloom_fpr = fpr;
        }
        if let Some(trigger) = env.parse("COMPACTION_TRIGGER")? {
            cfg.compaction_trigger = trigger;
        }
        if let Some(inputs) = env.parse("MAX_COMPACTION_INPUTS")? {
            cfg.max_compaction_inputs = inputs;
        }
        if let Some(mb) = env.parse::<u64>("TARGET_SEGMENT_MB")? {
            cfg.target_segment_bytes = mb.saturating_mul(1024 * 1024);
        }
        if let Some(bg) = env.parse_bool("BACKGROUND")? {
            cfg.background_work = bg;
        }
        if let Some(ms) = env.parse("BACKGROUND_INTERVAL_MS")? {
            cfg.background_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env.parse("MAX_RETRIES")? {
            cfg.max_retries = n;
        }
        if let Some(ms) = env.parse("RETRY_BACKOFF_MS")? {
            cfg.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(verify) = env.parse_bool("VERIFY_SEGMENTS")? {
            cfg.verify_segments_on_open = verify;
        }

        Ok(cfg)
    }

    /// Checks that every setting is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(out_of_range("data_dir", "must not be empty"));
        }
        if self.memtable_size_limit == 0 {
            return Err(out_of_range("memtable_size_limit", "must be greater than 0"));
        }
        if !(64..=1024 * 1024).contains(&self.block_size) {
            return Err(out_of_range("block_size", "must be between 64 B and 1 MiB"));
        }
        if !(self.bloom_fpr > 0.0 && self.bloom_fpr < 1.0) {
            return Err(out_of_range("bloom_fpr", "must be in (0, 1)"));
        }
        if self.max_compaction_inputs < 2 {
            return Err(out_of_range("max_compaction_inputs", "must be at least 2"));
        }
        if self.target_segment_bytes < self.block_size as u64 {
            return Err(out_of_range(
                "target_segment_bytes",
                "must be at least one block",
            ));
        }
        if self.background_interval.is_zero() {
            return Err(out_of_range("background_interval", "must be non-zero"));
        }
        Ok(())
    }
}

fn out_of_range(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        reason: reason.to_string(),
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn key(name: &str) -> String {
        format!("{}{}", ENV_PREFIX, name)
    }

    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(&Self::key(name)).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        match self.raw(name) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: Self::key(name),
                    value,
                }),
        }
    }

    fn parse_bool(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        match self.raw(name) {
            None => Ok(None),
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidValue {
                    key: Self::key(name),
                    value,
                }),
            },
        }
    }
}
