//! Configuration loading
//!
//! Effective configuration is resolved in priority order:
//! 1. Environment variables (SPINDLE_*)
//! 2. TOML config file
//! 3. Compiled defaults
//!
//! Defaults mirror the knobs the engine has always shipped with:
//! 512 KiB warmup reads, 25 s fetch timeout, 30 s autofill delay,
//! 25 tracks max per autofill pull, 10 per batch add, 3 per user,
//! volume 100 on a 0-200 scale.

use crate::fade_curves::FadeCurve;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How much of a track's audio to fetch ahead of playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchMode {
    /// Stream directly, no caching
    None,
    /// Fetch only the first `prefetch_bytes` bytes to prime CDN/TLS
    Warmup,
    /// Fetch and persist complete audio before playback starts
    Full,
}

impl PrefetchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(PrefetchMode::None),
            "warmup" => Some(PrefetchMode::Warmup),
            "full" => Some(PrefetchMode::Full),
            _ => None,
        }
    }
}

/// Cache / prefetch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub mode: PrefetchMode,
    /// Directory for cached audio files
    pub dir: PathBuf,
    /// Byte cap for warmup reads
    pub prefetch_bytes: u64,
    /// Per-fetch timeout in seconds
    pub timeout_secs: u64,
    /// LRU eviction kicks in above this many bytes on disk
    pub max_cache_bytes: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            mode: PrefetchMode::Full,
            dir: PathBuf::from("songs"),
            prefetch_bytes: 512 * 1024,
            timeout_secs: 25,
            max_cache_bytes: 512 * 1024 * 1024,
        }
    }
}

impl PrefetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Fade transition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FadeConfig {
    /// Fade-in window in milliseconds
    pub fade_in_ms: u64,
    /// Fade-out window for natural track end, milliseconds
    pub fade_out_ms: u64,
    /// Shortened fade-out used for skips, milliseconds
    pub skip_fade_out_ms: u64,
    /// Discrete gain steps per envelope
    pub steps: u32,
    /// Hard bound on sink teardown after fade-out begins, milliseconds
    pub hard_timeout_ms: u64,
    pub curve: FadeCurve,
}

impl Default for FadeConfig {
    fn default() -> Self {
        Self {
            fade_in_ms: 2000,
            fade_out_ms: 2000,
            skip_fade_out_ms: 500,
            steps: 20,
            hard_timeout_ms: 5000,
            curve: FadeCurve::Linear,
        }
    }
}

/// Queue throttle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Whether the per-add batch cap is enforced
    pub limit_enabled: bool,
    /// Max tracks accepted in one batch add
    pub max_per_add: usize,
    /// Hard cap of non-filler entries per user in the queue
    pub max_per_user: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            limit_enabled: true,
            max_per_add: 10,
            max_per_user: 3,
        }
    }
}

/// Idle-radio settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofillConfig {
    pub enabled: bool,
    /// Seconds of sustained emptiness before a pull
    pub delay_secs: u64,
    /// Max tracks enqueued per trigger
    pub max_pull: usize,
    /// Highest-priority source: playlist/profile URL
    pub source_url: Option<String>,
    /// Second source: CSV seed file of track references
    pub csv_path: Option<PathBuf>,
    /// Third source: per-user like sampling, this many per user
    pub likes_per_user: usize,
}

impl Default for AutofillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: 30,
            max_pull: 25,
            source_url: None,
            csv_path: None,
            likes_per_user: 5,
        }
    }
}

impl AutofillConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Full engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub prefetch: PrefetchConfig,
    pub fade: FadeConfig,
    pub queue: QueueConfig,
    pub autofill: AutofillConfig,
    /// Default volume on the 0-200 user scale (100 = unity gain)
    pub default_volume: u16,
    /// Prune the now-playing indicator after this many subsequent tracks
    pub nowplaying_prune_after: u32,
}

impl EngineConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| {
                    Error::Config(format!("cannot read {}: {}", p.display(), e))
                })?;
                toml::from_str(&text)
                    .map_err(|e| Error::Config(format!("invalid config {}: {}", p.display(), e)))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables win over the config file.
    fn apply_env(&mut self) {
        if let Some(v) = env_str("SPINDLE_PREFETCH_MODE") {
            if let Some(mode) = PrefetchMode::parse(&v) {
                self.prefetch.mode = mode;
            }
        }
        if let Some(v) = env_str("SPINDLE_PREFETCH_DIR") {
            self.prefetch.dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<u64>("SPINDLE_PREFETCH_BYTES") {
            self.prefetch.prefetch_bytes = v;
        }
        if let Some(v) = env_parse::<u64>("SPINDLE_PREFETCH_TIMEOUT") {
            self.prefetch.timeout_secs = v;
        }
        if let Some(v) = env_parse::<u64>("SPINDLE_AUTOFILL_DELAY_SEC") {
            self.autofill.delay_secs = v;
        }
        if let Some(v) = env_parse::<usize>("SPINDLE_AUTOFILL_MAX_PULL") {
            self.autofill.max_pull = v;
        }
        if let Some(v) = env_str("SPINDLE_AUTOFILL_URL") {
            if !v.trim().is_empty() {
                self.autofill.source_url = Some(v.trim().to_string());
            }
        }
        if let Some(v) = env_str("SPINDLE_AUTOFILL_CSV") {
            self.autofill.csv_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse::<usize>("SPINDLE_AUTOFILL_LIKES_PER_USER") {
            self.autofill.likes_per_user = v;
        }
        if let Some(v) = env_str("SPINDLE_AUTOFILL_FEATURE") {
            self.autofill.enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = env_parse::<usize>("SPINDLE_QUEUE_LIMIT_MAX_PER_ADD") {
            self.queue.max_per_add = v;
        }
        if let Some(v) = env_parse::<usize>("SPINDLE_QUEUE_MAX_PER_USER") {
            self.queue.max_per_user = v;
        }
        if let Some(v) = env_parse::<u16>("SPINDLE_DEFAULT_VOLUME") {
            self.default_volume = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.default_volume > 200 {
            return Err(Error::Config(format!(
                "default_volume must be 0-200, got {}",
                self.default_volume
            )));
        }
        if self.fade.steps == 0 {
            return Err(Error::Config("fade.steps must be at least 1".into()));
        }
        if self.queue.max_per_add == 0 || self.queue.max_per_user == 0 {
            return Err(Error::Config("queue limits must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefetch: PrefetchConfig::default(),
            fade: FadeConfig::default(),
            queue: QueueConfig::default(),
            autofill: AutofillConfig::default(),
            default_volume: 100,
            nowplaying_prune_after: 3,
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
