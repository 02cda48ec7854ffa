//! Configuration for the in-process frame cache benchmark.

use frame_cache::parse_size;
use serde::Deserialize;
use std::time::Duration;

/// Top-level configuration.
#[derive(Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    /// Engine configuration, passed through verbatim.
    #[serde(default)]
    pub cache: frame_cache::CacheConfig,
    pub workload: WorkloadConfig,
}

/// General benchmark settings.
#[derive(Deserialize)]
pub struct GeneralConfig {
    /// How long to run the measurement phase.
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    /// How long to warm up before recording metrics.
    #[serde(deserialize_with = "deserialize_duration")]
    pub warmup: Duration,
    /// Pause between frame steps, imitating operator key-repeat
    /// (e.g. "15ms"). Zero means step as fast as possible.
    #[serde(default, deserialize_with = "deserialize_duration_opt")]
    pub pace: Option<Duration>,
}

/// Workload configuration.
#[derive(Deserialize)]
pub struct WorkloadConfig {
    /// Access pattern driving the cursor.
    pub pattern: Pattern,
    /// Number of frames in the synthetic project.
    pub frames: u32,
    /// Decoded size of one frame (e.g. "1MB").
    #[serde(deserialize_with = "deserialize_size")]
    pub frame_size: usize,
    /// Synthetic decode latency per load (e.g. "5ms").
    #[serde(default, deserialize_with = "deserialize_duration_opt")]
    pub decode_delay: Option<Duration>,
    /// RNG seed for reproducible runs.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    42
}

/// Cursor pattern.
#[derive(Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    /// Step forward one frame at a time, wrapping at the end.
    Sweep,
    /// Dwell on one frame with occasional nearby excursions.
    Hotspot,
    /// Uniform random jumps across the whole project.
    Random,
    /// Sweep forward a stretch, then review it backward.
    Bounce,
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pattern::Sweep => write!(f, "sweep"),
            Pattern::Hotspot => write!(f, "hotspot"),
            Pattern::Random => write!(f, "random"),
            Pattern::Bounce => write!(f, "bounce"),
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        if config.workload.frames == 0 {
            return Err("workload.frames must be non-zero".into());
        }
        config.cache.validate()?;
        Ok(config)
    }
}

/// Deserialize a duration from a human-readable string (e.g., "60s", "5m").
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional duration; absent means none.
fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s {
        None => Ok(None),
        Some(s) => humantime::parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Deserialize a size from a human-readable string (e.g., "1MB").
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_size(&s)
        .map(|n| n as usize)
        .map_err(serde::de::Error::custom)
}
