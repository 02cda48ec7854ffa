//! Cache configuration.
//!
//! One structured object covers the whole engine: byte budget, preload
//! window, worker pool, and the latency contract. Every field has a
//! default matching the shipped annotation workload (4K frames at ~5 fps,
//! 20 GiB residency ceiling, 50 ms frame switches); TOML files override
//! per field. Byte-sized fields accept either an integer byte count or a
//! human-readable string ("20GB").

use serde::{Deserialize, Deserializer};
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid cache configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Engine configuration, immutable after construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Residency ceiling; never exceeded.
    #[serde(
        default = "default_hard_limit_bytes",
        deserialize_with = "deserialize_size"
    )]
    pub hard_limit_bytes: u64,

    /// Crossing this starts proactive eviction and preload back-pressure.
    #[serde(
        default = "default_soft_limit_bytes",
        deserialize_with = "deserialize_size"
    )]
    pub soft_limit_bytes: u64,

    /// Reactive eviction continues until resident bytes fall to this.
    #[serde(
        default = "default_target_after_eviction_bytes",
        deserialize_with = "deserialize_size"
    )]
    pub target_after_eviction_bytes: u64,

    /// Hard cap on entry count regardless of bytes.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Frames kept behind the cursor.
    #[serde(default = "default_preload_back")]
    pub preload_back: u32,

    /// Frames kept ahead of the cursor in the predicted direction.
    #[serde(default = "default_preload_forward")]
    pub preload_forward: u32,

    /// Preload worker threads.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// The frame-switch latency contract in milliseconds.
    #[serde(default = "default_frame_switch_budget_ms")]
    pub frame_switch_budget_ms: u64,

    /// A `get` over this emits a warning-severity alert.
    #[serde(default = "default_warn_threshold_ms")]
    pub warn_threshold_ms: u64,

    /// A `get` over this emits an error-severity alert.
    #[serde(default = "default_hard_threshold_ms")]
    pub hard_threshold_ms: u64,

    /// Soft deadline for prefetch tasks in milliseconds.
    #[serde(default = "default_prefetch_deadline_ms")]
    pub prefetch_deadline_ms: u64,

    /// Ring-buffer size of the access predictor.
    #[serde(default = "default_predictor_window")]
    pub predictor_window: usize,
}

fn default_hard_limit_bytes() -> u64 {
    20 * GIB
}

fn default_soft_limit_bytes() -> u64 {
    18 * GIB
}

fn default_target_after_eviction_bytes() -> u64 {
    17 * GIB
}

fn default_max_entries() -> usize {
    200
}

fn default_preload_back() -> u32 {
    25
}

fn default_preload_forward() -> u32 {
    75
}

fn default_worker_count() -> usize {
    4
}

fn default_frame_switch_budget_ms() -> u64 {
    50
}

fn default_warn_threshold_ms() -> u64 {
    45
}

fn default_hard_threshold_ms() -> u64 {
    50
}

fn default_prefetch_deadline_ms() -> u64 {
    500
}

fn default_predictor_window() -> usize {
    64
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hard_limit_bytes: default_hard_limit_bytes(),
            soft_limit_bytes: default_soft_limit_bytes(),
            target_after_eviction_bytes: default_target_after_eviction_bytes(),
            max_entries: default_max_entries(),
            preload_back: default_preload_back(),
            preload_forward: default_preload_forward(),
            worker_count: default_worker_count(),
            frame_switch_budget_ms: default_frame_switch_budget_ms(),
            warn_threshold_ms: default_warn_threshold_ms(),
            hard_threshold_ms: default_hard_threshold_ms(),
            prefetch_deadline_ms: default_prefetch_deadline_ms(),
            predictor_window: default_predictor_window(),
        }
    }
}

impl CacheConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hard_limit_bytes == 0 {
            return Err(ConfigError("hard_limit_bytes must be non-zero".into()));
        }
        if self.soft_limit_bytes > self.hard_limit_bytes {
            return Err(ConfigError(format!(
                "soft_limit_bytes ({}) must not exceed hard_limit_bytes ({})",
                self.soft_limit_bytes, self.hard_limit_bytes
            )));
        }
        if self.target_after_eviction_bytes > self.soft_limit_bytes {
            return Err(ConfigError(format!(
                "target_after_eviction_bytes ({}) must not exceed soft_limit_bytes ({})",
                self.target_after_eviction_bytes, self.soft_limit_bytes
            )));
        }
        if self.max_entries == 0 {
            return Err(ConfigError("max_entries must be non-zero".into()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError("worker_count must be non-zero".into()));
        }
        if self.frame_switch_budget_ms == 0 {
            return Err(ConfigError("frame_switch_budget_ms must be non-zero".into()));
        }
        if self.warn_threshold_ms > self.hard_threshold_ms {
            return Err(ConfigError(format!(
                "warn_threshold_ms ({}) must not exceed hard_threshold_ms ({})",
                self.warn_threshold_ms, self.hard_threshold_ms
            )));
        }
        if self.predictor_window == 0 {
            return Err(ConfigError("predictor_window must be non-zero".into()));
        }
        Ok(())
    }

    /// The frame-switch budget as a duration.
    #[inline]
    pub fn frame_switch_budget(&self) -> Duration {
        Duration::from_millis(self.frame_switch_budget_ms)
    }

    /// The prefetch soft deadline as a duration.
    #[inline]
    pub fn prefetch_deadline(&self) -> Duration {
        Duration::from_millis(self.prefetch_deadline_ms)
    }

    /// The warn threshold as a duration.
    #[inline]
    pub fn warn_threshold(&self) -> Duration {
        Duration::from_millis(self.warn_threshold_ms)
    }

    /// The hard threshold as a duration.
    #[inline]
    pub fn hard_threshold(&self) -> Duration {
        Duration::from_millis(self.hard_threshold_ms)
    }
}

/// Deserialize a byte size from an integer or a string like "20GB".
fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Integer(u64),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Integer(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

/// Parse a size string like "1GB", "512MB", "4KB" into bytes.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let num_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());

    let (num_str, suffix) = s.split_at(num_end);
    let num: f64 = num_str
        .parse()
        .map_err(|e| format!("invalid number '{}': {}", num_str, e))?;

    let multiplier: u64 = match suffix.trim().to_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        "GB" | "G" => 1024 * 1024 * 1024,
        "TB" | "T" => 1024 * 1024 * 1024 * 1024,
        other => return Err(format!("unknown size suffix '{}'", other)),
    };

    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.hard_limit_bytes, 20 * GIB);
        assert_eq!(config.soft_limit_bytes, 18 * GIB);
        assert_eq!(config.target_after_eviction_bytes, 17 * GIB);
        assert_eq!(config.max_entries, 200);
        assert_eq!(config.preload_back, 25);
        assert_eq!(config.preload_forward, 75);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.frame_switch_budget_ms, 50);
        assert_eq!(config.warn_threshold_ms, 45);
        assert_eq!(config.hard_threshold_ms, 50);
        assert_eq!(config.prefetch_deadline_ms, 500);
        assert_eq!(config.predictor_window, 64);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("4KB").unwrap(), 4096);
        assert_eq!(parse_size("1MB").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("20GB").unwrap(), 20 * GIB);
        assert_eq!(parse_size("1.5GB").unwrap(), (1.5 * GIB as f64) as u64);
        assert!(parse_size("").is_err());
        assert!(parse_size("1XB").is_err());
    }

    #[test]
    fn test_toml_overrides_and_size_strings() {
        let config: CacheConfig = toml::from_str(
            r#"
            hard_limit_bytes = "1GB"
            soft_limit_bytes = "900MB"
            target_after_eviction_bytes = 838860800
            worker_count = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.hard_limit_bytes, GIB);
        assert_eq!(config.soft_limit_bytes, 900 * 1024 * 1024);
        assert_eq!(config.target_after_eviction_bytes, 800 * 1024 * 1024);
        assert_eq!(config.worker_count, 2);
        // Untouched fields keep defaults.
        assert_eq!(config.max_entries, 200);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<CacheConfig, _> = toml::from_str("memory_limit = 100");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_limits() {
        let config = CacheConfig {
            soft_limit_bytes: 21 * GIB,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CacheConfig {
            target_after_eviction_bytes: 19 * GIB,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CacheConfig {
            warn_threshold_ms: 60,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = CacheConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
