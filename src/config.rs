//! Configuration for polyform-storage

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Config file consulted when none is given on the command line
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("polyform-storage")
        .join("config.toml")
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub promotion: PromotionConfig,

    #[serde(default)]
    pub scaffolding: ScaffoldingConfig,
}

impl EngineConfig {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| EngineError::Config(e.to_string()))?;
        config
            .promotion
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Chunked file layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Maximum polygons per chunk record
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Every Nth chunk embeds a full registry snapshot
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: usize,
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_snapshot_interval() -> usize {
    1
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            snapshot_interval: default_snapshot_interval(),
        }
    }
}

/// Tier 3 catalog persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_candidates_file")]
    pub candidates_file: String,

    #[serde(default = "default_promoted_file")]
    pub promoted_file: String,

    /// Candidate mutations buffered before an automatic flush
    #[serde(default = "default_flush_threshold")]
    pub candidate_flush_threshold: usize,

    /// Telemetry events retained in memory
    #[serde(default = "default_telemetry_buffer")]
    pub telemetry_buffer_size: usize,
}

fn default_candidates_file() -> String {
    "tier3_candidates.jsonl".to_string()
}

fn default_promoted_file() -> String {
    "tier3_promoted.jsonl".to_string()
}

fn default_flush_threshold() -> usize {
    16
}

fn default_telemetry_buffer() -> usize {
    128
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            candidates_file: default_candidates_file(),
            promoted_file: default_promoted_file(),
            candidate_flush_threshold: default_flush_threshold(),
            telemetry_buffer_size: default_telemetry_buffer(),
        }
    }
}

/// Thresholds governing Tier 3 promotion decisions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    pub promotion_threshold: f64,
    pub demotion_threshold: f64,
    pub default_probation_days: i64,
    pub promotion_cooldown_hours: i64,
    pub promotion_window_days: i64,
    pub promotion_window_limit: usize,
    pub demotion_window_days: i64,
    pub demotion_window_limit: usize,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: 0.8,
            demotion_threshold: 0.5,
            default_probation_days: 7,
            promotion_cooldown_hours: 24,
            promotion_window_days: 14,
            promotion_window_limit: 3,
            demotion_window_days: 7,
            demotion_window_limit: 2,
        }
    }
}

impl PromotionConfig {
    pub fn promotion_cooldown(&self) -> Result<Duration> {
        span_hours(self.promotion_cooldown_hours, "promotion_cooldown_hours")
    }

    pub fn promotion_window(&self) -> Result<Duration> {
        span_days(self.promotion_window_days, "promotion_window_days")
    }

    pub fn demotion_window(&self) -> Result<Duration> {
        span_days(self.demotion_window_days, "demotion_window_days")
    }

    /// Reject negative spans and spans chrono cannot represent
    pub fn validate(&self) -> Result<()> {
        self.promotion_cooldown()?;
        self.promotion_window()?;
        self.demotion_window()?;
        span_days(self.default_probation_days, "default_probation_days")?;
        Ok(())
    }
}

/// Non-negative day count as a duration
pub fn span_days(value: i64, field: &str) -> Result<Duration> {
    span(value, field, Duration::try_days)
}

/// Non-negative hour count as a duration
pub fn span_hours(value: i64, field: &str) -> Result<Duration> {
    span(value, field, Duration::try_hours)
}

fn span(value: i64, field: &str, make: fn(i64) -> Option<Duration>) -> Result<Duration> {
    if value < 0 {
        return Err(EngineError::InvalidArgument(format!(
            "{} must not be negative (got {})",
            field, value
        )));
    }
    make(value).ok_or_else(|| {
        EngineError::InvalidArgument(format!("{} is out of range (got {})", field, value))
    })
}

/// Scaffolding and visualization catalog settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaffoldingConfig {
    /// Quiet period before a requested catalog rescan runs
    #[serde(default = "default_refresh_debounce")]
    pub refresh_debounce_ms: u64,

    #[serde(default = "default_visualization_root")]
    pub visualization_root: PathBuf,
}

fn default_refresh_debounce() -> u64 {
    2_000
}

fn default_visualization_root() -> PathBuf {
    PathBuf::from("catalogs/polyform_library")
}

impl Default for ScaffoldingConfig {
    fn default() -> Self {
        Self {
            refresh_debounce_ms: default_refresh_debounce(),
            visualization_root: default_visualization_root(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [storage]
            chunk_size = 250

            [catalog]
            candidate_flush_threshold = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.chunk_size, 250);
        assert_eq!(config.storage.snapshot_interval, 1);
        assert_eq!(config.catalog.candidate_flush_threshold, 4);
        assert_eq!(config.catalog.promoted_file, "tier3_promoted.jsonl");
        assert_eq!(config.promotion.promotion_window_limit, 3);
        assert_eq!(config.scaffolding.refresh_debounce_ms, 2_000);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = EngineConfig::default();
        config.promotion.promotion_threshold = 0.9;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.promotion.promotion_threshold, 0.9);
        assert_eq!(loaded.storage.chunk_size, 10_000);
    }

    #[test]
    fn test_out_of_range_spans_are_rejected() {
        assert_eq!(span_days(2, "d").unwrap(), Duration::days(2));
        assert!(matches!(span_days(-1, "d"), Err(EngineError::InvalidArgument(_))));
        assert!(matches!(
            span_days(i64::MAX / 1000, "d"),
            Err(EngineError::InvalidArgument(_))
        ));

        let config = PromotionConfig {
            promotion_cooldown_hours: i64::MAX,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::InvalidArgument(_))));
        assert!(PromotionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_rejects_unrepresentable_promotion_spans() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[promotion]\npromotion_window_days = -3\n").unwrap();

        assert!(matches!(EngineConfig::load(&path), Err(EngineError::Config(_))));
    }
}
