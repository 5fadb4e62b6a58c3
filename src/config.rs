// =============================================================================
// Engine Configuration — one nested struct, loaded from JSON at startup
// =============================================================================
//
// Every field carries a serde default, so a partial (or empty) file yields a
// complete config. Optional strategies are `Option`s: `null` disables one.
//
// Persistence uses an atomic tmp + rename so a crash mid-write never leaves a
// truncated file behind.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::execution::DispatchConfig;
use crate::exit::{
    AdaptiveLossExitConfig, AdverseMovementConfig, ConfluenceExitConfig, MicroAccountConfig, MonitorConfig,
    PriorityRules, ProfitScalingConfig, ProfitTargetConfig, SelectionMode, SelectorConfig, StopLossConfig,
    SurvivalConfig, TieredRrrConfig, TimeBasedConfig, TrailingStopConfig,
};
use crate::loss_curve::LossCurveConfig;

fn enabled<T: Default>() -> Option<T> {
    Some(T::default())
}

/// Per-strategy settings. `None` leaves the strategy unregistered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategiesConfig {
    #[serde(default = "enabled")]
    pub stop_loss: Option<StopLossConfig>,
    #[serde(default = "enabled")]
    pub trailing_stop: Option<TrailingStopConfig>,
    #[serde(default = "enabled")]
    pub time_based: Option<TimeBasedConfig>,
    #[serde(default = "enabled")]
    pub profit_target: Option<ProfitTargetConfig>,
    #[serde(default = "enabled")]
    pub adverse_movement: Option<AdverseMovementConfig>,
    #[serde(default = "enabled")]
    pub micro_account: Option<MicroAccountConfig>,
    #[serde(default = "enabled")]
    pub survival: Option<SurvivalConfig>,
    #[serde(default = "enabled")]
    pub adaptive_loss: Option<AdaptiveLossExitConfig>,
    #[serde(default = "enabled")]
    pub confluence: Option<ConfluenceExitConfig>,
    /// Opt-in: overlaps with the tier manager's partial closes.
    #[serde(default)]
    pub profit_scaling: Option<ProfitScalingConfig>,
    #[serde(default)]
    pub tiered_rrr: TieredRrrConfig,
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        Self {
            stop_loss: enabled(),
            trailing_stop: enabled(),
            time_based: enabled(),
            profit_target: enabled(),
            adverse_movement: enabled(),
            micro_account: enabled(),
            survival: enabled(),
            adaptive_loss: enabled(),
            confluence: enabled(),
            profit_scaling: None,
            tiered_rrr: TieredRrrConfig::default(),
        }
    }
}

impl StrategiesConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(c) = &self.stop_loss {
            c.validate()?;
        }
        if let Some(c) = &self.trailing_stop {
            c.validate()?;
        }
        if let Some(c) = &self.time_based {
            c.validate()?;
        }
        if let Some(c) = &self.profit_target {
            c.validate()?;
        }
        if let Some(c) = &self.adverse_movement {
            c.validate()?;
        }
        if let Some(c) = &self.micro_account {
            c.validate()?;
        }
        if let Some(c) = &self.survival {
            c.validate()?;
        }
        if let Some(c) = &self.confluence {
            c.validate()?;
        }
        if let Some(c) = &self.profit_scaling {
            c.validate()?;
        }
        self.tiered_rrr.validate()
    }
}

/// Root configuration of the exit engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub selection: SelectionMode,
    #[serde(default)]
    pub priority: PriorityRules,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub strategies: StrategiesConfig,
    #[serde(default)]
    pub loss_curve: LossCurveConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl EngineConfig {
    /// Check every component config. Constructors validate again, so this
    /// exists to fail before anything is spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.priority.validate()?;
        self.selector.validate()?;
        self.strategies.validate()?;
        self.loss_curve.validate()?;
        self.dispatch.validate()?;
        self.monitor.validate()
    }

    /// Load and validate configuration from a JSON file at `path`.
    ///
    /// A missing file is an error; the caller decides whether to fall back
    /// to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid engine config in {}", path.display()))?;

        info!(
            path = %path.display(),
            selection = %config.selection,
            tiers = config.strategies.tiered_rrr.enabled,
            "Engine config loaded"
        );
        Ok(config)
    }

    /// Persist to `path` atomically (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self).context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "Engine config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.selection, SelectionMode::Coordinator);
        assert!(cfg.strategies.stop_loss.is_some());
        assert!(cfg.strategies.profit_scaling.is_none());
        assert_eq!(cfg.monitor.interval_ms, 1_000);
    }

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.selection, SelectionMode::Coordinator);
        assert!(cfg.strategies.confluence.is_some());
        assert!((cfg.selector.min_utility - 0.6).abs() < f64::EPSILON);
        assert_eq!(cfg.selector.window, 50);
    }

    #[test]
    fn partial_json_fills_defaults_and_null_disables() {
        let json = r#"{
            "selection": "selector",
            "strategies": { "confluence": null, "tiered_rrr": { "num_targets": 2, "close_fractions": [0.5, 0.5] } }
        }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.selection, SelectionMode::Selector);
        assert!(cfg.strategies.confluence.is_none());
        assert!(cfg.strategies.stop_loss.is_some());
        assert_eq!(cfg.strategies.tiered_rrr.num_targets, 2);
        cfg.validate().unwrap();
    }

    #[test]
    fn validation_walks_nested_configs() {
        let mut cfg = EngineConfig::default();
        cfg.strategies.tiered_rrr.close_fractions = vec![0.9, 0.9, 0.9];
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.monitor.interval_ms = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("exit-engine-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("exit_engine.json");

        let mut cfg = EngineConfig::default();
        cfg.selection = SelectionMode::Selector;
        cfg.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.selection, SelectionMode::Selector);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = EngineConfig::load("/nonexistent/exit_engine.json").unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
