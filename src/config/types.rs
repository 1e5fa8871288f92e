//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Broker account and strategy identity
    #[serde(default)]
    pub account: AccountConfig,
    /// Layering rules
    #[serde(default)]
    pub martingale: MartingaleConfig,
    /// Broker target propagation
    #[serde(default)]
    pub propagation: PropagationConfig,
    /// Snapshot file locations
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Emergency stop sources
    #[serde(default)]
    pub risk: RiskConfig,
    /// General application settings
    #[serde(default)]
    pub settings: AppSettings,
}

/// Identity checked against persisted snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Broker account identifier
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Tag attached to every order placed by this system
    #[serde(default = "default_strategy_tag")]
    pub strategy_tag: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            account_id: default_account_id(),
            strategy_tag: default_strategy_tag(),
        }
    }
}

fn default_account_id() -> String {
    "paper".to_string()
}

fn default_strategy_tag() -> String {
    "50515253".to_string()
}

/// Batch layering rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MartingaleConfig {
    /// Hard cap on layers per batch
    #[serde(default = "default_max_layers")]
    pub max_layers: u32,
    /// Minimum seconds between two layers of the same batch
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Extra trigger levels scanned beyond the next one each cycle
    #[serde(default = "default_trigger_lookahead")]
    pub trigger_lookahead: u32,
    /// Levels scanned by recovery when looking for missed layers
    #[serde(default = "default_missed_layer_lookahead")]
    pub missed_layer_lookahead: u32,
    /// Volume growth factor per layer
    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: rust_decimal::Decimal,
    /// Layers at or beyond this index skip the decision layer
    #[serde(default = "default_intelligence_bypass_layer")]
    pub intelligence_bypass_layer: u32,
    /// Spacing assumed for adopted orphan batches, in pips
    #[serde(default = "default_orphan_spacing_pips")]
    pub orphan_spacing_pips: rust_decimal::Decimal,
}

impl Default for MartingaleConfig {
    fn default() -> Self {
        Self {
            max_layers: default_max_layers(),
            cooldown_seconds: default_cooldown_seconds(),
            trigger_lookahead: default_trigger_lookahead(),
            missed_layer_lookahead: default_missed_layer_lookahead(),
            volume_multiplier: default_volume_multiplier(),
            intelligence_bypass_layer: default_intelligence_bypass_layer(),
            orphan_spacing_pips: default_orphan_spacing_pips(),
        }
    }
}

fn default_max_layers() -> u32 {
    15
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_trigger_lookahead() -> u32 {
    2
}

fn default_missed_layer_lookahead() -> u32 {
    5
}

fn default_volume_multiplier() -> rust_decimal::Decimal {
    rust_decimal::Decimal::TWO
}

fn default_intelligence_bypass_layer() -> u32 {
    3
}

fn default_orphan_spacing_pips() -> rust_decimal::Decimal {
    rust_decimal::Decimal::from(50)
}

/// Target propagation retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Rounds over the not-yet-updated layers
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Attempts per layer within one round
    #[serde(default = "default_per_layer_attempts")]
    pub per_layer_attempts: u32,
    /// Pause between attempts in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Fraction of layers that must be updated for the batch to count as done
    #[serde(default = "default_min_success_ratio")]
    pub min_success_ratio: f64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            per_layer_attempts: default_per_layer_attempts(),
            backoff_ms: default_backoff_ms(),
            min_success_ratio: default_min_success_ratio(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_per_layer_attempts() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_min_success_ratio() -> f64 {
    0.8
}

/// Snapshot locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Primary snapshot file; the backup lives next to it with `.backup` appended
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl PersistenceConfig {
    pub fn backup_file(&self) -> PathBuf {
        let mut name = self.state_file.clone().into_os_string();
        name.push(".backup");
        PathBuf::from(name)
    }
}

fn default_state_file() -> PathBuf {
    PathBuf::from("data/bot_state.json")
}

/// Emergency stop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Equity drawdown from the initial balance that latches the emergency stop
    #[serde(default = "default_emergency_drawdown_percent")]
    pub emergency_drawdown_percent: rust_decimal::Decimal,
    /// File written by the external risk monitor
    #[serde(default = "default_emergency_file")]
    pub emergency_file: PathBuf,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            emergency_drawdown_percent: default_emergency_drawdown_percent(),
            emergency_file: default_emergency_file(),
        }
    }
}

fn default_emergency_drawdown_percent() -> rust_decimal::Decimal {
    rust_decimal::Decimal::from(50)
}

fn default_emergency_file() -> PathBuf {
    PathBuf::from("data/emergency.json")
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Trading loop cadence, aligned to the bar interval
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_seconds: u64,
    /// Age after which cached decision data is ignored
    #[serde(default = "default_decision_stale")]
    pub decision_stale_seconds: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            cycle_interval_seconds: default_cycle_interval(),
            decision_stale_seconds: default_decision_stale(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cycle_interval() -> u64 {
    300
}

fn default_decision_stale() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.martingale.max_layers, 15);
        assert_eq!(config.martingale.cooldown_seconds, 30);
        assert_eq!(config.propagation.min_success_ratio, 0.8);
        assert_eq!(config.settings.cycle_interval_seconds, 300);
    }

    #[test]
    fn test_backup_path() {
        let persistence = PersistenceConfig {
            state_file: PathBuf::from("/tmp/state.json"),
        };
        assert_eq!(persistence.backup_file(), PathBuf::from("/tmp/state.json.backup"));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"account": {"account_id": "42903786"}}"#).unwrap();
        assert_eq!(config.account.account_id, "42903786");
        assert_eq!(config.account.strategy_tag, "50515253");
        assert_eq!(config.martingale.intelligence_bypass_layer, 3);
    }
}
