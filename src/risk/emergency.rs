use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, warn};

use crate::common::errors::Result;
use crate::config::types::RiskConfig;

/// Emergency file written by an external risk monitor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergencyNotice {
    #[serde(default)]
    pub emergency_stop: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Sources that can latch the emergency stop
#[derive(Debug, Clone)]
pub struct EmergencyMonitor {
    path: PathBuf,
    drawdown_limit_percent: Decimal,
}

impl EmergencyMonitor {
    pub fn new(path: impl Into<PathBuf>, drawdown_limit_percent: Decimal) -> Self {
        Self {
            path: path.into(),
            drawdown_limit_percent,
        }
    }

    pub fn from_config(config: &RiskConfig) -> Self {
        Self::new(config.emergency_file.clone(), config.emergency_drawdown_percent)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the emergency file; a missing file is no notice
    pub async fn read_notice(&self) -> Result<Option<EmergencyNotice>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Reasons for an active emergency, or None
    ///
    /// An unreadable file is logged and treated as no emergency.
    pub async fn check_file(&self) -> Option<Vec<String>> {
        match self.read_notice().await {
            Ok(Some(notice)) if notice.emergency_stop => {
                warn!(
                    "Emergency file {} requests stop: {:?}",
                    self.path.display(),
                    notice.reasons
                );
                Some(notice.reasons)
            }
            Ok(_) => None,
            Err(e) => {
                error!("Cannot read emergency file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Percent of the initial balance lost
    pub fn drawdown_percent(initial_balance: Decimal, equity: Decimal) -> Decimal {
        if initial_balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (initial_balance - equity) / initial_balance * Decimal::ONE_HUNDRED
    }

    pub fn drawdown_breached(&self, initial_balance: Decimal, equity: Decimal) -> bool {
        let drawdown = Self::drawdown_percent(initial_balance, equity);
        debug!(
            "Drawdown {}% (limit {}%)",
            drawdown.round_dp(2),
            self.drawdown_limit_percent
        );
        drawdown >= self.drawdown_limit_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_clear() {
        let dir = TempDir::new().unwrap();
        let monitor = EmergencyMonitor::new(dir.path().join("emergency.json"), dec!(50));
        assert_eq!(monitor.read_notice().await.unwrap(), None);
        assert_eq!(monitor.check_file().await, None);
    }

    #[tokio::test]
    async fn test_active_notice() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("emergency.json");
        fs::write(
            &path,
            r#"{"emergency_stop": true, "reasons": ["margin level 80%"], "timestamp": "2024-03-01T10:00:00"}"#,
        )
        .await
        .unwrap();

        let monitor = EmergencyMonitor::new(&path, dec!(50));
        assert_eq!(monitor.check_file().await, Some(vec!["margin level 80%".to_string()]));

        fs::write(&path, r#"{"emergency_stop": false}"#).await.unwrap();
        assert_eq!(monitor.check_file().await, None);
    }

    #[tokio::test]
    async fn test_garbage_file_is_clear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("emergency.json");
        fs::write(&path, "STOP").await.unwrap();
        let monitor = EmergencyMonitor::new(&path, dec!(50));
        assert!(monitor.read_notice().await.is_err());
        assert_eq!(monitor.check_file().await, None);
    }

    #[test]
    fn test_drawdown() {
        let monitor = EmergencyMonitor::new("unused", dec!(50));
        assert_eq!(EmergencyMonitor::drawdown_percent(dec!(10000), dec!(7500)), dec!(25));
        assert!(!monitor.drawdown_breached(dec!(10000), dec!(5001)));
        assert!(monitor.drawdown_breached(dec!(10000), dec!(5000)));
        assert!(!monitor.drawdown_breached(Decimal::ZERO, dec!(5000)));
    }
}
