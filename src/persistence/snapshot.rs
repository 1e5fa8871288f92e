use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::batch::model::{Batch, BatchId};
use crate::batch::registry::{BatchRegistry, RegistryCounters};
use crate::common::errors::{EngineError, Result};

/// Complete persisted engine state
///
/// Additive schema changes are safe: unknown fields are ignored and every
/// field except the identity pair has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub account_id: String,
    pub strategy_tag: String,
    #[serde(default = "default_next_batch_id")]
    pub next_batch_id: BatchId,
    #[serde(default)]
    pub total_trades: u64,
    #[serde(default)]
    pub emergency_stop_active: bool,
    #[serde(default)]
    pub initial_balance: Option<Decimal>,
    /// Keyed by `SYMBOL_direction`
    #[serde(default)]
    pub batches: BTreeMap<String, Batch>,
}

fn default_next_batch_id() -> BatchId {
    1
}

impl Snapshot {
    /// Capture the registry for the given account and tag
    pub fn capture(
        registry: &BatchRegistry,
        account_id: &str,
        strategy_tag: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let counters = registry.counters();
        Self {
            timestamp,
            account_id: account_id.to_string(),
            strategy_tag: strategy_tag.to_string(),
            next_batch_id: counters.next_batch_id,
            total_trades: counters.total_trades,
            emergency_stop_active: counters.emergency_stop_active,
            initial_balance: counters.initial_balance,
            batches: registry
                .batches()
                .map(|b| (b.key().to_string(), b.clone()))
                .collect(),
        }
    }

    /// Reject a snapshot written for another account or strategy
    pub fn validate(&self, account_id: &str, strategy_tag: &str) -> Result<()> {
        if self.account_id != account_id {
            return Err(EngineError::ConfigMismatch {
                field: "account_id",
                saved: self.account_id.clone(),
                current: account_id.to_string(),
            });
        }
        if self.strategy_tag != strategy_tag {
            return Err(EngineError::ConfigMismatch {
                field: "strategy_tag",
                saved: self.strategy_tag.clone(),
                current: strategy_tag.to_string(),
            });
        }
        Ok(())
    }

    pub fn counters(&self) -> RegistryCounters {
        RegistryCounters {
            next_batch_id: self.next_batch_id.max(1),
            total_trades: self.total_trades,
            emergency_stop_active: self.emergency_stop_active,
            initial_balance: self.initial_balance,
        }
    }

    /// Restore a registry without consulting the broker
    pub fn into_registry(self) -> BatchRegistry {
        let counters = self.counters();
        BatchRegistry::from_parts(self.batches.into_values(), counters)
    }

    pub fn layer_count(&self) -> usize {
        self.batches.values().map(|b| b.layers.len()).sum()
    }
}
