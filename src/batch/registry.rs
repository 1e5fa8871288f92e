use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use super::instruments::pip_size;
use super::model::{Batch, BatchId, BatchKey};
use super::target::TargetCalculator;
use crate::common::errors::{EngineError, Result};
use crate::common::types::{BrokerPosition, Direction};

/// Result of appending a layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerAdded {
    pub batch_id: BatchId,
    pub layer_index: u32,
    pub layer_count: u32,
    pub breakeven_price: Decimal,
    /// New shared target; the caller must push it to every layer on the broker
    pub target_price: Decimal,
}

/// What `sync_with_broker` changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// (batch, layer index) pairs that no longer exist on the broker
    pub removed_layers: Vec<(BatchId, u32)>,
    /// Batches deleted because every layer closed
    pub completed: Vec<BatchId>,
    /// Batches that lost some layers and got a new target
    pub retargeted: Vec<BatchId>,
    /// Batches whose broker-side targets differ from the stored target
    pub target_drift: Vec<BatchId>,
}

impl SyncReport {
    /// Batches whose target should be pushed to the broker
    pub fn needs_propagation(&self) -> Vec<BatchId> {
        let mut ids: Vec<BatchId> = self
            .retargeted
            .iter()
            .chain(self.target_drift.iter())
            .copied()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Process-wide counters carried in every snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryCounters {
    pub next_batch_id: BatchId,
    pub total_trades: u64,
    pub emergency_stop_active: bool,
    pub initial_balance: Option<Decimal>,
}

impl Default for RegistryCounters {
    fn default() -> Self {
        Self {
            next_batch_id: 1,
            total_trades: 0,
            emergency_stop_active: false,
            initial_balance: None,
        }
    }
}

/// Owned set of active batches, one per (symbol, direction)
///
/// Single writer: the trading loop owns the registry and passes it by
/// reference, so no internal locking is needed.
#[derive(Debug, Clone, Default)]
pub struct BatchRegistry {
    batches: BTreeMap<BatchKey, Batch>,
    counters: RegistryCounters,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from recovered batches and counters
    pub fn from_parts(batches: impl IntoIterator<Item = Batch>, counters: RegistryCounters) -> Self {
        let mut registry = Self {
            batches: BTreeMap::new(),
            counters,
        };
        for batch in batches {
            let key = batch.key();
            if registry.counters.next_batch_id <= batch.batch_id {
                registry.counters.next_batch_id = batch.batch_id + 1;
            }
            if let Some(previous) = registry.batches.insert(key.clone(), batch) {
                warn!(
                    "Duplicate batch for {}: dropping batch {}",
                    key, previous.batch_id
                );
            }
        }
        registry
    }

    pub fn has_open_position(&self, symbol: &str, direction: Direction) -> bool {
        self.get(symbol, direction)
            .map(|b| !b.is_empty())
            .unwrap_or(false)
    }

    /// Create a batch, or return the id of the existing one for this key
    ///
    /// Refused while the emergency stop is active.
    pub fn create_batch(
        &mut self,
        symbol: &str,
        direction: Direction,
        entry_price: Decimal,
        layer_spacing: Decimal,
    ) -> Result<BatchId> {
        self.create_batch_at(symbol, direction, entry_price, layer_spacing, Utc::now())
    }

    pub fn create_batch_at(
        &mut self,
        symbol: &str,
        direction: Direction,
        entry_price: Decimal,
        layer_spacing: Decimal,
        at: DateTime<Utc>,
    ) -> Result<BatchId> {
        let key = BatchKey::new(symbol, direction);
        if let Some(existing) = self.batches.get(&key) {
            debug!("Batch {} already exists for {}", existing.batch_id, key);
            return Ok(existing.batch_id);
        }
        self.ensure_growth_allowed()?;

        let batch_id = self.counters.next_batch_id;
        self.counters.next_batch_id += 1;
        let batch = Batch::new(batch_id, symbol, direction, entry_price, layer_spacing, at);
        info!(
            "Created batch {} for {} (entry {}, spacing {})",
            batch_id, key, entry_price, layer_spacing
        );
        self.batches.insert(key, batch);
        Ok(batch_id)
    }

    /// Append a layer and recompute the shared target
    pub fn add_layer(
        &mut self,
        batch_id: BatchId,
        volume: Decimal,
        entry_price: Decimal,
        broker_position_id: Option<String>,
    ) -> Result<LayerAdded> {
        self.add_layer_at(batch_id, volume, entry_price, broker_position_id, Utc::now())
    }

    pub fn add_layer_at(
        &mut self,
        batch_id: BatchId,
        volume: Decimal,
        entry_price: Decimal,
        broker_position_id: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<LayerAdded> {
        self.ensure_growth_allowed()?;
        if volume <= Decimal::ZERO {
            return Err(EngineError::InvalidVolume(format!(
                "layer volume must be positive, got {}",
                volume
            )));
        }

        let batch = self
            .batch_mut(batch_id)
            .ok_or(EngineError::BatchNotFound(batch_id))?;
        let layer_index = batch.add_trade(volume, entry_price, broker_position_id, at).layer_index;

        let breakeven_price = batch
            .breakeven_price()
            .ok_or(EngineError::InvalidVolume("batch has no volume".to_string()))?;
        let target_price = TargetCalculator::target_price(
            &batch.symbol,
            batch.direction,
            breakeven_price,
            batch.highest_layer_index(),
        );
        batch.set_target(target_price);
        let layer_count = batch.layer_count();

        info!(
            "Added layer {} to batch {} ({} {}): {} @ {}, breakeven {}, target {}",
            layer_index,
            batch_id,
            batch.symbol,
            batch.direction,
            volume,
            entry_price,
            breakeven_price.round_dp(5),
            target_price.round_dp(5)
        );

        self.counters.total_trades += 1;

        Ok(LayerAdded {
            batch_id,
            layer_index,
            layer_count,
            breakeven_price,
            target_price,
        })
    }

    fn ensure_growth_allowed(&self) -> Result<()> {
        if self.counters.emergency_stop_active {
            return Err(EngineError::EmergencyStop(
                "emergency stop active in registry".to_string(),
            ));
        }
        Ok(())
    }

    /// Recompute and apply the adaptive target of one batch
    pub fn refresh_target(&mut self, batch_id: BatchId) -> Option<Decimal> {
        let batch = self.batch_mut(batch_id)?;
        let target = TargetCalculator::for_batch(batch)?;
        batch.set_target(target);
        Some(target)
    }

    /// Drop layers the broker no longer reports
    ///
    /// Batches left empty are deleted; batches that lost some layers get a
    /// fresh target. Layers whose broker target drifted from the stored one
    /// are flagged for propagation.
    pub fn sync_with_broker(&mut self, live_positions: &[BrokerPosition]) -> SyncReport {
        let live: HashMap<&str, &BrokerPosition> =
            live_positions.iter().map(|p| (p.id.as_str(), p)).collect();
        let mut report = SyncReport::default();
        let mut emptied = Vec::new();

        for (key, batch) in self.batches.iter_mut() {
            if batch.is_empty() {
                continue;
            }

            let removed = batch.retain_live(|id| live.contains_key(id));
            for layer in &removed {
                warn!(
                    "Layer {} of batch {} ({}) no longer open on broker (position {:?})",
                    layer.layer_index, batch.batch_id, key, layer.broker_position_id
                );
                report.removed_layers.push((batch.batch_id, layer.layer_index));
            }

            if batch.is_empty() {
                info!("Batch {} completed - all positions closed", key);
                emptied.push(key.clone());
                report.completed.push(batch.batch_id);
                continue;
            }

            if !removed.is_empty() {
                if let Some(target) = TargetCalculator::for_batch(batch) {
                    batch.set_target(target);
                }
                info!(
                    "Partial closure of {}: {} layers left, breakeven {:?}",
                    key,
                    batch.layer_count(),
                    batch.breakeven_price().map(|p| p.round_dp(5))
                );
                report.retargeted.push(batch.batch_id);
                continue;
            }

            let tolerance = pip_size(&batch.symbol);
            let drifted = batch.layers.iter().any(|layer| {
                let Some(id) = layer.broker_position_id.as_deref() else {
                    return false;
                };
                match (live.get(id).and_then(|p| p.target_price), layer.target_price) {
                    (Some(broker), Some(stored)) => (broker - stored).abs() >= tolerance,
                    (None, Some(_)) => true,
                    _ => false,
                }
            });
            if drifted {
                debug!("Broker targets drifted for {}", key);
                report.target_drift.push(batch.batch_id);
            }
        }

        for key in emptied {
            self.batches.remove(&key);
        }

        report
    }

    /// Remove batches with no layers left, returning them
    pub fn prune_completed(&mut self) -> Vec<Batch> {
        let empty: Vec<BatchKey> = self
            .batches
            .iter()
            .filter(|(_, b)| b.is_empty())
            .map(|(k, _)| k.clone())
            .collect();

        empty
            .into_iter()
            .filter_map(|key| {
                debug!("Pruning empty batch {}", key);
                self.batches.remove(&key)
            })
            .collect()
    }

    pub fn remove_batch(&mut self, batch_id: BatchId) -> Option<Batch> {
        let key = self
            .batches
            .iter()
            .find(|(_, b)| b.batch_id == batch_id)
            .map(|(k, _)| k.clone())?;
        self.batches.remove(&key)
    }

    pub fn get(&self, symbol: &str, direction: Direction) -> Option<&Batch> {
        self.batches.get(&BatchKey::new(symbol, direction))
    }

    pub fn batch(&self, batch_id: BatchId) -> Option<&Batch> {
        self.batches.values().find(|b| b.batch_id == batch_id)
    }

    pub fn batch_mut(&mut self, batch_id: BatchId) -> Option<&mut Batch> {
        self.batches.values_mut().find(|b| b.batch_id == batch_id)
    }

    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.batches.values()
    }

    pub fn batch_ids(&self) -> Vec<BatchId> {
        self.batches.values().map(|b| b.batch_id).collect()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn counters(&self) -> &RegistryCounters {
        &self.counters
    }

    pub fn next_batch_id(&self) -> BatchId {
        self.counters.next_batch_id
    }

    pub fn total_trades(&self) -> u64 {
        self.counters.total_trades
    }

    pub fn emergency_stop_active(&self) -> bool {
        self.counters.emergency_stop_active
    }

    pub fn set_emergency_stop(&mut self, active: bool) {
        if active != self.counters.emergency_stop_active {
            if active {
                warn!("Emergency stop activated: no new batches or layers");
            } else {
                info!("Emergency stop cleared");
            }
        }
        self.counters.emergency_stop_active = active;
    }

    pub fn initial_balance(&self) -> Option<Decimal> {
        self.counters.initial_balance
    }

    /// Record the first observed balance; later calls are ignored
    pub fn track_initial_balance(&mut self, balance: Decimal) -> Decimal {
        *self.counters.initial_balance.get_or_insert_with(|| {
            info!("Initial balance set: {}", balance);
            balance
        })
    }
}
