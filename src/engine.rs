//! Trading cycle driver
//!
//! [`BatchEngine`] owns the registry and runs every mutation on the caller's
//! task. Within one cycle the order is fixed: broker positions are fetched,
//! the registry is synced and pruned, triggers are evaluated, at most one
//! layer is added per batch, targets are propagated, and state is persisted.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::batch::instruments::VolumeRules;
use crate::batch::model::BatchId;
use crate::batch::propagation::{PropagationReport, TargetPropagator};
use crate::batch::registry::{BatchRegistry, LayerAdded, SyncReport};
use crate::batch::sizing::LayerSizer;
use crate::batch::target::TargetCalculator;
use crate::batch::trigger::{LayerTrigger, TriggerDecision, TriggerEvaluator};
use crate::common::errors::{EngineError, Result};
use crate::common::traits::{Broker, Decider};
use crate::common::types::{BrokerPosition, Direction, OrderRequest, PriceBook, Quote};
use crate::config::types::AppConfig;
use crate::decision::bypasses_decider;
use crate::persistence::store::SnapshotStore;
use crate::recovery::reconciler::{RecoveryReconciler, RecoveryReport};
use crate::risk::emergency::EmergencyMonitor;

/// Entry signal from the (external) signal layer
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySignal {
    pub symbol: String,
    pub direction: Direction,
    /// Volume of the first layer
    pub volume: Decimal,
    /// Price distance between trigger levels for the new batch
    pub layer_spacing: Decimal,
}

/// What one trading cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub broker_available: bool,
    pub sync: SyncReport,
    pub pruned: Vec<BatchId>,
    pub emergency_stop: bool,
    pub layers_added: Vec<LayerAdded>,
    /// Crossed trigger levels left for later cycles
    pub pending: Vec<(BatchId, LayerTrigger)>,
    /// Layer additions refused by the decision layer
    pub blocked: Vec<BatchId>,
    /// Layer additions the broker refused
    pub rejected: Vec<(BatchId, String)>,
    pub propagated: Vec<PropagationReport>,
    pub propagation_failures: Vec<(BatchId, String)>,
    pub persisted: bool,
}

/// Owns the batch registry and drives it against a broker
pub struct BatchEngine {
    registry: BatchRegistry,
    broker: Arc<dyn Broker>,
    decider: Arc<dyn Decider>,
    store: SnapshotStore,
    propagator: TargetPropagator,
    evaluator: TriggerEvaluator,
    sizer: LayerSizer,
    reconciler: RecoveryReconciler,
    emergency: EmergencyMonitor,
    bypass_layer: u32,
    strategy_tag: String,
    /// Reasons from the external emergency file, refreshed every cycle
    file_stop: Option<Vec<String>>,
}

impl BatchEngine {
    pub fn new(config: &AppConfig, broker: Arc<dyn Broker>, decider: Arc<dyn Decider>) -> Self {
        Self {
            registry: BatchRegistry::new(),
            broker,
            decider,
            store: SnapshotStore::from_config(config),
            propagator: TargetPropagator::from_config(&config.propagation),
            evaluator: TriggerEvaluator::from_config(&config.martingale),
            sizer: LayerSizer::new(config.martingale.volume_multiplier),
            reconciler: RecoveryReconciler::from_config(&config.martingale),
            emergency: EmergencyMonitor::from_config(&config.risk),
            bypass_layer: config.martingale.intelligence_bypass_layer,
            strategy_tag: config.account.strategy_tag.clone(),
            file_stop: None,
        }
    }

    pub fn registry(&self) -> &BatchRegistry {
        &self.registry
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// True while the flag or the emergency file is active
    pub fn is_emergency_stopped(&self) -> bool {
        self.registry.emergency_stop_active() || self.file_stop.is_some()
    }

    fn emergency_reason(&self) -> String {
        match &self.file_stop {
            Some(reasons) if !reasons.is_empty() => reasons.join("; "),
            Some(_) => "emergency file".to_string(),
            None => "emergency flag set".to_string(),
        }
    }

    /// Recover state from the snapshot and the broker, then push rebuilt
    /// targets and persist
    #[instrument(skip_all)]
    pub async fn startup(&mut self, prices: &PriceBook) -> RecoveryReport {
        let (registry, report) = self
            .reconciler
            .recover(&self.store, self.broker.as_ref(), prices)
            .await;
        self.registry = registry;

        let to_propagate = report.needs_propagation();
        if !to_propagate.is_empty() {
            let live = self
                .broker
                .get_positions(&self.strategy_tag)
                .await
                .unwrap_or_default();
            let (_, failures) = self.propagate(&to_propagate, &live).await;
            for (batch_id, reason) in failures {
                warn!("Target for recovered batch {} not fully applied: {}", batch_id, reason);
            }
        }

        self.persist().await;
        report
    }

    /// Open a new batch from an entry signal
    ///
    /// Returns `None` when a batch already exists for the key or the
    /// decision layer blocks the entry.
    #[instrument(skip(self, quote), fields(symbol = %signal.symbol, direction = %signal.direction))]
    pub async fn open_batch(&mut self, signal: &EntrySignal, quote: Quote) -> Result<Option<LayerAdded>> {
        if self.is_emergency_stopped() {
            return Err(EngineError::EmergencyStop(self.emergency_reason()));
        }
        if self.registry.has_open_position(&signal.symbol, signal.direction) {
            debug!("Batch already open for {} {}", signal.symbol, signal.direction);
            return Ok(None);
        }

        let verdict = self.decider.can_trade(&signal.symbol, signal.direction);
        if !verdict.allowed {
            info!(
                "Entry blocked for {} {}: {} (confidence {})",
                signal.symbol, signal.direction, verdict.reason, verdict.confidence
            );
            return Ok(None);
        }

        let volume = VolumeRules::for_symbol(&signal.symbol).normalize(signal.volume);
        if volume <= Decimal::ZERO || signal.layer_spacing <= Decimal::ZERO {
            return Err(EngineError::InvalidVolume(format!(
                "entry volume {} / spacing {} for {}",
                signal.volume, signal.layer_spacing, signal.symbol
            )));
        }

        let entry_price = quote.entry_for(signal.direction);
        let batch_id = self.registry.create_batch(
            &signal.symbol,
            signal.direction,
            entry_price,
            signal.layer_spacing,
        )?;
        let initial_target = TargetCalculator::target_price(&signal.symbol, signal.direction, entry_price, 1);

        match self.place_layer(batch_id, volume, Some(initial_target)).await {
            Ok(added) => {
                if added.target_price != initial_target {
                    self.propagate(&[batch_id], &[]).await;
                }
                self.persist().await;
                Ok(Some(added))
            }
            Err(e) => {
                if self.registry.batch(batch_id).map(|b| b.is_empty()).unwrap_or(false) {
                    self.registry.remove_batch(batch_id);
                }
                warn!("Failed to open batch for {} {}: {}", signal.symbol, signal.direction, e);
                Err(e)
            }
        }
    }

    /// Run one trading cycle against the given prices
    #[instrument(skip_all)]
    pub async fn run_cycle(&mut self, prices: &PriceBook) -> CycleReport {
        let mut report = CycleReport::default();

        let live = match self.broker.get_positions(&self.strategy_tag).await {
            Ok(live) => live,
            Err(e) => {
                warn!("Skipping cycle, broker positions unavailable: {}", e);
                report.persisted = self.persist().await;
                return report;
            }
        };
        report.broker_available = true;

        report.sync = self.registry.sync_with_broker(&live);
        report.pruned = self
            .registry
            .prune_completed()
            .into_iter()
            .map(|b| b.batch_id)
            .collect();

        self.file_stop = self.emergency.check_file().await;
        report.emergency_stop = self.is_emergency_stopped();

        let mut to_propagate: BTreeSet<BatchId> = report.sync.needs_propagation().into_iter().collect();

        if report.emergency_stop {
            info!(
                "Emergency stop active ({}), not adding layers",
                self.emergency_reason()
            );
        } else {
            for batch_id in self.registry.batch_ids() {
                let Some(trigger) = self.evaluate_batch(batch_id, prices, &mut report) else {
                    continue;
                };
                match self.add_triggered_layer(batch_id, &trigger).await {
                    Ok(Some(added)) => {
                        to_propagate.insert(batch_id);
                        report.layers_added.push(added);
                    }
                    Ok(None) => report.blocked.push(batch_id),
                    Err(e) => {
                        warn!("Layer {} for batch {} not added: {}", trigger.layer_number, batch_id, e);
                        report.rejected.push((batch_id, e.to_string()));
                    }
                }
            }
        }

        if !to_propagate.is_empty() {
            let ids: Vec<BatchId> = to_propagate.into_iter().collect();
            let (propagated, failures) = self.propagate(&ids, &live).await;
            report.propagated = propagated;
            report.propagation_failures = failures;
        }

        report.persisted = self.persist().await;
        report
    }

    fn evaluate_batch(
        &self,
        batch_id: BatchId,
        prices: &PriceBook,
        report: &mut CycleReport,
    ) -> Option<LayerTrigger> {
        let batch = self.registry.batch(batch_id)?;
        let Some(quote) = prices.get(&batch.symbol) else {
            debug!("No price for {}, skipping batch {}", batch.symbol, batch_id);
            return None;
        };
        let price = quote.for_direction(batch.direction);

        match self.evaluator.evaluate(batch, price, Utc::now()) {
            TriggerDecision::AddLayer { trigger, pending } => {
                report
                    .pending
                    .extend(pending.into_iter().map(|level| (batch_id, level)));
                Some(trigger)
            }
            TriggerDecision::NotReached { next_trigger } => {
                debug!(
                    "Batch {} ({} {}): price {} above next trigger {}",
                    batch_id, batch.symbol, batch.direction, price, next_trigger
                );
                None
            }
            TriggerDecision::Cooldown { .. } | TriggerDecision::MaxLayers => None,
        }
    }

    /// Add the layer a trigger asked for; `None` when the decider blocks it
    async fn add_triggered_layer(
        &mut self,
        batch_id: BatchId,
        trigger: &LayerTrigger,
    ) -> Result<Option<LayerAdded>> {
        let batch = self
            .registry
            .batch(batch_id)
            .ok_or(EngineError::BatchNotFound(batch_id))?;

        if bypasses_decider(trigger.layer_number, self.bypass_layer) {
            debug!(
                "Layer {} of batch {} bypasses the decision layer",
                trigger.layer_number, batch_id
            );
        } else {
            let verdict = self.decider.can_trade(&batch.symbol, batch.direction);
            if !verdict.allowed {
                info!(
                    "Layer {} of batch {} blocked: {}",
                    trigger.layer_number, batch_id, verdict.reason
                );
                return Ok(None);
            }
        }

        let base = self
            .sizer
            .base_volume(batch)
            .ok_or_else(|| EngineError::InvalidVolume(format!("batch {} has no layers", batch_id)))?;
        let volume = self
            .sizer
            .volume_for_layer(&batch.symbol, base, trigger.layer_number);
        let target = batch.target_price();

        self.place_layer(batch_id, volume, target).await.map(Some)
    }

    /// Place the order for the batch's next layer and record it
    async fn place_layer(
        &mut self,
        batch_id: BatchId,
        volume: Decimal,
        target_price: Option<Decimal>,
    ) -> Result<LayerAdded> {
        let batch = self
            .registry
            .batch(batch_id)
            .ok_or(EngineError::BatchNotFound(batch_id))?;
        let label = batch.label_for(batch.next_layer_index()).encode();
        let request = OrderRequest {
            symbol: batch.symbol.clone(),
            side: batch.direction.side(),
            volume,
            target_price,
            label,
            tag: self.strategy_tag.clone(),
        };

        info!(
            "Placing {} {} {} ({})",
            request.side, request.volume, request.symbol, request.label
        );
        let fill = self.broker.place_order(request).await?;
        self.registry
            .add_layer(batch_id, fill.fill_volume, fill.fill_price, Some(fill.id))
    }

    async fn propagate(
        &self,
        batch_ids: &[BatchId],
        live: &[BrokerPosition],
    ) -> (Vec<PropagationReport>, Vec<(BatchId, String)>) {
        let mut reports = Vec::new();
        let mut failures = Vec::new();

        for &batch_id in batch_ids {
            let Some(batch) = self.registry.batch(batch_id) else {
                continue;
            };
            match self
                .propagator
                .propagate(self.broker.as_ref(), batch, live)
                .await
            {
                Ok(report) => reports.push(report),
                Err(e) => failures.push((batch_id, e.to_string())),
            }
        }

        (reports, failures)
    }

    /// Set or clear the emergency flag and persist it
    pub async fn set_emergency_stop(&mut self, active: bool) {
        self.registry.set_emergency_stop(active);
        self.persist().await;
    }

    /// Track the initial balance and latch the emergency stop on excess
    /// drawdown
    pub async fn check_drawdown(&mut self, balance: Decimal, equity: Decimal) -> bool {
        let initial = self.registry.track_initial_balance(balance);
        if !self.registry.emergency_stop_active() && self.emergency.drawdown_breached(initial, equity) {
            warn!(
                "Drawdown {}% from initial balance {}: latching emergency stop",
                EmergencyMonitor::drawdown_percent(initial, equity).round_dp(2),
                initial
            );
            self.set_emergency_stop(true).await;
        }
        self.registry.emergency_stop_active()
    }

    /// Write the current registry; failures are logged
    pub async fn persist(&self) -> bool {
        match self.store.save(&self.registry).await {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to persist state: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperBroker;
    use crate::common::traits::{MockDecider, TradeVerdict};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.persistence.state_file = dir.path().join("state.json");
        config.risk.emergency_file = dir.path().join("emergency.json");
        config.propagation.backoff_ms = 0;
        config
    }

    fn signal() -> EntrySignal {
        EntrySignal {
            symbol: "EURUSD".to_string(),
            direction: Direction::Long,
            volume: dec!(0.01),
            layer_spacing: dec!(0.0050),
        }
    }

    #[tokio::test]
    async fn test_blocked_entry_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let broker = Arc::new(PaperBroker::new());
        broker.set_quote("EURUSD", Quote::flat(dec!(1.1000)));

        let mut decider = MockDecider::new();
        decider
            .expect_can_trade()
            .times(1)
            .returning(|_, _| TradeVerdict::block("news blackout"));

        let mut engine = BatchEngine::new(&config(&dir), broker.clone(), Arc::new(decider));
        let result = engine.open_batch(&signal(), Quote::flat(dec!(1.1000))).await.unwrap();
        assert!(result.is_none());
        assert!(engine.registry().is_empty());
        assert_eq!(broker.orders_placed(), 0);
    }

    #[tokio::test]
    async fn test_rejected_entry_removes_empty_batch() {
        let dir = TempDir::new().unwrap();
        let broker = Arc::new(PaperBroker::new());
        broker.set_quote("EURUSD", Quote::flat(dec!(1.1000)));
        broker.reject_symbol("EURUSD", "market closed");

        let mut decider = MockDecider::new();
        decider
            .expect_can_trade()
            .returning(|_, _| TradeVerdict::allow("ok"));

        let mut engine = BatchEngine::new(&config(&dir), broker, Arc::new(decider));
        let result = engine.open_batch(&signal(), Quote::flat(dec!(1.1000))).await;
        assert!(matches!(result, Err(EngineError::OrderRejected { .. })));
        assert!(engine.registry().is_empty());
        assert_eq!(engine.registry().next_batch_id(), 2);
    }

    #[tokio::test]
    async fn test_deep_layer_skips_decider() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.martingale.cooldown_seconds = 0;
        let broker = Arc::new(PaperBroker::new());
        broker.set_quote("EURUSD", Quote::flat(dec!(1.1000)));

        // entry and layer 2 consult the decider; layer 3 must not
        let mut decider = MockDecider::new();
        decider
            .expect_can_trade()
            .times(2)
            .returning(|_, _| TradeVerdict::allow("ok"));

        let mut engine = BatchEngine::new(&config, broker.clone(), Arc::new(decider));
        engine.open_batch(&signal(), Quote::flat(dec!(1.1000))).await.unwrap();

        for price in [dec!(1.0950), dec!(1.0900)] {
            broker.set_quote("EURUSD", Quote::flat(price));
            let mut prices = PriceBook::new();
            prices.insert("EURUSD".to_string(), Quote::flat(price));
            let report = engine.run_cycle(&prices).await;
            assert_eq!(report.layers_added.len(), 1);
        }
        assert_eq!(engine.registry().batches().next().unwrap().layer_count(), 3);
    }
}
