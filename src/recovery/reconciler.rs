use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

use crate::batch::instruments::pip_size;
use crate::batch::label::BatchLabel;
use crate::batch::model::{Batch, BatchId, BatchKey, Layer};
use crate::batch::registry::{BatchRegistry, RegistryCounters};
use crate::batch::target::TargetCalculator;
use crate::batch::trigger::TriggerEvaluator;
use crate::common::traits::Broker;
use crate::common::types::{BrokerPosition, Direction, PriceBook};
use crate::config::types::MartingaleConfig;
use crate::persistence::snapshot::Snapshot;
use crate::persistence::store::{SnapshotSource, SnapshotStore};

/// A trigger level crossed while the engine was offline
#[derive(Debug, Clone, PartialEq)]
pub struct MissedLayer {
    pub batch_id: BatchId,
    pub symbol: String,
    pub direction: Direction,
    pub layer_number: u32,
    pub trigger_price: Decimal,
    pub current_price: Decimal,
}

/// What startup recovery did
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub snapshot_source: Option<SnapshotSource>,
    /// False when the broker could not be reached and the snapshot was
    /// restored as-is
    pub broker_verified: bool,
    /// Snapshot batches rebuilt from live positions
    pub rebuilt: Vec<BatchId>,
    /// Snapshot batches with no live positions left
    pub completed_offline: Vec<BatchId>,
    /// Batches synthesized from labeled positions missing from the snapshot
    pub adopted: Vec<BatchId>,
    /// Broker positions whose label could not be parsed
    pub unlabeled: Vec<String>,
    pub missed_layers: Vec<MissedLayer>,
}

impl RecoveryReport {
    /// Batches whose target must be pushed to the broker after recovery
    pub fn needs_propagation(&self) -> Vec<BatchId> {
        self.rebuilt.iter().chain(self.adopted.iter()).copied().collect()
    }
}

type LiveGroup<'a> = Vec<(BatchLabel, &'a BrokerPosition)>;

/// Rebuilds the registry at startup from the last snapshot and the
/// broker's live positions
///
/// The broker is authoritative for what is open. The snapshot contributes
/// batch identity, creation time, initial entry and spacing.
#[derive(Debug, Clone)]
pub struct RecoveryReconciler {
    evaluator: TriggerEvaluator,
    missed_layer_lookahead: u32,
    orphan_spacing_pips: Decimal,
}

impl RecoveryReconciler {
    pub fn new(evaluator: TriggerEvaluator, missed_layer_lookahead: u32, orphan_spacing_pips: Decimal) -> Self {
        Self {
            evaluator,
            missed_layer_lookahead,
            orphan_spacing_pips,
        }
    }

    pub fn from_config(config: &MartingaleConfig) -> Self {
        Self::new(
            TriggerEvaluator::from_config(config),
            config.missed_layer_lookahead,
            config.orphan_spacing_pips,
        )
    }

    /// Load state, fetch live positions and reconcile
    ///
    /// Never fails. An unreachable broker restores the snapshot unverified;
    /// the first cycle's sync then reconciles it.
    #[instrument(skip_all)]
    pub async fn recover(
        &self,
        store: &SnapshotStore,
        broker: &dyn Broker,
        prices: &PriceBook,
    ) -> (BatchRegistry, RecoveryReport) {
        let loaded = store.load_with_fallback().await;
        let source = loaded.as_ref().map(|(_, source)| *source);
        let snapshot = loaded.map(|(snapshot, _)| snapshot);

        let (registry, mut report) = match broker.get_positions(store.strategy_tag()).await {
            Ok(live) => self.reconcile(snapshot, &live, prices),
            Err(e) => {
                warn!(
                    "Broker {} unavailable during recovery, restoring saved state unverified: {}",
                    broker.broker_name(),
                    e
                );
                let registry = snapshot.map(Snapshot::into_registry).unwrap_or_default();
                (registry, RecoveryReport::default())
            }
        };

        report.snapshot_source = source;
        info!(
            "Recovery complete: {} batches ({} rebuilt, {} adopted, {} completed offline), next batch id {}",
            registry.len(),
            report.rebuilt.len(),
            report.adopted.len(),
            report.completed_offline.len(),
            registry.next_batch_id()
        );
        (registry, report)
    }

    /// Reconcile a snapshot against live broker positions
    pub fn reconcile(
        &self,
        snapshot: Option<Snapshot>,
        live: &[BrokerPosition],
        prices: &PriceBook,
    ) -> (BatchRegistry, RecoveryReport) {
        let mut report = RecoveryReport {
            broker_verified: true,
            ..RecoveryReport::default()
        };

        let (mut groups, highest_label_id) = group_by_key(live, &mut report.unlabeled);

        let (snapshot_batches, mut counters) = match snapshot {
            Some(snapshot) => {
                let counters = snapshot.counters();
                (snapshot.batches.into_values().collect::<Vec<_>>(), counters)
            }
            None => (Vec::new(), RegistryCounters::default()),
        };
        if let Some(highest) = highest_label_id {
            counters.next_batch_id = counters.next_batch_id.max(highest + 1);
        }

        let mut batches = Vec::new();

        for saved in snapshot_batches {
            let key = saved.key();
            match groups.remove(&key) {
                Some(group) => {
                    let batch = rebuild(saved, group);
                    info!(
                        "Recovered batch {} for {}: {} layers, volume {}, breakeven {:?}",
                        batch.batch_id,
                        key,
                        batch.layer_count(),
                        batch.total_volume(),
                        batch.breakeven_price().map(|p| p.round_dp(5))
                    );
                    report.rebuilt.push(batch.batch_id);
                    batches.push(batch);
                }
                None => {
                    info!(
                        "Batch {} for {} closed while offline, dropping",
                        saved.batch_id, key
                    );
                    report.completed_offline.push(saved.batch_id);
                }
            }
        }

        for (key, group) in groups {
            let batch_id = counters.next_batch_id;
            counters.next_batch_id += 1;
            let batch = self.adopt(batch_id, &key, group);
            warn!(
                "Adopted orphaned positions for {} as batch {}: {} layers, volume {}",
                key,
                batch_id,
                batch.layer_count(),
                batch.total_volume()
            );
            report.adopted.push(batch_id);
            batches.push(batch);
        }

        for batch in &mut batches {
            if let Some(target) = TargetCalculator::for_batch(batch) {
                batch.set_target(target);
            }
            report.missed_layers.extend(self.missed_layers(batch, prices));
        }

        (BatchRegistry::from_parts(batches, counters), report)
    }

    fn adopt(&self, batch_id: BatchId, key: &BatchKey, group: LiveGroup<'_>) -> Batch {
        let created_at = group
            .iter()
            .map(|(_, p)| p.opened_at)
            .min()
            .unwrap_or_else(Utc::now);
        let spacing = self.orphan_spacing_pips * pip_size(&key.symbol);
        // Lowest surviving entry, projected back to layer 1 when that layer is gone
        let initial_entry = group
            .first()
            .map(|(label, p)| {
                let steps = Decimal::from(label.layer_index.saturating_sub(1));
                p.entry_price + key.direction.sign() * spacing * steps
            })
            .unwrap_or_default();

        let mut batch = Batch::new(
            batch_id,
            key.symbol.clone(),
            key.direction,
            initial_entry,
            spacing,
            created_at,
        );
        fill_layers(&mut batch, group);
        batch
    }

    fn missed_layers(&self, batch: &Batch, prices: &PriceBook) -> Vec<MissedLayer> {
        let Some(quote) = prices.get(&batch.symbol) else {
            debug!("No price for {}, skipping missed-layer check", batch.symbol);
            return Vec::new();
        };
        let price = quote.for_direction(batch.direction);

        self.evaluator
            .reached_levels(batch, price, self.missed_layer_lookahead)
            .into_iter()
            .map(|level| {
                warn!(
                    "Missed layer {} for {} {} batch {}: trigger {} passed while offline (price {}), not executing",
                    level.layer_number,
                    batch.symbol,
                    batch.direction,
                    batch.batch_id,
                    level.trigger_price,
                    price
                );
                MissedLayer {
                    batch_id: batch.batch_id,
                    symbol: batch.symbol.clone(),
                    direction: batch.direction,
                    layer_number: level.layer_number,
                    trigger_price: level.trigger_price,
                    current_price: price,
                }
            })
            .collect()
    }
}

/// Group labeled positions by key, ordered by layer index
///
/// Returns the groups and the highest batch id seen in any label.
fn group_by_key<'a>(
    live: &'a [BrokerPosition],
    unlabeled: &mut Vec<String>,
) -> (BTreeMap<BatchKey, LiveGroup<'a>>, Option<BatchId>) {
    let mut groups: BTreeMap<BatchKey, LiveGroup<'a>> = BTreeMap::new();
    let mut highest = None;

    for position in live {
        let label = match BatchLabel::decode(&position.label) {
            Ok(label) => label,
            Err(e) => {
                warn!(
                    "Ignoring position {} ({} {}): {}",
                    position.id, position.symbol, position.volume, e
                );
                unlabeled.push(position.id.clone());
                continue;
            }
        };
        if label.direction != position.side.direction() {
            warn!(
                "Position {} label {} disagrees with side {}, using label",
                position.id, position.label, position.side
            );
        }
        highest = highest.max(Some(label.batch_id));
        groups
            .entry(BatchKey::new(label.symbol.clone(), label.direction))
            .or_default()
            .push((label, position));
    }

    for group in groups.values_mut() {
        group.sort_by(|(a, pa), (b, pb)| {
            a.layer_index
                .cmp(&b.layer_index)
                .then(pa.opened_at.cmp(&pb.opened_at))
        });
    }

    (groups, highest)
}

/// Replace a snapshot batch's layers with live data, keeping its identity
fn rebuild(saved: Batch, group: LiveGroup<'_>) -> Batch {
    let mut batch = Batch::new(
        saved.batch_id,
        saved.symbol.clone(),
        saved.direction,
        saved.initial_entry_price,
        saved.layer_spacing,
        saved.created_at,
    );
    batch.last_layer_index = saved.highest_layer_index();
    batch.last_layer_at = saved.last_layer_at;
    batch.initial_volume = saved.initial_volume;

    for (label, _) in &group {
        if label.batch_id != saved.batch_id {
            debug!(
                "Live label {} carries batch id {}, merging into batch {}",
                label, label.batch_id, saved.batch_id
            );
        }
    }
    fill_layers(&mut batch, group);
    batch
}

fn fill_layers(batch: &mut Batch, group: LiveGroup<'_>) {
    let mut last_opened: Option<DateTime<Utc>> = None;
    for (label, position) in group {
        batch.layers.push(Layer {
            layer_index: label.layer_index,
            volume: position.volume,
            entry_price: position.entry_price,
            target_price: position.target_price,
            broker_position_id: Some(position.id.clone()),
            entry_timestamp: position.opened_at,
            label: position.label.clone(),
        });
        if label.layer_index == 1 {
            batch.initial_volume = Some(position.volume);
        }
        batch.last_layer_index = batch.last_layer_index.max(label.layer_index);
        last_opened = last_opened.max(Some(position.opened_at));
    }
    if let Some(opened) = last_opened {
        batch.last_layer_at = batch.last_layer_at.max(opened);
    }
}
