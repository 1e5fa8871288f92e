use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::model::Batch;
use crate::config::types::MartingaleConfig;

/// A trigger level that the current price has reached
#[derive(Debug, Clone, PartialEq)]
pub struct LayerTrigger {
    /// Index of the layer this level opens
    pub layer_number: u32,
    pub trigger_price: Decimal,
    pub current_price: Decimal,
}

/// Outcome of evaluating one batch against the current price
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerDecision {
    /// Add one layer now
    AddLayer {
        trigger: LayerTrigger,
        /// Further levels also crossed; reported, not acted on this cycle
        pending: Vec<LayerTrigger>,
    },
    /// Price has not reached the next level
    NotReached { next_trigger: Decimal },
    /// Level reached but the previous layer is too recent
    Cooldown { trigger: LayerTrigger, remaining: Duration },
    /// Batch already holds the maximum number of layers
    MaxLayers,
}

impl TriggerDecision {
    pub fn is_add(&self) -> bool {
        matches!(self, TriggerDecision::AddLayer { .. })
    }
}

/// Decides whether a batch should receive another layer
///
/// Trigger levels are measured from the batch's initial entry, not from the
/// previous layer: level `n` sits at `initial ∓ spacing × n` where `n` is the
/// highest layer index assigned so far. Closed layers do not pull the next
/// level back toward the entry.
#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    max_layers: u32,
    cooldown: Duration,
    lookahead: u32,
}

impl TriggerEvaluator {
    pub fn new(max_layers: u32, cooldown: Duration, lookahead: u32) -> Self {
        Self {
            max_layers,
            cooldown,
            lookahead,
        }
    }

    pub fn from_config(config: &MartingaleConfig) -> Self {
        Self::new(
            config.max_layers,
            Duration::seconds(config.cooldown_seconds as i64),
            config.trigger_lookahead,
        )
    }

    pub fn max_layers(&self) -> u32 {
        self.max_layers
    }

    /// Price that opens the layer after `layer_index`
    pub fn trigger_price(batch: &Batch, layer_index: u32) -> Decimal {
        let distance = batch.layer_spacing * Decimal::from(layer_index);
        batch.initial_entry_price - batch.direction.sign() * distance
    }

    pub fn next_trigger_price(batch: &Batch) -> Decimal {
        Self::trigger_price(batch, batch.highest_layer_index())
    }

    /// All trigger levels from the next one up to `lookahead` further,
    /// capped at `max_layers`, that `price` has reached
    pub fn reached_levels(&self, batch: &Batch, price: Decimal, lookahead: u32) -> Vec<LayerTrigger> {
        let current = batch.highest_layer_index();
        let last = (current + 1 + lookahead).min(self.max_layers);

        ((current + 1)..=last)
            .map(|layer_number| LayerTrigger {
                layer_number,
                trigger_price: Self::trigger_price(batch, layer_number - 1),
                current_price: price,
            })
            .filter(|t| batch.direction.reached(price, t.trigger_price))
            .collect()
    }

    /// Evaluate a batch at `price` and time `now`
    pub fn evaluate(&self, batch: &Batch, price: Decimal, now: DateTime<Utc>) -> TriggerDecision {
        if batch.highest_layer_index() >= self.max_layers {
            debug!(
                "{} {} batch {} at max layers ({})",
                batch.symbol, batch.direction, batch.batch_id, self.max_layers
            );
            return TriggerDecision::MaxLayers;
        }

        let mut reached = self.reached_levels(batch, price, self.lookahead);
        if reached.is_empty() {
            return TriggerDecision::NotReached {
                next_trigger: Self::next_trigger_price(batch),
            };
        }

        let trigger = reached.remove(0);
        let elapsed = now - batch.last_layer_at;
        // a zero cooldown disables the check
        if self.cooldown > Duration::zero() && elapsed <= self.cooldown {
            info!(
                "Fast move protection: {} {} layer {} - {}s < {}s",
                batch.symbol,
                batch.direction,
                trigger.layer_number,
                elapsed.num_seconds(),
                self.cooldown.num_seconds()
            );
            return TriggerDecision::Cooldown {
                remaining: self.cooldown - elapsed,
                trigger,
            };
        }

        for missed in &reached {
            warn!(
                "Pending layer {} for {} {} batch {}: trigger {} crossed (price {}), one layer per cycle",
                missed.layer_number,
                batch.symbol,
                batch.direction,
                batch.batch_id,
                missed.trigger_price,
                missed.current_price
            );
        }

        info!(
            "Layer opportunity: {} {} layer {} - trigger {}, current {}",
            batch.symbol, batch.direction, trigger.layer_number, trigger.trigger_price, price
        );

        TriggerDecision::AddLayer {
            trigger,
            pending: reached,
        }
    }
}
