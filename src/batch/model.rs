use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::label::BatchLabel;
use crate::common::types::Direction;

/// Process-wide batch identifier
pub type BatchId = u64;

/// Registry key: at most one batch per symbol and direction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchKey {
    pub symbol: String,
    pub direction: Direction,
}

impl BatchKey {
    pub fn new(symbol: impl Into<String>, direction: Direction) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
        }
    }
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.symbol, self.direction)
    }
}

/// One position within a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// 1-based, strictly increasing within a batch, never reused
    pub layer_index: u32,
    pub volume: Decimal,
    pub entry_price: Decimal,
    /// Shared exit target, the same for every layer of the batch
    pub target_price: Option<Decimal>,
    /// Absent until the broker confirms the order
    pub broker_position_id: Option<String>,
    pub entry_timestamp: DateTime<Utc>,
    pub label: String,
}

/// A group of same-direction positions on one instrument, exited together
///
/// `total_volume` and `breakeven_price` are always derived from `layers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    pub symbol: String,
    pub direction: Direction,
    pub initial_entry_price: Decimal,
    /// Price distance between trigger levels, fixed at creation
    pub layer_spacing: Decimal,
    pub layers: Vec<Layer>,
    /// Highest layer index ever assigned, survives pruning
    #[serde(default)]
    pub last_layer_index: u32,
    /// Volume of layer 1, kept after that layer closes
    #[serde(default)]
    pub initial_volume: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub last_layer_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(
        batch_id: BatchId,
        symbol: impl Into<String>,
        direction: Direction,
        initial_entry_price: Decimal,
        layer_spacing: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            batch_id,
            symbol: symbol.into(),
            direction,
            initial_entry_price,
            layer_spacing,
            layers: Vec::new(),
            last_layer_index: 0,
            initial_volume: None,
            created_at,
            last_layer_at: created_at,
        }
    }

    pub fn key(&self) -> BatchKey {
        BatchKey::new(self.symbol.clone(), self.direction)
    }

    pub fn layer_count(&self) -> u32 {
        self.layers.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Highest layer index ever assigned (not the count; pruning leaves gaps)
    pub fn highest_layer_index(&self) -> u32 {
        self.layers
            .iter()
            .map(|l| l.layer_index)
            .max()
            .unwrap_or(0)
            .max(self.last_layer_index)
    }

    /// Index the next layer will receive
    pub fn next_layer_index(&self) -> u32 {
        self.highest_layer_index() + 1
    }

    pub fn total_volume(&self) -> Decimal {
        self.layers.iter().map(|l| l.volume).sum()
    }

    /// Volume-weighted average entry; None for an empty batch
    pub fn breakeven_price(&self) -> Option<Decimal> {
        let total = self.total_volume();
        if total <= Decimal::ZERO {
            return None;
        }
        let invested: Decimal = self.layers.iter().map(|l| l.volume * l.entry_price).sum();
        Some(invested / total)
    }

    /// Current shared target, taken from the newest layer
    pub fn target_price(&self) -> Option<Decimal> {
        self.layers.last().and_then(|l| l.target_price)
    }

    /// Lowest surviving layer
    pub fn first_layer(&self) -> Option<&Layer> {
        self.layers.first()
    }

    pub fn label_for(&self, layer_index: u32) -> BatchLabel {
        BatchLabel::new(self.batch_id, self.symbol.clone(), self.direction, layer_index)
    }

    /// Append a layer; keeps indices strictly increasing
    pub fn add_trade(
        &mut self,
        volume: Decimal,
        entry_price: Decimal,
        broker_position_id: Option<String>,
        at: DateTime<Utc>,
    ) -> &Layer {
        let layer_index = self.next_layer_index();
        let label = self.label_for(layer_index).encode();
        self.layers.push(Layer {
            layer_index,
            volume,
            entry_price,
            target_price: self.target_price(),
            broker_position_id,
            entry_timestamp: at,
            label,
        });
        if layer_index == 1 {
            self.initial_volume = Some(volume);
        }
        self.last_layer_index = layer_index;
        self.last_layer_at = at;
        &self.layers[self.layers.len() - 1]
    }

    /// Apply one target to every layer
    pub fn set_target(&mut self, target: Decimal) {
        for layer in &mut self.layers {
            layer.target_price = Some(target);
        }
    }

    /// Drop layers whose broker id fails `is_live`, returning them
    ///
    /// Layers without a broker id are kept: they have not been confirmed yet.
    pub fn retain_live<F>(&mut self, mut is_live: F) -> Vec<Layer>
    where
        F: FnMut(&str) -> bool,
    {
        let mut removed = Vec::new();
        self.layers.retain(|layer| match &layer.broker_position_id {
            Some(id) if !is_live(id) => {
                removed.push(layer.clone());
                false
            }
            _ => true,
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn batch() -> Batch {
        Batch::new(1, "EURUSD", Direction::Long, dec!(1.1000), dec!(0.0050), Utc::now())
    }

    #[test]
    fn test_breakeven_two_layers() {
        let mut b = batch();
        b.add_trade(dec!(1), dec!(1.1000), Some("1".into()), Utc::now());
        b.add_trade(dec!(2), dec!(1.0950), Some("2".into()), Utc::now());

        assert_eq!(b.total_volume(), dec!(3));
        let breakeven = b.breakeven_price().unwrap();
        assert_eq!(breakeven.round_dp(5), dec!(1.09667));
    }

    #[test]
    fn test_layer_indices_and_labels() {
        let mut b = batch();
        b.add_trade(dec!(0.01), dec!(1.1000), None, Utc::now());
        b.add_trade(dec!(0.02), dec!(1.0950), None, Utc::now());
        assert_eq!(b.layers[0].layer_index, 1);
        assert_eq!(b.layers[1].layer_index, 2);
        assert_eq!(b.layers[1].label, "BM01_EURUSD_B02");
    }

    #[test]
    fn test_indices_not_reused_after_pruning() {
        let mut b = batch();
        b.add_trade(dec!(1), dec!(1.1000), Some("a".into()), Utc::now());
        b.add_trade(dec!(2), dec!(1.0950), Some("b".into()), Utc::now());
        b.add_trade(dec!(4), dec!(1.0900), Some("c".into()), Utc::now());

        let removed = b.retain_live(|id| id != "c");
        assert_eq!(removed.len(), 1);
        assert_eq!(b.layer_count(), 2);
        assert_eq!(b.next_layer_index(), 4);

        let removed = b.retain_live(|id| id != "a");
        assert_eq!(removed[0].layer_index, 1);
        assert_eq!(b.next_layer_index(), 4);
        assert_eq!(b.breakeven_price(), Some(dec!(1.0950)));
        assert_eq!(b.initial_volume, Some(dec!(1)));
    }

    #[test]
    fn test_empty_batch_has_no_breakeven() {
        let b = batch();
        assert!(b.is_empty());
        assert_eq!(b.breakeven_price(), None);
        assert_eq!(b.total_volume(), Decimal::ZERO);
    }

    #[test]
    fn test_set_target_applies_to_all() {
        let mut b = batch();
        b.add_trade(dec!(1), dec!(1.1000), None, Utc::now());
        b.add_trade(dec!(2), dec!(1.0950), None, Utc::now());
        b.set_target(dec!(1.0980));
        assert!(b.layers.iter().all(|l| l.target_price == Some(dec!(1.0980))));
        assert_eq!(b.target_price(), Some(dec!(1.0980)));
    }
}
