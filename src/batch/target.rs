use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::instruments::{base_target_pips, pip_size, DEFAULT_BASE_TARGET_PIPS};
use super::model::Batch;
use crate::common::types::Direction;

/// Layer depth from which every batch is in "emergency exit" mode
pub const EMERGENCY_BUCKET: u32 = 8;

/// Share of the base profit distance kept at layer 1..=8
const URGENCY_MULTIPLIERS: [Decimal; EMERGENCY_BUCKET as usize] = [
    dec!(1.0),
    dec!(0.8),
    dec!(0.6),
    dec!(0.4),
    dec!(0.25),
    dec!(0.15),
    dec!(0.10),
    dec!(0.05),
];

/// Floor on the profit distance below the emergency bucket, in pips
pub const MIN_PROFIT_PIPS: Decimal = dec!(2);
/// Floor on the profit distance in the emergency bucket, in pips
pub const EMERGENCY_MIN_PROFIT_PIPS: Decimal = dec!(1);

/// Adaptive exit target calculation
///
/// The deeper a batch has gone, the less profit it waits for: the
/// required distance above (long) or below (short) breakeven shrinks along
/// a fixed urgency curve until the emergency bucket. Depth is the highest
/// layer index assigned, so partial closures keep the batch's urgency.
///
/// All functions are pure.
pub struct TargetCalculator;

impl TargetCalculator {
    /// Urgency bucket for a layer count, clamped to `1..=EMERGENCY_BUCKET`
    pub fn urgency_bucket(layer_depth: u32) -> u32 {
        layer_depth.clamp(1, EMERGENCY_BUCKET)
    }

    pub fn urgency_multiplier(layer_depth: u32) -> Decimal {
        URGENCY_MULTIPLIERS[(Self::urgency_bucket(layer_depth) - 1) as usize]
    }

    /// Required profit distance in pips
    pub fn profit_distance_pips(symbol: &str, layer_depth: u32) -> Decimal {
        let base = base_target_pips(symbol).unwrap_or(DEFAULT_BASE_TARGET_PIPS);
        let pips = base * Self::urgency_multiplier(layer_depth);

        let floor = if Self::urgency_bucket(layer_depth) < EMERGENCY_BUCKET {
            MIN_PROFIT_PIPS
        } else {
            EMERGENCY_MIN_PROFIT_PIPS
        };
        pips.max(floor)
    }

    /// Required profit distance in price units
    pub fn profit_distance(symbol: &str, layer_depth: u32) -> Decimal {
        Self::profit_distance_pips(symbol, layer_depth) * pip_size(symbol)
    }

    /// Target = breakeven ± profit distance
    pub fn target_price(
        symbol: &str,
        direction: Direction,
        breakeven_price: Decimal,
        layer_depth: u32,
    ) -> Decimal {
        breakeven_price + direction.sign() * Self::profit_distance(symbol, layer_depth)
    }

    /// Shared target for a batch; None for an empty batch
    pub fn for_batch(batch: &Batch) -> Option<Decimal> {
        let breakeven = batch.breakeven_price()?;
        Some(Self::target_price(
            &batch.symbol,
            batch.direction,
            breakeven,
            batch.highest_layer_index(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_first_layer_full_target() {
        // EURUSD: 15 pips at 0.0001
        let target = TargetCalculator::target_price("EURUSD", Direction::Long, dec!(1.1000), 1);
        assert_eq!(target, dec!(1.1015));

        let target = TargetCalculator::target_price("EURUSD", Direction::Short, dec!(1.1000), 1);
        assert_eq!(target, dec!(1.0985));
    }

    #[test]
    fn test_urgency_curve() {
        assert_eq!(TargetCalculator::urgency_multiplier(0), dec!(1.0));
        assert_eq!(TargetCalculator::urgency_multiplier(2), dec!(0.8));
        assert_eq!(TargetCalculator::urgency_multiplier(5), dec!(0.25));
        assert_eq!(TargetCalculator::urgency_multiplier(8), dec!(0.05));
        assert_eq!(TargetCalculator::urgency_multiplier(15), dec!(0.05));
    }

    #[test]
    fn test_floors() {
        // 15 * 0.10 = 1.5 pips -> floored to 2 at layer 7
        assert_eq!(TargetCalculator::profit_distance_pips("EURUSD", 7), dec!(2));
        // 15 * 0.05 = 0.75 pips -> emergency floor of 1
        assert_eq!(TargetCalculator::profit_distance_pips("EURUSD", 8), dec!(1));
        // 50 * 0.05 = 2.5 pips stays above the emergency floor
        assert_eq!(TargetCalculator::profit_distance_pips("BTCUSD", 12), dec!(2.5));
    }

    #[test]
    fn test_unmapped_symbol_uses_default() {
        assert_eq!(TargetCalculator::profit_distance_pips("EURGBP", 1), dec!(15));
        assert_eq!(TargetCalculator::profit_distance("EURGBP", 1), dec!(0.0015));
    }

    #[test]
    fn test_distance_never_increases_with_layers() {
        for symbol in ["EURUSD", "BTCUSD", "XAUUSD", "USDJPY", "AUDNZD", "UNKNOWN"] {
            let mut previous = TargetCalculator::profit_distance(symbol, 1);
            for layers in 2..=20 {
                let current = TargetCalculator::profit_distance(symbol, layers);
                assert!(
                    current <= previous,
                    "{} distance grew at layer {}: {} > {}",
                    symbol,
                    layers,
                    current,
                    previous
                );
                assert!(current > Decimal::ZERO);
                previous = current;
            }
        }
    }

    #[test]
    fn test_for_batch() {
        let mut batch = Batch::new(1, "EURUSD", Direction::Long, dec!(1.1000), dec!(0.0050), Utc::now());
        assert_eq!(TargetCalculator::for_batch(&batch), None);

        batch.add_trade(dec!(1), dec!(1.1000), None, Utc::now());
        batch.add_trade(dec!(1), dec!(1.0950), None, Utc::now());
        // breakeven 1.0975, layer 2 -> 12 pips
        assert_eq!(TargetCalculator::for_batch(&batch), Some(dec!(1.0987)));
    }

    #[test]
    fn test_partial_closure_keeps_urgency() {
        let mut batch = Batch::new(1, "EURUSD", Direction::Long, dec!(1.1000), dec!(0.0050), Utc::now());
        batch.add_trade(dec!(1), dec!(1.1000), Some("a".into()), Utc::now());
        batch.add_trade(dec!(2), dec!(1.0950), Some("b".into()), Utc::now());
        batch.add_trade(dec!(4), dec!(1.0900), Some("c".into()), Utc::now());
        batch.retain_live(|id| id != "a");

        // breakeven (2 x 1.0950 + 4 x 1.0900) / 6, depth 3 -> 9 pips
        let breakeven = batch.breakeven_price().unwrap();
        assert_eq!(TargetCalculator::for_batch(&batch), Some(breakeven + dec!(0.0009)));
    }
}
