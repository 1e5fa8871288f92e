use rust_decimal::Decimal;
use tracing::debug;

use super::instruments::VolumeRules;
use super::model::Batch;

/// Volume for successive layers: `base × multiplier^(layer − 1)`,
/// normalized to the symbol's broker limits
#[derive(Debug, Clone)]
pub struct LayerSizer {
    multiplier: Decimal,
}

impl LayerSizer {
    pub fn new(multiplier: Decimal) -> Self {
        Self { multiplier }
    }

    /// Layer-1 volume of a batch
    ///
    /// Taken from the batch when it recorded one. Otherwise (an adopted batch
    /// whose first layer was already closed) derived back from the lowest
    /// surviving layer.
    pub fn base_volume(&self, batch: &Batch) -> Option<Decimal> {
        if let Some(volume) = batch.initial_volume {
            return Some(volume);
        }
        let first = batch.first_layer()?;
        let mut base = first.volume;
        for _ in 1..first.layer_index {
            if self.multiplier.is_zero() {
                break;
            }
            base /= self.multiplier;
        }
        Some(base)
    }

    pub fn volume_for_layer(&self, symbol: &str, base_volume: Decimal, layer_number: u32) -> Decimal {
        let exponent = layer_number.saturating_sub(1);
        let mut raw = base_volume;
        for _ in 0..exponent {
            raw *= self.multiplier;
        }
        let rules = VolumeRules::for_symbol(symbol);
        let volume = rules.normalize(raw);
        debug!(
            "{} layer {} volume: base {} x {}^{} = {} -> {}",
            symbol, layer_number, base_volume, self.multiplier, exponent, raw, volume
        );
        volume
    }
}

impl Default for LayerSizer {
    fn default() -> Self {
        Self::new(Decimal::TWO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Direction;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_doubling() {
        let sizer = LayerSizer::default();
        assert_eq!(sizer.volume_for_layer("EURUSD", dec!(0.01), 1), dec!(0.01));
        assert_eq!(sizer.volume_for_layer("EURUSD", dec!(0.01), 2), dec!(0.02));
        assert_eq!(sizer.volume_for_layer("EURUSD", dec!(0.01), 4), dec!(0.08));
    }

    #[test]
    fn test_capped_by_symbol_max() {
        let sizer = LayerSizer::default();
        // 0.1 * 2^6 = 6.4, BTCUSD max is 1.0
        assert_eq!(sizer.volume_for_layer("BTCUSD", dec!(0.1), 7), dec!(1.0));
    }

    #[test]
    fn test_fractional_multiplier_rounds_to_step() {
        let sizer = LayerSizer::new(dec!(1.5));
        assert_eq!(sizer.volume_for_layer("EURUSD", dec!(0.04), 2), dec!(0.06));
        // 0.03 * 2.25 = 0.0675 -> 0.07
        assert_eq!(sizer.volume_for_layer("EURUSD", dec!(0.03), 3), dec!(0.07));
    }

    #[test]
    fn test_base_survives_first_layer_closing() {
        let sizer = LayerSizer::default();
        let mut batch = Batch::new(1, "EURUSD", Direction::Long, dec!(1.1000), dec!(0.0050), Utc::now());
        batch.add_trade(dec!(0.01), dec!(1.1000), Some("a".into()), Utc::now());
        batch.add_trade(dec!(0.02), dec!(1.0950), Some("b".into()), Utc::now());
        batch.retain_live(|id| id != "a");

        assert_eq!(sizer.base_volume(&batch), Some(dec!(0.01)));
        assert_eq!(sizer.volume_for_layer("EURUSD", dec!(0.01), batch.next_layer_index()), dec!(0.04));
    }

    #[test]
    fn test_base_derived_without_layer_one() {
        let sizer = LayerSizer::default();
        let mut batch = Batch::new(1, "EURUSD", Direction::Long, dec!(1.1000), dec!(0.0050), Utc::now());
        batch.last_layer_index = 2;
        batch.add_trade(dec!(0.04), dec!(1.0900), Some("c".into()), Utc::now());
        assert_eq!(batch.layers[0].layer_index, 3);
        assert_eq!(batch.initial_volume, None);
        assert_eq!(sizer.base_volume(&batch), Some(dec!(0.01)));
    }
}
