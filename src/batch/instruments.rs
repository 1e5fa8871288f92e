//! Per-instrument constants: pip size, base profit target, volume limits

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Profit target in pips used when a symbol has no entry in the table
pub const DEFAULT_BASE_TARGET_PIPS: Decimal = dec!(15);

/// Pip size for a symbol
///
/// JPY pairs quote two decimals, indices and gold one, crypto whole units.
pub fn pip_size(symbol: &str) -> Decimal {
    let symbol = symbol.to_ascii_uppercase();
    if symbol.contains("JPY") {
        return dec!(0.01);
    }
    match symbol.as_str() {
        "US500" | "NAS100" | "SPX500" => dec!(0.1),
        "XAUUSD" | "GOLD" => dec!(0.1),
        "BTCUSD" | "ETHUSD" | "XRPUSD" => dec!(1.0),
        _ => dec!(0.0001),
    }
}

/// Base profit distance in pips, reflecting typical instrument volatility
pub fn base_target_pips(symbol: &str) -> Option<Decimal> {
    let pips = match symbol.to_ascii_uppercase().as_str() {
        "BTCUSD" => dec!(50),
        "ETHUSD" => dec!(40),
        "XRPUSD" => dec!(30),
        "XAUUSD" => dec!(25),
        "US500" => dec!(20),
        "EURUSD" | "GBPUSD" => dec!(15),
        "AUDUSD" | "USDCAD" | "USDJPY" | "NZDCAD" => dec!(12),
        "GBPCAD" => dec!(18),
        "AUDCAD" => dec!(15),
        "AUDNZD" => dec!(10),
        _ => return None,
    };
    Some(pips)
}

/// Broker volume constraints for one symbol
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeRules {
    pub min: Decimal,
    pub max: Decimal,
    pub step: Decimal,
}

impl VolumeRules {
    pub fn for_symbol(symbol: &str) -> Self {
        let max = match symbol.to_ascii_uppercase().as_str() {
            "BTCUSD" | "ETHUSD" | "XRPUSD" | "US500" | "NAS100" => dec!(1.0),
            "GBPCAD" | "AUDCAD" | "NZDCAD" | "EURCAD" => dec!(2.0),
            "USDCAD" => dec!(3.0),
            _ => dec!(10.0),
        };
        Self {
            min: dec!(0.01),
            max,
            step: dec!(0.01),
        }
    }

    /// Clamp into `[min, max]` and round to the nearest step
    pub fn normalize(&self, volume: Decimal) -> Decimal {
        let clamped = volume.max(self.min).min(self.max);
        if self.step <= Decimal::ZERO {
            return clamped;
        }
        let stepped = (clamped / self.step).round() * self.step;
        stepped.max(self.min).min(self.max).normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pip_sizes() {
        assert_eq!(pip_size("EURUSD"), dec!(0.0001));
        assert_eq!(pip_size("usdjpy"), dec!(0.01));
        assert_eq!(pip_size("XAUUSD"), dec!(0.1));
        assert_eq!(pip_size("US500"), dec!(0.1));
        assert_eq!(pip_size("BTCUSD"), dec!(1.0));
    }

    #[test]
    fn test_base_targets() {
        assert_eq!(base_target_pips("BTCUSD"), Some(dec!(50)));
        assert_eq!(base_target_pips("GBPCAD"), Some(dec!(18)));
        assert_eq!(base_target_pips("EURGBP"), None);
    }

    #[test]
    fn test_volume_normalization() {
        let rules = VolumeRules::for_symbol("EURUSD");
        assert_eq!(rules.normalize(dec!(0.004)), dec!(0.01));
        assert_eq!(rules.normalize(dec!(0.126)), dec!(0.13));
        assert_eq!(rules.normalize(dec!(50)), dec!(10));

        let btc = VolumeRules::for_symbol("BTCUSD");
        assert_eq!(btc.normalize(dec!(2.56)), dec!(1));
    }
}
