//! Order label codec
//!
//! The label is the only link between a broker position and the batch it
//! belongs to, so this module is the single place that formats or parses
//! it. Format: `BM{batch_id:02}_{SYMBOL}_{B|S}{layer:02}`, e.g.
//! `BM07_EURUSD_B03` is layer 3 of long batch 7 on EURUSD.

use std::fmt;
use std::str::FromStr;

use crate::common::errors::EngineError;
use crate::common::types::Direction;

const PREFIX: &str = "BM";

/// Decoded batch/layer identity of a broker order
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchLabel {
    pub batch_id: u64,
    pub symbol: String,
    pub direction: Direction,
    pub layer_index: u32,
}

impl BatchLabel {
    pub fn new(batch_id: u64, symbol: impl Into<String>, direction: Direction, layer_index: u32) -> Self {
        Self {
            batch_id,
            symbol: symbol.into(),
            direction,
            layer_index,
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn decode(label: &str) -> Result<Self, EngineError> {
        label.parse()
    }
}

impl fmt::Display for BatchLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:02}_{}_{}{:02}",
            PREFIX,
            self.batch_id,
            self.symbol,
            self.direction.code(),
            self.layer_index
        )
    }
}

impl FromStr for BatchLabel {
    type Err = EngineError;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::InvalidLabel(label.to_string());

        let rest = label.strip_prefix(PREFIX).ok_or_else(invalid)?;
        let (id_part, rest) = rest.split_once('_').ok_or_else(invalid)?;
        let (symbol, tail) = rest.rsplit_once('_').ok_or_else(invalid)?;

        if id_part.is_empty() || !id_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let batch_id: u64 = id_part.parse().map_err(|_| invalid())?;

        if symbol.is_empty() {
            return Err(invalid());
        }

        let mut chars = tail.chars();
        let direction = chars
            .next()
            .and_then(Direction::from_code)
            .ok_or_else(invalid)?;
        let layer_part = chars.as_str();
        if layer_part.is_empty() || !layer_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let layer_index: u32 = layer_part.parse().map_err(|_| invalid())?;
        if layer_index == 0 {
            return Err(invalid());
        }

        Ok(Self {
            batch_id,
            symbol: symbol.to_string(),
            direction,
            layer_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_format() {
        let label = BatchLabel::new(1, "BTCUSD", Direction::Long, 1);
        assert_eq!(label.encode(), "BM01_BTCUSD_B01");

        let label = BatchLabel::new(123, "EURUSD", Direction::Short, 12);
        assert_eq!(label.encode(), "BM123_EURUSD_S12");
    }

    #[test]
    fn test_decode_known_labels() {
        let label = BatchLabel::decode("BM01_BTCUSD_S02").unwrap();
        assert_eq!(label, BatchLabel::new(1, "BTCUSD", Direction::Short, 2));

        let label = BatchLabel::decode("BM7_XAUUSD_B3").unwrap();
        assert_eq!(label, BatchLabel::new(7, "XAUUSD", Direction::Long, 3));
    }

    #[test]
    fn test_symbol_with_underscore() {
        let original = BatchLabel::new(4, "US500_CASH", Direction::Long, 5);
        let decoded = BatchLabel::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_rejects_foreign_labels() {
        for bad in [
            "",
            "manual trade",
            "BM_EURUSD_B01",
            "BMxx_EURUSD_B01",
            "BM01_EURUSD",
            "BM01__B01",
            "BM01_EURUSD_X01",
            "BM01_EURUSD_B",
            "BM01_EURUSD_B00",
            "BM01_EURUSD_B0x",
            "XX01_EURUSD_B01",
        ] {
            assert!(
                matches!(BatchLabel::decode(bad), Err(EngineError::InvalidLabel(_))),
                "expected {:?} to be rejected",
                bad
            );
        }
    }
}
