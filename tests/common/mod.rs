//! Common test utilities and fixtures

#![allow(dead_code)]

use chrono::{Duration, Utc};
use martingale_engine::{
    AppConfig, BatchLabel, BrokerPosition, Direction, EntrySignal, PriceBook, Quote,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;

pub const ACCOUNT: &str = "42903786";
pub const TAG: &str = "50515253";

/// Config writing state and the emergency file into `dir`
pub fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.account.account_id = ACCOUNT.to_string();
    config.account.strategy_tag = TAG.to_string();
    config.persistence.state_file = dir.path().join("data").join("bot_state.json");
    config.risk.emergency_file = dir.path().join("data").join("emergency.json");
    config.propagation.backoff_ms = 0;
    config.martingale.cooldown_seconds = 0;
    config
}

pub fn book(entries: &[(&str, Decimal)]) -> PriceBook {
    entries
        .iter()
        .map(|(symbol, price)| (symbol.to_string(), Quote::flat(*price)))
        .collect()
}

pub fn eurusd_long() -> EntrySignal {
    EntrySignal {
        symbol: "EURUSD".to_string(),
        direction: Direction::Long,
        volume: dec!(0.01),
        layer_spacing: dec!(0.0050),
    }
}

/// Broker position carrying a batch label; symbol and side come from it
pub fn labeled_position(id: &str, label: &str, volume: Decimal, entry_price: Decimal) -> BrokerPosition {
    let decoded = BatchLabel::decode(label).expect("fixture label must be valid");
    BrokerPosition {
        id: id.to_string(),
        symbol: decoded.symbol,
        side: decoded.direction.side(),
        volume,
        entry_price,
        target_price: None,
        stop_price: None,
        label: label.to_string(),
        opened_at: Utc::now() - Duration::hours(6),
    }
}
