//! Shared types exchanged with the broker and the trading loop

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Direction of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Broker order side that opens a position in this direction
    pub fn side(&self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// Single-letter code used in order labels
    pub fn code(&self) -> char {
        match self {
            Direction::Long => 'B',
            Direction::Short => 'S',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'B' => Some(Direction::Long),
            'S' => Some(Direction::Short),
            _ => None,
        }
    }

    /// True when `price` is at or beyond `level` in the adverse direction
    pub fn reached(&self, price: Decimal, level: Decimal) -> bool {
        match self {
            Direction::Long => price <= level,
            Direction::Short => price >= level,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Direction::Long),
            "short" | "sell" => Ok(Direction::Short),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn direction(&self) -> Direction {
        match self {
            Side::Buy => Direction::Long,
            Side::Sell => Direction::Short,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// An open position as reported by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    /// Broker-assigned position id
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub entry_price: Decimal,
    /// Take-profit currently set on the broker side (None = unset)
    #[serde(default)]
    pub target_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    /// Order comment carrying the batch label
    #[serde(default)]
    pub label: String,
    pub opened_at: DateTime<Utc>,
}

/// Request to open one position
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub target_price: Option<Decimal>,
    pub label: String,
    /// Strategy tag every order of this system carries
    pub tag: String,
}

/// Broker confirmation of a filled order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub id: String,
    pub fill_price: Decimal,
    pub fill_volume: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// Bid/ask for one instrument
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Quote {
    pub fn new(bid: Decimal, ask: Decimal) -> Self {
        Self { bid, ask }
    }

    /// Same price on both sides
    pub fn flat(price: Decimal) -> Self {
        Self { bid: price, ask: price }
    }

    /// Price relevant to a batch in `direction`: longs are evaluated on
    /// the bid, shorts on the ask.
    pub fn for_direction(&self, direction: Direction) -> Decimal {
        match direction {
            Direction::Long => self.bid,
            Direction::Short => self.ask,
        }
    }

    /// Price a new order in `direction` would fill at
    pub fn entry_for(&self, direction: Direction) -> Decimal {
        match direction {
            Direction::Long => self.ask,
            Direction::Short => self.bid,
        }
    }
}

/// Current quotes keyed by symbol, supplied by the trading loop each cycle
pub type PriceBook = HashMap<String, Quote>;
