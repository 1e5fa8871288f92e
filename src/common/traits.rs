//! Trait definitions for the engine's external collaborators

use async_trait::async_trait;

use super::errors::Result;
use super::types::{BrokerPosition, Direction, OrderFill, OrderRequest};

/// Trait for broker execution clients
///
/// The broker has no notion of a batch. Everything the engine knows about
/// broker-side identity goes through the order label and the strategy tag.
/// Each call is expected to be bounded by a timeout enforced by the
/// implementation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// List open positions carrying the given strategy tag
    async fn get_positions(&self, tag: &str) -> Result<Vec<BrokerPosition>>;

    /// Place a market order
    ///
    /// Fails with `OrderRejected` on invalid volume/stops or insufficient
    /// margin, and `BrokerUnavailable` when the broker cannot be reached.
    async fn place_order(&self, request: OrderRequest) -> Result<OrderFill>;

    /// Change the take-profit of an open position
    async fn update_target(&self, position_id: &str, target_price: rust_decimal::Decimal)
        -> Result<()>;

    /// Get the name of the broker
    fn broker_name(&self) -> &'static str;
}

/// Allow/block verdict from the decision layer
#[derive(Debug, Clone, PartialEq)]
pub struct TradeVerdict {
    pub allowed: bool,
    pub reason: String,
    /// 0-100
    pub confidence: u8,
}

impl TradeVerdict {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            confidence: 100,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            confidence: 0,
        }
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = confidence.min(100);
        self
    }
}

/// Static capability interface for the intelligence layer
///
/// Consulted before creating a batch and for shallow layers. Must not
/// block: implementations answer from cached data.
#[cfg_attr(test, mockall::automock)]
pub trait Decider: Send + Sync {
    fn can_trade(&self, symbol: &str, direction: Direction) -> TradeVerdict;
}

/// Decider that never blocks anything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Decider for AllowAll {
    fn can_trade(&self, _symbol: &str, _direction: Direction) -> TradeVerdict {
        TradeVerdict::allow("no decision layer configured")
    }
}
