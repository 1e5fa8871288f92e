//! In-memory broker for dry runs and tests

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

use crate::batch::instruments::VolumeRules;
use crate::common::errors::{EngineError, Result};
use crate::common::traits::Broker;
use crate::common::types::{BrokerPosition, OrderFill, OrderRequest, Quote, Side};

#[derive(Debug, Default)]
struct PaperState {
    /// position id -> (strategy tag, position)
    positions: BTreeMap<String, (String, BrokerPosition)>,
    quotes: HashMap<String, Quote>,
    next_id: u64,
    unavailable: bool,
    rejected_symbols: HashMap<String, String>,
    failing_updates: HashSet<String>,
    orders_placed: usize,
    target_updates: usize,
}

/// Broker that fills every order at the current quote
///
/// Positions whose target is reached on a quote update are closed. Failure
/// modes can be switched on to exercise the engine's degraded paths.
#[derive(Debug, Default)]
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========================================================================
    // Market simulation
    // ========================================================================

    /// Set the quote for a symbol and close positions whose target it reaches
    pub fn set_quote(&self, symbol: &str, quote: Quote) -> Vec<BrokerPosition> {
        let mut state = self.state();
        state.quotes.insert(symbol.to_string(), quote);

        let hit: Vec<String> = state
            .positions
            .iter()
            .filter(|(_, (_, p))| p.symbol == symbol)
            .filter(|(_, (_, p))| match (p.side, p.target_price) {
                (Side::Buy, Some(target)) => quote.bid >= target,
                (Side::Sell, Some(target)) => quote.ask <= target,
                _ => false,
            })
            .map(|(id, _)| id.clone())
            .collect();

        hit.into_iter()
            .filter_map(|id| state.positions.remove(&id))
            .map(|(_, position)| {
                info!(
                    "Paper target hit: {} {} {} closed at {:?}",
                    position.id, position.symbol, position.side, position.target_price
                );
                position
            })
            .collect()
    }

    pub fn quote(&self, symbol: &str) -> Option<Quote> {
        self.state().quotes.get(symbol).copied()
    }

    /// Insert a position directly, as if opened in an earlier session
    pub fn insert_position(&self, tag: &str, position: BrokerPosition) {
        self.state()
            .positions
            .insert(position.id.clone(), (tag.to_string(), position));
    }

    pub fn close_position(&self, position_id: &str) -> Option<BrokerPosition> {
        self.state().positions.remove(position_id).map(|(_, p)| p)
    }

    pub fn position(&self, position_id: &str) -> Option<BrokerPosition> {
        self.state().positions.get(position_id).map(|(_, p)| p.clone())
    }

    pub fn open_positions(&self) -> Vec<BrokerPosition> {
        self.state().positions.values().map(|(_, p)| p.clone()).collect()
    }

    // ========================================================================
    // Failure injection
    // ========================================================================

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn reject_symbol(&self, symbol: &str, reason: &str) {
        self.state()
            .rejected_symbols
            .insert(symbol.to_string(), reason.to_string());
    }

    pub fn accept_symbol(&self, symbol: &str) {
        self.state().rejected_symbols.remove(symbol);
    }

    pub fn fail_updates_for(&self, position_id: &str) {
        self.state().failing_updates.insert(position_id.to_string());
    }

    pub fn orders_placed(&self) -> usize {
        self.state().orders_placed
    }

    pub fn target_updates(&self) -> usize {
        self.state().target_updates
    }
}

#[async_trait]
impl Broker for PaperBroker {
    #[instrument(skip(self))]
    async fn get_positions(&self, tag: &str) -> Result<Vec<BrokerPosition>> {
        let state = self.state();
        if state.unavailable {
            return Err(EngineError::BrokerUnavailable("paper broker offline".to_string()));
        }
        Ok(state
            .positions
            .values()
            .filter(|(t, _)| t == tag)
            .map(|(_, p)| p.clone())
            .collect())
    }

    #[instrument(skip(self), fields(symbol = %request.symbol, label = %request.label))]
    async fn place_order(&self, request: OrderRequest) -> Result<OrderFill> {
        let mut state = self.state();
        if state.unavailable {
            return Err(EngineError::BrokerUnavailable("paper broker offline".to_string()));
        }
        if let Some(reason) = state.rejected_symbols.get(&request.symbol) {
            return Err(EngineError::OrderRejected {
                symbol: request.symbol.clone(),
                reason: reason.clone(),
            });
        }

        let rules = VolumeRules::for_symbol(&request.symbol);
        if request.volume <= Decimal::ZERO || request.volume < rules.min || request.volume > rules.max {
            return Err(EngineError::OrderRejected {
                symbol: request.symbol.clone(),
                reason: format!(
                    "invalid volume {} (allowed {}..{})",
                    request.volume, rules.min, rules.max
                ),
            });
        }

        let Some(quote) = state.quotes.get(&request.symbol).copied() else {
            return Err(EngineError::OrderRejected {
                symbol: request.symbol.clone(),
                reason: "no price".to_string(),
            });
        };

        state.next_id += 1;
        state.orders_placed += 1;
        let id = format!("paper-{}", state.next_id);
        let fill_price = quote.entry_for(request.side.direction());
        let filled_at = Utc::now();

        let position = BrokerPosition {
            id: id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            volume: request.volume,
            entry_price: fill_price,
            target_price: request.target_price,
            stop_price: None,
            label: request.label.clone(),
            opened_at: filled_at,
        };
        state.positions.insert(id.clone(), (request.tag.clone(), position));

        debug!(
            "Paper fill {}: {} {} {} @ {}",
            id, request.side, request.volume, request.symbol, fill_price
        );

        Ok(OrderFill {
            id,
            fill_price,
            fill_volume: request.volume,
            filled_at,
        })
    }

    #[instrument(skip(self))]
    async fn update_target(&self, position_id: &str, target_price: Decimal) -> Result<()> {
        let mut state = self.state();
        if state.unavailable || state.failing_updates.contains(position_id) {
            return Err(EngineError::BrokerUnavailable(format!(
                "cannot modify {}",
                position_id
            )));
        }
        let Some((_, position)) = state.positions.get_mut(position_id) else {
            return Err(EngineError::OrderRejected {
                symbol: String::new(),
                reason: format!("position {} not found", position_id),
            });
        };
        position.target_price = Some(target_price);
        state.target_updates += 1;
        Ok(())
    }

    fn broker_name(&self) -> &'static str {
        "paper"
    }
}
