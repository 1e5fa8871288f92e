use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::debug;

use crate::batch::model::BatchKey;
use crate::common::traits::{Decider, TradeVerdict};
use crate::common::types::Direction;

/// Verdict published by a background collector
#[derive(Debug, Clone)]
pub struct CachedVerdict {
    pub verdict: TradeVerdict,
    /// When the collector produced it
    pub computed_at: DateTime<Utc>,
}

type VerdictTable = HashMap<BatchKey, CachedVerdict>;

/// Write side of the verdict cache, held by background collectors
#[derive(Debug, Clone)]
pub struct VerdictPublisher {
    shared: Arc<RwLock<VerdictTable>>,
}

impl VerdictPublisher {
    pub async fn publish(&self, symbol: &str, direction: Direction, verdict: TradeVerdict) {
        self.publish_at(symbol, direction, verdict, Utc::now()).await;
    }

    pub async fn publish_at(
        &self,
        symbol: &str,
        direction: Direction,
        verdict: TradeVerdict,
        computed_at: DateTime<Utc>,
    ) {
        let mut table = self.shared.write().await;
        table.insert(
            BatchKey::new(symbol, direction),
            CachedVerdict {
                verdict,
                computed_at,
            },
        );
    }

    pub async fn clear(&self) {
        self.shared.write().await.clear();
    }
}

/// Decider answering from verdicts pre-computed by background collectors
///
/// The trading loop never waits on a collector: reads use `try_read` and,
/// when a writer holds the lock, fall back to the last verdict seen for the
/// key. Verdicts older than the stale threshold are ignored and the trade is
/// allowed.
#[derive(Debug)]
pub struct CachedDecider {
    shared: Arc<RwLock<VerdictTable>>,
    last_known_good: Mutex<VerdictTable>,
    stale_after: Duration,
}

impl CachedDecider {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            shared: Arc::new(RwLock::new(HashMap::new())),
            last_known_good: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    pub fn publisher(&self) -> VerdictPublisher {
        VerdictPublisher {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    fn lookup(&self, key: &BatchKey) -> Option<CachedVerdict> {
        let mut cache = self
            .last_known_good
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match self.shared.try_read() {
            Ok(table) => {
                let current = table.get(key).cloned();
                match &current {
                    Some(entry) => {
                        cache.insert(key.clone(), entry.clone());
                    }
                    None => {
                        cache.remove(key);
                    }
                }
                current
            }
            Err(_) => {
                debug!("Verdict table busy, using last known verdict for {}", key);
                cache.get(key).cloned()
            }
        }
    }

    /// Verdict for a key at a given time
    pub fn verdict_at(&self, symbol: &str, direction: Direction, now: DateTime<Utc>) -> TradeVerdict {
        let key = BatchKey::new(symbol, direction);
        match self.lookup(&key) {
            None => TradeVerdict::allow("no data"),
            Some(entry) if now - entry.computed_at > self.stale_after => {
                debug!(
                    "Verdict for {} is stale ({}s old)",
                    key,
                    (now - entry.computed_at).num_seconds()
                );
                TradeVerdict::allow("stale").with_confidence(entry.verdict.confidence)
            }
            Some(entry) => entry.verdict,
        }
    }
}

impl Decider for CachedDecider {
    fn can_trade(&self, symbol: &str, direction: Direction) -> TradeVerdict {
        self.verdict_at(symbol, direction, Utc::now())
    }
}
