use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use super::instruments::pip_size;
use super::model::{Batch, BatchId};
use crate::common::errors::{EngineError, Result};
use crate::common::traits::Broker;
use crate::common::types::BrokerPosition;
use crate::config::types::PropagationConfig;

/// Outcome of pushing one batch target to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct PropagationReport {
    pub batch_id: BatchId,
    pub target_price: Decimal,
    /// Layers whose broker target was changed
    pub updated: usize,
    /// Layers already at the target within one pip
    pub skipped: usize,
    /// Broker position ids that could not be updated
    pub failed: Vec<String>,
    /// Layers with a broker position id
    pub total: usize,
}

impl PropagationReport {
    fn new(batch_id: BatchId, target_price: Decimal, total: usize) -> Self {
        Self {
            batch_id,
            target_price,
            updated: 0,
            skipped: 0,
            failed: Vec::new(),
            total,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.updated + self.skipped
    }

    pub fn success_ratio(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.succeeded() as f64 / self.total as f64
    }
}

/// Pushes a batch's shared target to every layer on the broker
///
/// Each layer update is idempotent: a layer whose broker target already
/// matches is skipped. Failed layers are retried for a bounded number of
/// rounds; whatever still fails is left for the next cycle's sync to pick
/// up as target drift.
#[derive(Debug, Clone)]
pub struct TargetPropagator {
    max_rounds: u32,
    per_layer_attempts: u32,
    backoff: Duration,
    min_success_ratio: f64,
}

impl TargetPropagator {
    pub fn new(max_rounds: u32, per_layer_attempts: u32, backoff: Duration, min_success_ratio: f64) -> Self {
        Self {
            max_rounds: max_rounds.max(1),
            per_layer_attempts: per_layer_attempts.max(1),
            backoff,
            min_success_ratio: min_success_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &PropagationConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.per_layer_attempts,
            Duration::from_millis(config.backoff_ms),
            config.min_success_ratio,
        )
    }

    /// Update every layer of `batch` to its stored target
    ///
    /// `live` is the most recent broker position list; layers whose live
    /// target is within one pip of the stored one are not touched. Returns
    /// `TargetPropagationPartial` when fewer than the configured share of
    /// layers end up on the target.
    #[instrument(skip(self, broker, batch, live), fields(batch_id = batch.batch_id, symbol = %batch.symbol))]
    pub async fn propagate(
        &self,
        broker: &dyn Broker,
        batch: &Batch,
        live: &[BrokerPosition],
    ) -> Result<PropagationReport> {
        let Some(target) = batch.target_price() else {
            debug!("Batch {} has no target yet", batch.batch_id);
            return Ok(PropagationReport::new(batch.batch_id, Decimal::ZERO, 0));
        };

        let tolerance = pip_size(&batch.symbol);
        let live_targets: HashMap<&str, Option<Decimal>> =
            live.iter().map(|p| (p.id.as_str(), p.target_price)).collect();

        let position_ids: Vec<&str> = batch
            .layers
            .iter()
            .filter_map(|l| l.broker_position_id.as_deref())
            .collect();
        let mut report = PropagationReport::new(batch.batch_id, target, position_ids.len());

        let mut pending = Vec::new();
        for id in position_ids {
            match live_targets.get(id).copied().flatten() {
                Some(current) if (current - target).abs() < tolerance => report.skipped += 1,
                _ => pending.push(id),
            }
        }

        for round in 1..=self.max_rounds {
            if pending.is_empty() {
                break;
            }
            if round > 1 {
                sleep(self.backoff).await;
            }

            let mut still_failing = Vec::new();
            for id in pending {
                if self.update_layer(broker, id, target).await {
                    report.updated += 1;
                } else {
                    still_failing.push(id);
                }
            }
            pending = still_failing;

            if report.success_ratio() >= self.min_success_ratio && !pending.is_empty() {
                debug!(
                    "Round {}: {}/{} layers on target, accepting",
                    round,
                    report.succeeded(),
                    report.total
                );
                break;
            }
        }

        report.failed = pending.into_iter().map(str::to_string).collect();

        if report.success_ratio() < self.min_success_ratio {
            warn!(
                "Target {} reached only {}/{} layers of batch {}: failed {:?}",
                target,
                report.succeeded(),
                report.total,
                batch.batch_id,
                report.failed
            );
            return Err(EngineError::TargetPropagationPartial {
                updated: report.succeeded(),
                total: report.total,
            });
        }

        if report.failed.is_empty() {
            info!(
                "Target {} applied to batch {} ({} updated, {} already set)",
                target, batch.batch_id, report.updated, report.skipped
            );
        } else {
            warn!(
                "Target {} applied to {}/{} layers of batch {}, retrying {:?} next cycle",
                target,
                report.succeeded(),
                report.total,
                batch.batch_id,
                report.failed
            );
        }
        Ok(report)
    }

    async fn update_layer(&self, broker: &dyn Broker, position_id: &str, target: Decimal) -> bool {
        for attempt in 1..=self.per_layer_attempts {
            match broker.update_target(position_id, target).await {
                Ok(()) => return true,
                Err(e) => {
                    debug!(
                        "Target update for {} failed (attempt {}/{}): {}",
                        position_id, attempt, self.per_layer_attempts, e
                    );
                    if attempt < self.per_layer_attempts {
                        sleep(self.backoff).await;
                    }
                }
            }
        }
        false
    }
}

impl Default for TargetPropagator {
    fn default() -> Self {
        Self::from_config(&PropagationConfig::default())
    }
}
