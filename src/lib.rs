//! MartingaleEngine Library
//!
//! Batch lifecycle manager for a layered averaging strategy: groups of
//! same-direction positions that share one adaptive exit target, persisted
//! across restarts and reconciled against the broker's live positions.

pub mod batch;
pub mod broker;
pub mod common;
pub mod config;
pub mod decision;
pub mod engine;
pub mod persistence;
pub mod recovery;
pub mod risk;

// Re-export commonly used types
pub use common::errors::{EngineError, Result};
pub use common::traits::{AllowAll, Broker, Decider, TradeVerdict};
pub use common::types::{BrokerPosition, Direction, OrderFill, OrderRequest, PriceBook, Quote, Side};
pub use config::types::AppConfig;

// Batch lifecycle
pub use batch::{
    Batch, BatchId, BatchKey, BatchLabel, BatchRegistry, Layer, LayerAdded, LayerSizer, LayerTrigger,
    PropagationReport, SyncReport, TargetCalculator, TargetPropagator, TriggerDecision, TriggerEvaluator,
};
pub use broker::PaperBroker;
pub use decision::{CachedDecider, VerdictPublisher};
pub use engine::{BatchEngine, CycleReport, EntrySignal};
pub use persistence::{Snapshot, SnapshotSource, SnapshotStore};
pub use recovery::{MissedLayer, RecoveryReconciler, RecoveryReport};
pub use risk::EmergencyMonitor;
