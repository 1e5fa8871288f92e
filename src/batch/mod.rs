//! Batch lifecycle: model, pricing and the registry
//!
//! # Components
//!
//! - [`Batch`] / [`Layer`]: a group of same-direction positions exited together
//! - [`BatchRegistry`]: owned set of active batches, one per symbol and direction
//! - [`TriggerEvaluator`]: decides when a batch receives its next layer
//! - [`TargetCalculator`]: adaptive shared exit target
//! - [`TargetPropagator`]: pushes a batch's target to every broker position
//! - [`BatchLabel`]: order label linking broker positions back to batches

pub mod instruments;
pub mod label;
pub mod model;
pub mod propagation;
pub mod registry;
pub mod sizing;
pub mod target;
pub mod trigger;

pub use instruments::{pip_size, VolumeRules};
pub use label::BatchLabel;
pub use model::{Batch, BatchId, BatchKey, Layer};
pub use propagation::{PropagationReport, TargetPropagator};
pub use registry::{BatchRegistry, LayerAdded, RegistryCounters, SyncReport};
pub use sizing::LayerSizer;
pub use target::TargetCalculator;
pub use trigger::{LayerTrigger, TriggerDecision, TriggerEvaluator};
