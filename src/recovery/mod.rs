//! Startup recovery against the broker's live positions

pub mod reconciler;

pub use reconciler::{MissedLayer, RecoveryReconciler, RecoveryReport};
