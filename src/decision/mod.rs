//! Non-blocking access to the external decision layer

pub mod cache;

pub use cache::{CachedDecider, CachedVerdict, VerdictPublisher};

/// Whether a layer is deep enough to skip the decision layer
///
/// Layer 1 (batch creation) is always checked. From `bypass_layer` on,
/// additions go ahead regardless of external signals.
pub fn bypasses_decider(layer_number: u32, bypass_layer: u32) -> bool {
    layer_number > 1 && layer_number >= bypass_layer
}
