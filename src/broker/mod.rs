//! Broker implementations

pub mod paper;

pub use paper::PaperBroker;
