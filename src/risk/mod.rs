//! Emergency stop sources

pub mod emergency;

pub use emergency::{EmergencyMonitor, EmergencyNotice};
