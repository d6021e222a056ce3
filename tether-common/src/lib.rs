// Common utilities for the Tether bus-binding stack

pub mod logging;

pub use logging::{Component, Logger};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
