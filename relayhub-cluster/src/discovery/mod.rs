//! Session directory and broker health monitoring

pub mod directory;
pub mod health_monitor;

pub use directory::SessionDirectory;
pub use health_monitor::{FailureCounter, HealthMonitor};
