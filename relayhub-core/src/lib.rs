pub mod config;
pub mod logging;
pub mod bootstrap;
pub mod resilience;

pub use config::Config;
