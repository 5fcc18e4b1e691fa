//! Bootstrap helpers shared by the `relayhub` binary
//!
//! Only configuration discovery lives here; hub construction belongs to
//! `relayhub-cluster`.

pub mod config;

pub use config::load_config;
