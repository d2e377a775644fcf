//! Shared utilities for AIOVPN components.
//!
//! This crate provides the pieces used by both the session engine and the
//! command line front end: configuration loading and logging setup.

pub mod config;
pub mod logging;

// Re-export commonly used types for convenience
pub use config::{Config, ConfigError, ConfigManager, ServerEntry, TransportKind};
