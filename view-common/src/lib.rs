//! View Common - Shared types, logging, and configuration for Session View services.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Error types and handling utilities
//! - Logging setup and structured logging helpers

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, DatabaseConfig, ObservabilityConfig, ServerConfig, SessionConfig};
pub use error::{Error, Result, ResultExt};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{Config, SessionConfig};
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::init_logging;
}
