//! Shared configuration, error types, IDs, and observability primitives for PTQ crates.
//!
//! Architecture role:
//! - defines engine configuration passed from the client facade down to advice
//! - provides common [`PtqError`] / [`Result`] contracts
//! - hosts the prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::EngineConfig;
pub use error::{PtqError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
