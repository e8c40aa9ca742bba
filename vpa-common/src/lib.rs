//! Shared foundation for VPA microservices
//!
//! Provides the common error taxonomy, configuration loading, the analysis
//! event bus, and SSE streaming helpers used by vpa-an.

pub mod config;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
