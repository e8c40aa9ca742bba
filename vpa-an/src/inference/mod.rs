//! Inference backend integration
//!
//! The pose backends are opaque RPC services, one WebSocket endpoint per
//! model. This module owns the model registry, the typed failure
//! taxonomy, and the client adapter that streams sampled frames.

pub mod client;
pub mod registry;

pub use client::{InferenceBackend, InferenceOptions, WsInferenceClient};
pub use registry::{BackendAddr, ModelRegistry};

use crate::models::{MediaKind, View};
use thiserror::Error;

/// One adapter call: run inference for one view of one session
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub model_name: String,
    pub view: View,
    pub bucket: String,
    pub object_key: String,
    pub media_kind: MediaKind,
}

/// Typed adapter failures
///
/// Retryability drives the coordinator's backoff policy: `Connect`,
/// `Timeout` and `Protocol` are retried up to the bound; `Config` fails
/// the session immediately; `Cancelled` is a cooperative stop, not an
/// error for reporting purposes.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    /// Unknown or misconfigured model (fatal, no retry)
    #[error("model not configured: {0}")]
    Config(String),

    /// Connection, handshake, or mid-stream transport failure (retryable)
    #[error("backend connection failed: {0}")]
    Connect(String),

    /// Per-call deadline exceeded (retryable)
    #[error("inference deadline exceeded after {0} ms")]
    Timeout(u64),

    /// Malformed or error response frame (retryable up to the bound)
    #[error("backend protocol error: {0}")]
    Protocol(String),

    /// Cooperative stop requested via the cancellation token
    #[error("inference cancelled")]
    Cancelled,
}

impl InferenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InferenceError::Connect(_) | InferenceError::Timeout(_) | InferenceError::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(InferenceError::Connect("refused".into()).is_retryable());
        assert!(InferenceError::Timeout(30_000).is_retryable());
        assert!(InferenceError::Protocol("bad frame".into()).is_retryable());
        assert!(!InferenceError::Config("nope".into()).is_retryable());
        assert!(!InferenceError::Cancelled.is_retryable());
    }
}
