//! Error types for nibble-engine

use thiserror::Error;

/// Main error type for nibble-engine
///
/// Numeric primitives never fail; everything fallible lives in model load,
/// quantization, session open, and the decode orchestrator. Errors surface
/// synchronously through the token-stream pull.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Header magic mismatch, truncated tensor, unknown dtype tag, or tensor
    /// dims inconsistent with the architecture
    #[error("malformed model: {0}")]
    MalformedModel(String),

    /// Unsupported quantization triple, ctx_size over the model maximum,
    /// non-positive thread count, out-of-range sampling parameter
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Unable to mmap the model file or allocate the KV cache
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// NaN/Inf detected in logits while the debug guard is enabled
    #[error("numeric fault: {0}")]
    NumericFault(String),

    /// Session released by the caller mid-step
    #[error("session cancelled")]
    Cancelled,

    /// Violated invariant, e.g. block K does not divide the reduction dim
    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
