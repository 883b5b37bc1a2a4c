//! Guest-surface error types.

use prism_gpu::GpuError;
use thiserror::Error;

/// Errors surfaced to the guest-call dispatch bridge.
#[derive(Error, Debug)]
pub enum HleError {
    /// A guest argument was rejected at the call that received it.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The guest operation is recognized but not supported by this shim.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Host API failure; unrecoverable for the operation that triggered it.
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, HleError>;
