//! Bridge error types.

use thiserror::Error;

use super::registry::Handle;

/// Errors raised on the Rust side of the bridge.
///
/// None of these ever reach the engine: the trampoline resolves every failure
/// to a native status code.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Unsupported upsert argument kind: {type_name}")]
    UnsupportedArgument { type_name: &'static str },

    #[error("Upsert handle {0} already has a boxed argument")]
    AlreadyBoxed(Handle),

    #[error("Record index {index} out of range for batch of {count}")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("Native {0} array is null")]
    NullArray(&'static str),

    #[error("Buffer of {0} bytes does not fit a native size field")]
    SizeOverflow(usize),

    #[error("Result record {index} is {got} bytes but the shared size is {expected}")]
    SharedSizeMismatch { index: usize, expected: u32, got: u32 },

    #[error("Unknown size layout: {0}")]
    UnknownLayout(String),

    #[error("Failed to allocate {0} bytes for a result buffer")]
    Allocation(usize),
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
