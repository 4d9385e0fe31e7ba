//! Memory subsystem error types.

use std::fmt;

/// Errors that can occur in the memory subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Failed to initialize the device connection.
    InitializationFailed(String),
    /// Failed to create a native resource.
    ResourceCreationFailed(String),
    /// Out of host or device memory.
    OutOfMemory,
    /// The device was lost.
    DeviceLost,
    /// An invalid parameter was provided.
    InvalidParameter(String),
    /// No device memory type satisfies the request.
    NoSuitableMemoryType(String),
    /// The operation is not supported by this memory type.
    Unsupported(String),
    /// An internal error occurred.
    Internal(String),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
            Self::ResourceCreationFailed(msg) => write!(f, "resource creation failed: {msg}"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::DeviceLost => write!(f, "device lost"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::NoSuitableMemoryType(msg) => write!(f, "no suitable memory type: {msg}"),
            Self::Unsupported(msg) => write!(f, "unsupported operation: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for MemoryError {}
