//! Error types for unified container operations

use crate::state::MemoryState;

/// Result type for unified container operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified container errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Element index outside the live length
    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds {
        /// Requested index
        index: usize,
        /// Length the index was checked against
        len: usize,
    },

    /// Malformed or out-of-capacity index range
    #[error("Invalid range [{start}, {end}) for capacity {capacity}")]
    InvalidRange {
        /// Range start (inclusive)
        start: usize,
        /// Range end (exclusive)
        end: usize,
        /// Capacity the range was checked against
        capacity: usize,
    },

    /// Host allocation failed
    #[error("Host allocation failed: {bytes} bytes requested")]
    HostOutOfMemory {
        /// Requested size
        bytes: usize,
    },

    /// Accelerator allocation failed
    #[error("Device allocation failed: {bytes} bytes requested, {available} bytes available")]
    DeviceOutOfMemory {
        /// Requested size
        bytes: usize,
        /// Available device memory
        available: usize,
    },

    /// Accelerator disappeared mid-operation
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// Host/device copy failed
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Operation not supported by the backend or element type
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Operation not permitted in the current memory state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// State at the time of the attempt
        state: MemoryState,
    },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kernel execution failed
    #[error("Kernel execution failed: {0}")]
    Execution(String),
}

impl Error {
    /// Create an index-out-of-bounds error
    #[inline]
    pub fn out_of_bounds(index: usize, len: usize) -> Self {
        Self::IndexOutOfBounds { index, len }
    }

    /// Create an invalid-range error
    #[inline]
    pub fn invalid_range(start: usize, end: usize, capacity: usize) -> Self {
        Self::InvalidRange {
            start,
            end,
            capacity,
        }
    }

    /// Create an invalid-state error
    #[inline]
    pub fn invalid_state(operation: &'static str, state: MemoryState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Create a host allocation error for `count` elements of `T`
    #[inline]
    pub fn host_out_of_memory<T>(count: usize) -> Self {
        Self::HostOutOfMemory {
            bytes: count.saturating_mul(std::mem::size_of::<T>()),
        }
    }

    /// Create a device allocation error
    #[inline]
    pub fn device_out_of_memory(bytes: usize, available: usize) -> Self {
        Self::DeviceOutOfMemory { bytes, available }
    }

    /// Check if retrying the same operation may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::HostOutOfMemory { .. }
                | Self::DeviceOutOfMemory { .. }
                | Self::Transfer(_)
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}
