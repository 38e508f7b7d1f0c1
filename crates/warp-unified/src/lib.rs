//! Host/accelerator coherent dynamic array for warp
//!
//! This crate provides a growable array whose contents may live on the host,
//! on an accelerator, or both:
//! - **Lazy coherence**: transfers happen only when the other side needs data
//! - **Dirty-range tracking**: host writes are merged into minimal ranges and
//!   only those ranges are pushed to the device
//! - **Element proxies**: ordinary-looking reads and writes drive the state
//!   machine, so no write bypasses tracking
//! - **Backend abstraction**: allocation, transfers and kernels go through
//!   [`AcceleratorBackend`]; a CPU backend ships with the crate
//!
//! # State machine
//!
//! ```text
//! Clean --(host write)--> HostDirty --(sync_to_device)--> Clean
//! Clean --(device write)--> DeviceDirty --(sync_to_host)--> Clean
//! ```
//!
//! Host writes while the device is authoritative pull the device copy back
//! first, so the two dirty states never overlap.
//!
//! # Example
//!
//! ```
//! use warp_unified::{UnifiedVec, algorithms};
//!
//! # fn main() -> warp_unified::Result<()> {
//! let mut vec = UnifiedVec::<u32>::from_slice(&[5, 2, 8, 1, 9])?;
//!
//! // Runs on the accelerator copy; the host copy is refreshed on demand.
//! algorithms::for_each(&mut vec, |v| *v *= 2)?;
//! assert_eq!(vec.get(2)?, 16);
//!
//! let total = algorithms::reduce(&vec, 0, |a, b| a + b)?;
//! assert_eq!(total, 50);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod algorithms;
pub mod backend;
pub mod backends;
pub mod config;
pub mod cursor;
pub mod dirty;
pub mod element;
pub mod engine;
pub mod error;
pub mod state;
pub mod vector;

pub use backend::{
    AcceleratorBackend, BackendType, DeviceBuffer, DeviceInfo, Kernel, ReadKernel, TransformKernel,
};
pub use backends::cpu::{CpuBackend, CpuBuffer, TransferStats};
pub use config::UnifiedConfig;
pub use cursor::{Cursor, Elements, ReadCursor, Values};
pub use dirty::{DirtyRange, DirtyRangeSet};
pub use element::ElementRef;
pub use engine::CoherenceEngine;
pub use error::{Error, Result};
pub use state::MemoryState;
pub use vector::UnifiedVec;
