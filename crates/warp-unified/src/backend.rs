//! Accelerator Backend Abstraction
//!
//! The coherence engine never talks to a device directly. Everything that
//! physically moves bytes or launches work goes through [`AcceleratorBackend`],
//! which is injected into the engine at construction time. A CPU
//! implementation lives in [`crate::backends::cpu`]; other backends plug in
//! by implementing the same trait.
//!
//! # Contract
//!
//! - `allocate` is called lazily, at most once per capacity epoch
//! - `copy_*` calls happen only inside engine synchronization and growth
//! - transfers are complete once the call returns; `synchronize` drains any
//!   queued work before the engine publishes a new state
//! - `execute`/`execute_read`/`execute_transform` are never called by the
//!   engine itself; they are the algorithm layer's entry point, paired with
//!   `wait`
//!
//! # Example
//!
//! ```
//! use warp_unified::backend::{AcceleratorBackend, BackendType};
//! use warp_unified::backends::cpu::CpuBackend;
//!
//! let backend = CpuBackend::new();
//! assert_eq!(backend.backend_type(), BackendType::Cpu);
//!
//! let mut buffer = backend.allocate(16).unwrap();
//! backend.copy_host_to_device(&mut buffer, 0, &[7u8; 16]).unwrap();
//!
//! let mut host = [0u8; 16];
//! backend.copy_device_to_host(&buffer, &mut host).unwrap();
//! assert_eq!(host, [7u8; 16]);
//! ```

use crate::Result;

/// Backend type identifier
///
/// Accelerator backends outside this crate add their own variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendType {
    /// CPU fallback (no accelerator)
    Cpu,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Cpu => write!(f, "CPU"),
        }
    }
}

/// Device capabilities returned by backends
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device name (e.g., "NVIDIA RTX 4090", "host")
    pub name: String,
    /// Backend type
    pub backend: BackendType,
    /// Total device memory in bytes
    pub total_memory: usize,
    /// Largest single allocation in bytes
    pub max_allocation: usize,
    /// Number of compute units
    pub compute_units: u32,
}

/// Device buffer handle (opaque, backend-specific)
pub trait DeviceBuffer: Send + Sync {
    /// Get buffer size in bytes
    fn size(&self) -> usize;
}

/// Work that mutates a device buffer in place
///
/// Kernels see the raw bytes of the whole buffer; typed views are the
/// kernel's business.
pub trait Kernel: Send + Sync {
    /// Kernel name for logging
    fn name(&self) -> &str;

    /// Run over the buffer contents
    fn run(&self, memory: &mut [u8]) -> Result<()>;
}

/// Work that only reads a device buffer
pub trait ReadKernel: Send + Sync {
    /// Kernel name for logging
    fn name(&self) -> &str;

    /// Run over the buffer contents
    fn run(&self, memory: &[u8]) -> Result<()>;
}

/// Work that reads one device buffer and writes another
///
/// Used by algorithms whose input and output live in different containers.
pub trait TransformKernel: Send + Sync {
    /// Kernel name for logging
    fn name(&self) -> &str;

    /// Run over the source contents, writing the destination contents
    fn run(&self, src: &[u8], dst: &mut [u8]) -> Result<()>;
}

/// Abstract accelerator backend
///
/// Implementations must report failures instead of hanging: the engine has
/// no timeouts and relies on the backend to fail fast.
pub trait AcceleratorBackend: Send + Sync {
    /// Buffer type for this backend
    type Buffer: DeviceBuffer;
    /// Completion signal returned by kernel submission
    type Completion: Send;

    // =========================================================================
    // Device Information
    // =========================================================================

    /// Get device name
    fn device_name(&self) -> &str;

    /// Get backend type
    fn backend_type(&self) -> BackendType;

    /// Get detailed device information
    fn device_info(&self) -> &DeviceInfo;

    /// Get free device memory in bytes
    fn free_memory(&self) -> Result<usize>;

    /// Check if device has sufficient memory
    fn has_sufficient_memory(&self, required_bytes: usize) -> bool {
        match self.free_memory() {
            Ok(free) => free >= required_bytes,
            Err(_) => false,
        }
    }

    // =========================================================================
    // Memory Operations
    // =========================================================================

    /// Allocate a zero-initialized device buffer of `bytes` bytes
    fn allocate(&self, bytes: usize) -> Result<Self::Buffer>;

    /// Copy `data` into the device buffer starting at byte `offset`
    fn copy_host_to_device(
        &self,
        buffer: &mut Self::Buffer,
        offset: usize,
        data: &[u8],
    ) -> Result<()>;

    /// Copy the first `out.len()` bytes of the device buffer into `out`
    fn copy_device_to_host(&self, buffer: &Self::Buffer, out: &mut [u8]) -> Result<()>;

    /// Copy the first `bytes` bytes of `src` into `dst`
    fn copy_device_to_device(
        &self,
        src: &Self::Buffer,
        dst: &mut Self::Buffer,
        bytes: usize,
    ) -> Result<()>;

    // =========================================================================
    // Kernel Operations
    // =========================================================================

    /// Submit a kernel that may write the buffer
    fn execute(&self, buffer: &mut Self::Buffer, kernel: &dyn Kernel) -> Result<Self::Completion>;

    /// Submit a kernel that only reads the buffer
    fn execute_read(
        &self,
        buffer: &Self::Buffer,
        kernel: &dyn ReadKernel,
    ) -> Result<Self::Completion>;

    /// Submit a kernel that reads `src` and writes `dst`
    fn execute_transform(
        &self,
        src: &Self::Buffer,
        dst: &mut Self::Buffer,
        kernel: &dyn TransformKernel,
    ) -> Result<Self::Completion>;

    /// Block until the submitted work finishes, surfacing its failure
    fn wait(&self, completion: Self::Completion) -> Result<()>;

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Synchronize device (wait for all operations to complete)
    fn synchronize(&self) -> Result<()>;
}
