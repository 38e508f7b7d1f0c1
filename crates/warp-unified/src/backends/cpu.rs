//! CPU Backend
//!
//! Host-memory implementation of [`AcceleratorBackend`]. "Device" buffers are
//! separate 16-byte aligned host allocations, so every transfer is a real
//! copy and the coherence protocol behaves exactly as it would against an
//! accelerator. Kernels run synchronously on the calling thread.
//!
//! Used as the default backend and as the fallback when no accelerator is
//! present.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::trace;

use crate::backend::{
    AcceleratorBackend, BackendType, DeviceBuffer, DeviceInfo, Kernel, ReadKernel, TransformKernel,
};
use crate::{Error, Result};

/// Alignment unit of CPU device buffers
type Word = u128;

const WORD_BYTES: usize = std::mem::size_of::<Word>();

/// Device buffer backed by host memory
pub struct CpuBuffer {
    words: Vec<Word>,
    len: usize,
    ledger: Arc<AtomicUsize>,
}

impl CpuBuffer {
    /// Buffer contents
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<Word, u8>(&self.words)[..self.len]
    }

    /// Mutable buffer contents
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<Word, u8>(&mut self.words)[..self.len]
    }
}

impl DeviceBuffer for CpuBuffer {
    fn size(&self) -> usize {
        self.len
    }
}

impl Drop for CpuBuffer {
    fn drop(&mut self) {
        self.ledger.fetch_sub(self.len, Ordering::Relaxed);
        trace!("Dropping CPU device buffer: {} bytes", self.len);
    }
}

impl std::fmt::Debug for CpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBuffer").field("len", &self.len).finish()
    }
}

/// Completion ticket for CPU kernels
///
/// The kernel has already run; the ticket carries its outcome to `wait`.
#[must_use = "completions must be passed to `wait`"]
#[derive(Debug)]
pub struct CpuCompletion {
    ticket: u64,
    outcome: Result<()>,
}

/// Snapshot of CPU backend activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Buffers allocated
    pub allocations: u64,
    /// Host-to-device copy calls
    pub host_to_device: u64,
    /// Bytes copied host-to-device
    pub host_to_device_bytes: u64,
    /// Device-to-host copy calls
    pub device_to_host: u64,
    /// Bytes copied device-to-host
    pub device_to_host_bytes: u64,
    /// Device-to-device copy calls
    pub device_to_device: u64,
    /// Kernels submitted
    pub kernels: u64,
}

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicU64,
    host_to_device: AtomicU64,
    host_to_device_bytes: AtomicU64,
    device_to_host: AtomicU64,
    device_to_host_bytes: AtomicU64,
    device_to_device: AtomicU64,
    kernels: AtomicU64,
}

/// CPU implementation of the accelerator backend
#[derive(Debug)]
pub struct CpuBackend {
    info: DeviceInfo,
    memory_limit: Option<usize>,
    allocated: Arc<AtomicUsize>,
    counters: Counters,
    next_ticket: AtomicU64,
}

impl CpuBackend {
    /// Create a new CPU backend without a memory limit
    #[must_use]
    pub fn new() -> Self {
        Self {
            info: DeviceInfo {
                name: "host".to_string(),
                backend: BackendType::Cpu,
                total_memory: usize::MAX,
                max_allocation: isize::MAX as usize,
                compute_units: rayon::current_num_threads() as u32,
            },
            memory_limit: None,
            allocated: Arc::new(AtomicUsize::new(0)),
            counters: Counters::default(),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Cap total device allocations at `bytes`
    ///
    /// Allocations past the cap fail with [`Error::DeviceOutOfMemory`].
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self.info.total_memory = bytes;
        self.info.max_allocation = bytes;
        self
    }

    /// Bytes currently held by live device buffers
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Snapshot of transfer and kernel counters
    pub fn stats(&self) -> TransferStats {
        let c = &self.counters;
        TransferStats {
            allocations: c.allocations.load(Ordering::Relaxed),
            host_to_device: c.host_to_device.load(Ordering::Relaxed),
            host_to_device_bytes: c.host_to_device_bytes.load(Ordering::Relaxed),
            device_to_host: c.device_to_host.load(Ordering::Relaxed),
            device_to_host_bytes: c.device_to_host_bytes.load(Ordering::Relaxed),
            device_to_device: c.device_to_device.load(Ordering::Relaxed),
            kernels: c.kernels.load(Ordering::Relaxed),
        }
    }

    fn reserve(&self, bytes: usize) -> Result<()> {
        let Some(limit) = self.memory_limit else {
            self.allocated.fetch_add(bytes, Ordering::Relaxed);
            return Ok(());
        };

        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|current| Error::device_out_of_memory(bytes, limit.saturating_sub(current)))
    }

    fn complete(&self, outcome: Result<()>) -> CpuCompletion {
        self.counters.kernels.fetch_add(1, Ordering::Relaxed);
        CpuCompletion {
            ticket: self.next_ticket.fetch_add(1, Ordering::Relaxed),
            outcome,
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn check_span(offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::Transfer(format!(
            "copy of {len} bytes at offset {offset} exceeds buffer of {size} bytes"
        ))),
    }
}

impl AcceleratorBackend for CpuBackend {
    type Buffer = CpuBuffer;
    type Completion = CpuCompletion;

    fn device_name(&self) -> &str {
        &self.info.name
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Cpu
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn free_memory(&self) -> Result<usize> {
        Ok(match self.memory_limit {
            Some(limit) => limit.saturating_sub(self.allocated_bytes()),
            None => usize::MAX,
        })
    }

    fn allocate(&self, bytes: usize) -> Result<CpuBuffer> {
        self.reserve(bytes)?;

        let word_count = bytes.div_ceil(WORD_BYTES);
        let mut words = Vec::new();
        if words.try_reserve_exact(word_count).is_err() {
            self.allocated.fetch_sub(bytes, Ordering::Relaxed);
            return Err(Error::device_out_of_memory(bytes, self.free_memory()?));
        }
        words.resize(word_count, 0);

        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        trace!("Allocated CPU device buffer: {} bytes", bytes);

        Ok(CpuBuffer {
            words,
            len: bytes,
            ledger: Arc::clone(&self.allocated),
        })
    }

    fn copy_host_to_device(
        &self,
        buffer: &mut CpuBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        check_span(offset, data.len(), buffer.len)?;
        buffer.as_bytes_mut()[offset..offset + data.len()].copy_from_slice(data);

        self.counters.host_to_device.fetch_add(1, Ordering::Relaxed);
        self.counters
            .host_to_device_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn copy_device_to_host(&self, buffer: &CpuBuffer, out: &mut [u8]) -> Result<()> {
        check_span(0, out.len(), buffer.len)?;
        out.copy_from_slice(&buffer.as_bytes()[..out.len()]);

        self.counters.device_to_host.fetch_add(1, Ordering::Relaxed);
        self.counters
            .device_to_host_bytes
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn copy_device_to_device(
        &self,
        src: &CpuBuffer,
        dst: &mut CpuBuffer,
        bytes: usize,
    ) -> Result<()> {
        check_span(0, bytes, src.len)?;
        check_span(0, bytes, dst.len)?;
        dst.as_bytes_mut()[..bytes].copy_from_slice(&src.as_bytes()[..bytes]);

        self.counters.device_to_device.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn execute(&self, buffer: &mut CpuBuffer, kernel: &dyn Kernel) -> Result<CpuCompletion> {
        trace!("Running kernel '{}' over {} bytes", kernel.name(), buffer.len);
        let outcome = kernel.run(buffer.as_bytes_mut());
        Ok(self.complete(outcome))
    }

    fn execute_read(&self, buffer: &CpuBuffer, kernel: &dyn ReadKernel) -> Result<CpuCompletion> {
        trace!("Running read kernel '{}' over {} bytes", kernel.name(), buffer.len);
        let outcome = kernel.run(buffer.as_bytes());
        Ok(self.complete(outcome))
    }

    fn execute_transform(
        &self,
        src: &CpuBuffer,
        dst: &mut CpuBuffer,
        kernel: &dyn TransformKernel,
    ) -> Result<CpuCompletion> {
        trace!(
            "Running transform kernel '{}' from {} into {} bytes",
            kernel.name(),
            src.len,
            dst.len
        );
        let outcome = kernel.run(src.as_bytes(), dst.as_bytes_mut());
        Ok(self.complete(outcome))
    }

    fn wait(&self, completion: CpuCompletion) -> Result<()> {
        trace!("Waiting on CPU completion #{}", completion.ticket);
        completion.outcome
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}
