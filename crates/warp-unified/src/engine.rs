//! Coherence engine
//!
//! The engine owns the host buffer, a lazily allocated accelerator buffer,
//! the [`MemoryState`] and the [`DirtyRangeSet`], and decides when a real
//! transfer is required.
//!
//! # Locking
//!
//! The state is published through a single atomic (acquire loads, release
//! stores) so `state()` never blocks. Everything else sits behind a
//! `parking_lot::RwLock`:
//!
//! - element reads take the shared lock and do not block each other
//! - marking, synchronizing and growing take the exclusive lock
//! - the state only changes while the exclusive lock is held, so the state
//!   and the dirty set are always observed together
//!
//! Lazy allocation of the accelerator buffer from a shared context goes
//! read → upgradable read → re-check → write → downgrade, so two threads can
//! never allocate two buffers for the same epoch.
//!
//! # Failure atomicity
//!
//! A failed transfer or allocation leaves the state and the dirty set exactly
//! as they were, so the same call can be retried. The engine never publishes
//! `Clean` after a failed copy.

use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard,
    RwLockUpgradableReadGuard, RwLockWriteGuard,
};
use tracing::{debug, trace, warn};

use crate::backend::AcceleratorBackend;
use crate::backends::cpu::CpuBackend;
use crate::config::UnifiedConfig;
use crate::dirty::{DirtyRange, DirtyRangeSet};
use crate::state::{AtomicState, MemoryState};
use crate::{Error, Result};

/// Byte length of `count` elements of `T`
fn byte_len<T>(count: usize) -> Result<usize> {
    count
        .checked_mul(std::mem::size_of::<T>())
        .ok_or_else(|| Error::device_out_of_memory(usize::MAX, 0))
}

/// Everything guarded by the engine lock
struct EngineInner<T, D> {
    /// Host copy, `len() == capacity`
    host: Vec<T>,
    /// Host writes not yet on the device
    dirty: DirtyRangeSet,
    /// Accelerator copy, sized to the current capacity
    device: Option<D>,
    /// Device buffer generations allocated so far
    epoch: u64,
}

impl<T: Pod, D> EngineInner<T, D> {
    fn capacity(&self) -> usize {
        self.host.len()
    }

    fn check_range(&self, lo: usize, hi: usize) -> Result<()> {
        if lo > hi || hi > self.capacity() {
            return Err(Error::invalid_range(lo, hi, self.capacity()));
        }
        Ok(())
    }

    fn mark(&mut self, state: &AtomicState, lo: usize, hi: usize) -> Result<()> {
        self.check_range(lo, hi)?;
        if lo == hi {
            return Ok(());
        }

        match state.load() {
            MemoryState::DeviceDirty => {
                return Err(Error::invalid_state("mark host dirty", MemoryState::DeviceDirty));
            }
            MemoryState::Clean => {
                self.dirty.insert(DirtyRange::new(lo, hi)?);
                state.store(MemoryState::HostDirty);
                debug!(lo, hi, "clean -> host-dirty");
            }
            MemoryState::HostDirty => {
                self.dirty.insert(DirtyRange::new(lo, hi)?);
            }
        }
        Ok(())
    }

    fn ensure_device<B>(&mut self, backend: &B) -> Result<()>
    where
        B: AcceleratorBackend<Buffer = D>,
    {
        if self.device.is_some() {
            return Ok(());
        }

        let bytes = byte_len::<T>(self.capacity())?;
        let buffer = backend.allocate(bytes)?;
        self.device = Some(buffer);
        self.epoch += 1;
        debug!(bytes, epoch = self.epoch, "allocated accelerator buffer");
        Ok(())
    }

    fn flush_to_device<B>(&mut self, backend: &B, state: &AtomicState) -> Result<()>
    where
        B: AcceleratorBackend<Buffer = D>,
    {
        if state.load() != MemoryState::HostDirty {
            return Ok(());
        }

        self.ensure_device(backend)?;
        let Self {
            host, dirty, device, ..
        } = self;
        let device = device
            .as_mut()
            .ok_or_else(|| Error::invalid_state("sync to device", MemoryState::HostDirty))?;

        let elem = std::mem::size_of::<T>();
        for range in dirty.iter() {
            trace!(start = range.start(), end = range.end(), "host -> device");
            let bytes: &[u8] = bytemuck::cast_slice(&host[range.as_range()]);
            backend.copy_host_to_device(device, range.start() * elem, bytes)?;
        }
        backend.synchronize()?;

        debug!(ranges = dirty.len(), elements = dirty.covered(), "host-dirty -> clean");
        dirty.clear();
        state.store(MemoryState::Clean);
        Ok(())
    }

    fn flush_to_host<B>(&mut self, backend: &B, state: &AtomicState) -> Result<()>
    where
        B: AcceleratorBackend<Buffer = D>,
    {
        if state.load() != MemoryState::DeviceDirty {
            return Ok(());
        }

        let device = self
            .device
            .as_ref()
            .ok_or_else(|| Error::invalid_state("sync to host", MemoryState::DeviceDirty))?;

        // The device side tracks no ranges, so the whole buffer comes back.
        backend.copy_device_to_host(device, bytemuck::cast_slice_mut(&mut self.host))?;
        backend.synchronize()?;

        debug!(elements = self.host.len(), "device-dirty -> clean");
        state.store(MemoryState::Clean);
        Ok(())
    }
}

/// Keeps a host buffer and an accelerator buffer coherent
///
/// `T` must be plain old data so buffers can move between host and device as
/// raw bytes. The backend is shared, so many engines may use one device.
pub struct CoherenceEngine<T: Pod, B: AcceleratorBackend = CpuBackend> {
    state: AtomicState,
    inner: RwLock<EngineInner<T, B::Buffer>>,
    backend: Arc<B>,
    flush_on_drop: bool,
}

impl<T, B> CoherenceEngine<T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    /// Create an engine with `capacity` zeroed host slots and default config
    pub fn new(backend: Arc<B>, capacity: usize) -> Result<Self> {
        Self::with_config(backend, capacity, &UnifiedConfig::default())
    }

    /// Create an engine with `capacity` zeroed host slots
    ///
    /// The accelerator buffer is not allocated until first needed.
    pub fn with_config(backend: Arc<B>, capacity: usize, config: &UnifiedConfig) -> Result<Self> {
        if std::mem::size_of::<T>() == 0 {
            return Err(Error::Unsupported(format!(
                "zero-sized element type {} cannot be transferred",
                std::any::type_name::<T>()
            )));
        }

        let mut host = Vec::new();
        host.try_reserve_exact(capacity)
            .map_err(|_| Error::host_out_of_memory::<T>(capacity))?;
        host.resize(capacity, T::zeroed());

        Ok(Self {
            state: AtomicState::new(MemoryState::Clean),
            inner: RwLock::new(EngineInner {
                host,
                dirty: DirtyRangeSet::new(),
                device: None,
                epoch: 0,
            }),
            backend,
            flush_on_drop: config.flush_on_drop,
        })
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Current memory state (single atomic load, never blocks)
    #[inline]
    pub fn state(&self) -> MemoryState {
        self.state.load()
    }

    /// True when both copies agree
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.state() == MemoryState::Clean
    }

    /// True when the host holds unpushed writes
    #[inline]
    pub fn is_host_dirty(&self) -> bool {
        self.state() == MemoryState::HostDirty
    }

    /// True when the device holds unpulled writes
    #[inline]
    pub fn is_device_dirty(&self) -> bool {
        self.state() == MemoryState::DeviceDirty
    }

    /// Number of element slots in both buffers
    pub fn capacity(&self) -> usize {
        self.inner.read().capacity()
    }

    /// Snapshot of the dirty ranges, ascending
    pub fn dirty_ranges(&self) -> Vec<DirtyRange> {
        self.inner.read().dirty.as_slice().to_vec()
    }

    /// True once an accelerator buffer exists for the current epoch
    pub fn is_allocated(&self) -> bool {
        self.inner.read().device.is_some()
    }

    /// Number of accelerator buffers allocated over the engine's lifetime
    pub fn epoch(&self) -> u64 {
        self.inner.read().epoch
    }

    /// Backend this engine transfers through
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Record that host indices `[lo, hi)` were written
    ///
    /// Requires `lo <= hi <= capacity`; an empty range is a no-op.
    /// `Clean` becomes `HostDirty`. Rejected while `DeviceDirty`: the host
    /// copy is stale and must be synchronized before it is written.
    pub fn mark_host_dirty(&self, lo: usize, hi: usize) -> Result<()> {
        let mut inner = self.inner.write();
        inner.mark(&self.state, lo, hi)
    }

    /// Declare the whole accelerator buffer authoritative
    ///
    /// Called by the algorithm layer after a kernel wrote the buffer.
    /// Rejected while `HostDirty` (unpushed host writes would be lost) and
    /// when no accelerator buffer exists.
    pub fn mark_device_dirty(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let state = self.state.load();
        if state == MemoryState::HostDirty {
            return Err(Error::invalid_state("mark device dirty", state));
        }
        if inner.device.is_none() {
            return Err(Error::invalid_state(
                "mark device dirty without an accelerator buffer",
                state,
            ));
        }

        inner.dirty.clear();
        self.state.store(MemoryState::DeviceDirty);
        if state != MemoryState::DeviceDirty {
            debug!("{} -> device-dirty", state);
        }
        Ok(())
    }

    /// Push host writes to the accelerator
    ///
    /// No-op unless `HostDirty`. Allocates the accelerator buffer if needed,
    /// copies each dirty range and blocks until the copies complete.
    pub fn sync_to_device(&self) -> Result<()> {
        if self.state() != MemoryState::HostDirty {
            return Ok(());
        }
        let mut inner = self.inner.write();
        inner.flush_to_device(&*self.backend, &self.state)
    }

    /// Pull device writes back to the host
    ///
    /// No-op unless `DeviceDirty`. Copies the entire accelerator buffer: the
    /// backend does not report which regions a kernel touched.
    pub fn sync_to_host(&self) -> Result<()> {
        if self.state() != MemoryState::DeviceDirty {
            return Ok(());
        }
        let mut inner = self.inner.write();
        inner.flush_to_host(&*self.backend, &self.state)
    }

    /// Forget pending host writes without pushing them
    ///
    /// `HostDirty` becomes `Clean`; the accelerator copy is untouched. Only
    /// sound when no live element depends on those writes, as after `clear`.
    pub(crate) fn discard_host_changes(&self) {
        let mut inner = self.inner.write();
        inner.dirty.clear();
        if self.state.load() == MemoryState::HostDirty {
            self.state.store(MemoryState::Clean);
            debug!("host-dirty -> clean (discarded)");
        }
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Grow both buffers to `new_capacity` slots
    ///
    /// No-op when not larger. An existing accelerator buffer is replaced by
    /// a new one holding a copy of the old contents, so device-authoritative
    /// data survives and a `Clean` state stays truthful. On failure nothing
    /// changes.
    pub fn resize(&self, new_capacity: usize) -> Result<()> {
        let mut inner = self.inner.write();
        let old_capacity = inner.capacity();
        if new_capacity <= old_capacity {
            return Ok(());
        }

        let replacement = match inner.device.as_ref() {
            Some(old) => {
                let mut fresh = self.backend.allocate(byte_len::<T>(new_capacity)?)?;
                self.backend
                    .copy_device_to_device(old, &mut fresh, byte_len::<T>(old_capacity)?)?;
                self.backend.synchronize()?;
                Some(fresh)
            }
            None => None,
        };

        inner
            .host
            .try_reserve_exact(new_capacity - old_capacity)
            .map_err(|_| Error::host_out_of_memory::<T>(new_capacity))?;
        inner.host.resize(new_capacity, T::zeroed());

        if let Some(fresh) = replacement {
            inner.device = Some(fresh);
            inner.epoch += 1;
        }

        debug!(
            old_capacity,
            new_capacity,
            epoch = inner.epoch,
            state = %self.state.load(),
            "grew engine capacity"
        );
        Ok(())
    }

    /// Shrink both buffers to `new_capacity` slots
    ///
    /// No-op when not smaller. Device-authoritative data is pulled back
    /// first. The accelerator buffer is released; if one existed, the kept
    /// prefix is marked host-dirty so the next `sync_to_device` rebuilds it.
    pub(crate) fn shrink_to(&self, new_capacity: usize) -> Result<()> {
        let mut inner = self.inner.write();
        if new_capacity >= inner.capacity() {
            return Ok(());
        }

        inner.flush_to_host(&*self.backend, &self.state)?;

        inner.host.truncate(new_capacity);
        inner.host.shrink_to_fit();

        if inner.device.take().is_some() && new_capacity > 0 {
            inner.dirty.clear();
            inner.dirty.insert(DirtyRange::new(0, new_capacity)?);
            self.state.store(MemoryState::HostDirty);
        } else {
            inner.dirty.truncate(new_capacity);
            if inner.dirty.is_empty() {
                self.state.store(MemoryState::Clean);
            }
        }

        debug!(new_capacity, state = %self.state.load(), "shrank engine capacity");
        Ok(())
    }

    // =========================================================================
    // Host access
    // =========================================================================

    /// Raw host buffer, without synchronizing
    ///
    /// Callers must run [`sync_to_host`](Self::sync_to_host) first if they
    /// need device writes to be visible.
    pub fn host_data(&self) -> MappedRwLockReadGuard<'_, [T]> {
        RwLockReadGuard::map(self.inner.read(), |inner| inner.host.as_slice())
    }

    /// Raw mutable host buffer, without synchronizing or marking
    ///
    /// Callers must mark what they write with
    /// [`mark_host_dirty`](Self::mark_host_dirty) afterwards.
    pub fn host_data_mut(&self) -> MappedRwLockWriteGuard<'_, [T]> {
        RwLockWriteGuard::map(self.inner.write(), |inner| inner.host.as_mut_slice())
    }

    /// Host buffer with every device write visible
    pub fn host_view(&self) -> Result<MappedRwLockReadGuard<'_, [T]>> {
        loop {
            self.sync_to_host()?;
            let guard = self.inner.read();
            // A kernel may have published device writes between the sync and
            // the read lock.
            if self.state.load() != MemoryState::DeviceDirty {
                return Ok(RwLockReadGuard::map(guard, |inner| inner.host.as_slice()));
            }
        }
    }

    /// Read one host element after synchronizing
    pub fn read(&self, index: usize) -> Result<T> {
        let view = self.host_view()?;
        view.get(index)
            .copied()
            .ok_or_else(|| Error::out_of_bounds(index, view.len()))
    }

    /// Write host indices `[lo, hi)` and mark them dirty in one critical section
    ///
    /// A device-authoritative copy is pulled back first so the write lands on
    /// current data.
    pub fn write_host<R>(&self, lo: usize, hi: usize, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        let mut inner = self.inner.write();
        inner.check_range(lo, hi)?;
        inner.flush_to_host(&*self.backend, &self.state)?;

        let result = f(&mut inner.host[lo..hi]);
        inner.mark(&self.state, lo, hi)?;
        Ok(result)
    }

    /// Take the host buffer, pulling device writes back first
    pub(crate) fn take_host(&self) -> Result<Vec<T>> {
        let mut inner = self.inner.write();
        inner.flush_to_host(&*self.backend, &self.state)?;
        inner.dirty.clear();
        inner.device = None;
        self.state.store(MemoryState::Clean);
        Ok(std::mem::take(&mut inner.host))
    }

    // =========================================================================
    // Accelerator access
    // =========================================================================

    /// Shared handle to the accelerator buffer, allocating it on first use
    ///
    /// Does not synchronize: call [`sync_to_device`](Self::sync_to_device)
    /// first when the kernel needs current host data.
    pub fn accelerator_handle(&self) -> Result<MappedRwLockReadGuard<'_, B::Buffer>> {
        let guard = self.inner.read();
        if guard.device.is_some() {
            return Self::map_device(guard);
        }
        drop(guard);

        let upgradable = self.inner.upgradable_read();
        let guard = if upgradable.device.is_some() {
            // Another thread allocated while we waited.
            RwLockUpgradableReadGuard::downgrade(upgradable)
        } else {
            let mut exclusive = RwLockUpgradableReadGuard::upgrade(upgradable);
            exclusive.ensure_device(&*self.backend)?;
            RwLockWriteGuard::downgrade(exclusive)
        };
        Self::map_device(guard)
    }

    /// Exclusive handle to the accelerator buffer, allocating it on first use
    ///
    /// Kernels that write the buffer run through this handle; afterwards the
    /// caller must drop it and call [`mark_device_dirty`](Self::mark_device_dirty).
    pub fn accelerator_handle_mut(&self) -> Result<MappedRwLockWriteGuard<'_, B::Buffer>> {
        let mut guard = self.inner.write();
        guard.ensure_device(&*self.backend)?;
        let state = self.state.load();
        RwLockWriteGuard::try_map(guard, |inner| inner.device.as_mut())
            .map_err(|_| Error::invalid_state("access accelerator buffer", state))
    }

    fn map_device(
        guard: RwLockReadGuard<'_, EngineInner<T, B::Buffer>>,
    ) -> Result<MappedRwLockReadGuard<'_, B::Buffer>> {
        RwLockReadGuard::try_map(guard, |inner| inner.device.as_ref())
            .map_err(|_| Error::invalid_state("access accelerator buffer", MemoryState::Clean))
    }
}

impl<T: Pod, B: AcceleratorBackend> Drop for CoherenceEngine<T, B> {
    fn drop(&mut self) {
        if !self.flush_on_drop || self.state.load() != MemoryState::DeviceDirty {
            return;
        }

        let inner = self.inner.get_mut();
        match inner.flush_to_host(&*self.backend, &self.state) {
            Ok(()) => debug!(elements = inner.host.len(), "flushed device-dirty data on drop"),
            Err(err) => warn!(error = %err, "failed to flush device-dirty data on drop"),
        }
    }
}

impl<T: Pod, B: AcceleratorBackend> std::fmt::Debug for CoherenceEngine<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("CoherenceEngine")
            .field("state", &self.state.load())
            .field("capacity", &inner.host.len())
            .field("dirty_ranges", &inner.dirty.len())
            .field("allocated", &inner.device.is_some())
            .field("epoch", &inner.epoch)
            .finish()
    }
}
