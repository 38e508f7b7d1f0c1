//! Unified container
//!
//! [`UnifiedVec`] is a growable array whose contents may live on the host, on
//! an accelerator, or both. It owns exactly one [`CoherenceEngine`] and keeps
//! it informed: every mutation writes the host copy and marks the touched
//! region before returning, so an algorithm layer only has to call
//! [`prefetch_to_device`](UnifiedVec::prefetch_to_device) before launching
//! work.
//!
//! Element access goes through [`ElementRef`] proxies rather than references.
//! Proxies and cursors borrow the container, so structural changes (which
//! take `&mut self`) cannot happen while any of them is alive.
//!
//! # Example
//!
//! ```
//! use warp_unified::{MemoryState, UnifiedVec};
//!
//! # fn main() -> warp_unified::Result<()> {
//! let mut vec = UnifiedVec::<u32>::from_slice(&[5, 2, 8])?;
//! vec.prefetch_to_device()?;
//! assert_eq!(vec.engine().state(), MemoryState::Clean);
//!
//! vec.at(0)?.set(100)?;
//! vec.push_back(42)?;
//! assert_eq!(vec.engine().state(), MemoryState::HostDirty);
//! assert_eq!(vec.to_vec()?, vec![100, 2, 8, 42]);
//! # Ok(())
//! # }
//! ```

use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::MappedRwLockReadGuard;
use tracing::{trace, warn};

use crate::backend::AcceleratorBackend;
use crate::backends::cpu::CpuBackend;
use crate::config::UnifiedConfig;
use crate::cursor::{Cursor, Elements, ReadCursor, Values};
use crate::element::ElementRef;
use crate::engine::CoherenceEngine;
use crate::{Error, Result};

/// Growable array kept coherent between host and accelerator
pub struct UnifiedVec<T: Pod, B: AcceleratorBackend = CpuBackend> {
    engine: CoherenceEngine<T, B>,
    len: usize,
    config: UnifiedConfig,
}

impl<T, B> UnifiedVec<T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend + Default,
{
    /// Create an empty container on a fresh default backend
    pub fn new() -> Result<Self> {
        Self::with_backend(Arc::new(B::default()))
    }

    /// Create a container of `len` zeroed elements
    pub fn with_len(len: usize) -> Result<Self> {
        Self::from_elem(T::zeroed(), len)
    }

    /// Create a container of `len` copies of `value`
    pub fn from_elem(value: T, len: usize) -> Result<Self> {
        let mut vec = Self::new()?;
        vec.assign_fill(len, value)?;
        Ok(vec)
    }

    /// Create a container holding a copy of `items`
    pub fn from_slice(items: &[T]) -> Result<Self> {
        let mut vec = Self::new()?;
        vec.extend_from_slice(items)?;
        Ok(vec)
    }

    /// Collect an iterator into a new container
    pub fn try_from_iter(iter: impl IntoIterator<Item = T>) -> Result<Self> {
        let mut vec = Self::new()?;
        vec.try_extend(iter)?;
        Ok(vec)
    }
}

impl<T, B> UnifiedVec<T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    /// Create an empty container on `backend`
    pub fn with_backend(backend: Arc<B>) -> Result<Self> {
        Self::with_config(backend, UnifiedConfig::default())
    }

    /// Create an empty container on `backend` with explicit tuning
    pub fn with_config(backend: Arc<B>, config: UnifiedConfig) -> Result<Self> {
        config.validate()?;
        let engine = CoherenceEngine::with_config(backend, 0, &config)?;
        Ok(Self {
            engine,
            len: 0,
            config,
        })
    }

    // =========================================================================
    // Size and capacity
    // =========================================================================

    /// Number of live elements
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when there are no live elements
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots allocated on both sides
    pub fn capacity(&self) -> usize {
        self.engine.capacity()
    }

    /// Largest element count the host allocator could address
    pub fn max_size(&self) -> usize {
        isize::MAX as usize / std::mem::size_of::<T>()
    }

    /// Ensure room for at least `additional` more elements
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let required = self
            .len
            .checked_add(additional)
            .ok_or_else(|| Error::host_out_of_memory::<T>(usize::MAX))?;
        if required > self.capacity() {
            self.engine.resize(required)?;
        }
        Ok(())
    }

    /// Release slots past the live length on both sides
    pub fn shrink_to_fit(&mut self) -> Result<()> {
        self.engine.shrink_to(self.len)
    }

    /// Tuning this container was built with
    pub fn config(&self) -> &UnifiedConfig {
        &self.config
    }

    /// Engine, for algorithm layers that drive the accelerator directly
    ///
    /// Storage can only shrink through the container, which knows the live
    /// length:
    ///
    /// ```compile_fail
    /// let vec = warp_unified::UnifiedVec::<u32>::from_slice(&[1, 2, 3, 4]).unwrap();
    /// vec.engine().shrink_to(1).unwrap();
    /// ```
    ///
    /// ```compile_fail
    /// let vec = warp_unified::UnifiedVec::<u32>::from_slice(&[1, 2, 3, 4]).unwrap();
    /// vec.engine().discard_host_changes();
    /// ```
    pub fn engine(&self) -> &CoherenceEngine<T, B> {
        &self.engine
    }

    // =========================================================================
    // Element access
    // =========================================================================

    /// Proxy for `index`, checked against the live length
    pub fn at(&self, index: usize) -> Result<ElementRef<'_, T, B>> {
        if index >= self.len {
            return Err(Error::out_of_bounds(index, self.len));
        }
        Ok(ElementRef::new(self, index))
    }

    /// Proxy for `index` without a length check
    ///
    /// Reads and writes still fail past the capacity; between the length and
    /// the capacity they touch dead slots.
    pub fn element(&self, index: usize) -> ElementRef<'_, T, B> {
        ElementRef::new(self, index)
    }

    /// Proxy for the first element
    pub fn front(&self) -> Result<ElementRef<'_, T, B>> {
        self.at(0)
    }

    /// Proxy for the last element
    pub fn back(&self) -> Result<ElementRef<'_, T, B>> {
        match self.len.checked_sub(1) {
            Some(last) => self.at(last),
            None => Err(Error::out_of_bounds(0, 0)),
        }
    }

    /// Read the value at `index`
    pub fn get(&self, index: usize) -> Result<T> {
        self.at(index)?.get()
    }

    /// Overwrite the value at `index`
    pub fn set(&self, index: usize, value: T) -> Result<()> {
        self.at(index)?.set(value)
    }

    /// Host view of the live elements with every device write visible
    ///
    /// The view holds the engine's shared lock until it is dropped, and
    /// writes from other threads block until then. On the thread holding the
    /// view, element access through the container can deadlock: a write
    /// waits on the lock this thread holds, and even [`ElementRef::get`]
    /// re-takes the shared lock, which parks behind any writer already
    /// queued. Drop the view before touching elements again. Lock-free
    /// calls such as [`len`](Self::len) and [`CoherenceEngine::state`] are
    /// safe while it is held.
    pub fn view(&self) -> Result<MappedRwLockReadGuard<'_, [T]>> {
        let len = self.len;
        let view = self.engine.host_view()?;
        Ok(MappedRwLockReadGuard::map(view, |host| &host[..len]))
    }

    /// Copy the live elements out
    pub fn to_vec(&self) -> Result<Vec<T>> {
        Ok(self.view()?.to_vec())
    }

    /// Take the live elements, pulling device writes back first
    pub fn into_vec(self) -> Result<Vec<T>> {
        let mut host = self.engine.take_host()?;
        host.truncate(self.len);
        Ok(host)
    }

    /// Deep copy onto the same backend
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = Self::with_config(Arc::clone(self.engine.backend()), self.config.clone())?;
        let view = self.view()?;
        copy.extend_from_slice(&view)?;
        Ok(copy)
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Iterate values
    pub fn iter(&self) -> Values<'_, T, B> {
        Values::new(self)
    }

    /// Iterate element proxies
    pub fn elements(&self) -> Elements<'_, T, B> {
        Elements::new(self)
    }

    /// Cursor at the first element
    pub fn begin(&self) -> Cursor<'_, T, B> {
        Cursor::new(self, 0)
    }

    /// Cursor one past the last element
    pub fn end(&self) -> Cursor<'_, T, B> {
        Cursor::new(self, self.len)
    }

    /// Read-only cursor at the first element
    pub fn cbegin(&self) -> ReadCursor<'_, T, B> {
        ReadCursor::new(self, 0)
    }

    /// Read-only cursor one past the last element
    pub fn cend(&self) -> ReadCursor<'_, T, B> {
        ReadCursor::new(self, self.len)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Drop every element
    ///
    /// Pending host writes are discarded; the accelerator copy is left alone.
    pub fn clear(&mut self) {
        self.len = 0;
        self.engine.discard_host_changes();
    }

    /// Append `value`, growing geometrically when full
    pub fn push_back(&mut self, value: T) -> Result<()> {
        self.grow_for(1)?;
        let at = self.len;
        self.engine.write_host(at, at + 1, |slot| slot[0] = value)?;
        self.len += 1;
        Ok(())
    }

    /// Append the value built by `make` and return a proxy to it
    pub fn emplace_back(&mut self, make: impl FnOnce() -> T) -> Result<ElementRef<'_, T, B>> {
        self.push_back(make())?;
        Ok(ElementRef::new(self, self.len - 1))
    }

    /// Drop the last element without touching either buffer
    pub fn pop_back(&mut self) -> Result<()> {
        if self.len == 0 {
            return Err(Error::out_of_bounds(0, 0));
        }
        self.len -= 1;
        Ok(())
    }

    /// Remove and return the last element
    pub fn pop(&mut self) -> Result<Option<T>> {
        if self.len == 0 {
            return Ok(None);
        }
        let value = self.engine.read(self.len - 1)?;
        self.len -= 1;
        Ok(Some(value))
    }

    /// Insert `value` at `position`, shifting later elements right
    ///
    /// Returns the position of the inserted element.
    pub fn insert(&mut self, position: usize, value: T) -> Result<usize> {
        if position > self.len {
            return Err(Error::out_of_bounds(position, self.len));
        }
        self.grow_for(1)?;

        self.engine.write_host(position, self.len + 1, |region| {
            let last = region.len() - 1;
            region.copy_within(0..last, 1);
            region[0] = value;
        })?;
        self.len += 1;
        trace!(position, len = self.len, "inserted element");
        Ok(position)
    }

    /// Remove the element at `position`, shifting later elements left
    ///
    /// Returns the position now holding the element that followed it.
    pub fn erase(&mut self, position: usize) -> Result<usize> {
        if position >= self.len {
            return Err(Error::out_of_bounds(position, self.len));
        }
        self.erase_range(position..position + 1)
    }

    /// Remove the elements in `range`, shifting later elements left
    pub fn erase_range(&mut self, range: Range<usize>) -> Result<usize> {
        let Range { start, end } = range;
        if start > end || end > self.len {
            return Err(Error::invalid_range(start, end, self.len));
        }
        if start == end {
            return Ok(start);
        }

        let removed = end - start;
        if end < self.len {
            self.engine
                .write_host(start, self.len, |region| region.copy_within(removed.., 0))?;
        }
        self.len -= removed;
        trace!(start, removed, len = self.len, "erased elements");
        Ok(start)
    }

    /// Resize to `new_len`, filling new slots with `value`
    pub fn resize(&mut self, new_len: usize, value: T) -> Result<()> {
        if new_len <= self.len {
            self.len = new_len;
            return Ok(());
        }
        if new_len > self.capacity() {
            self.engine.resize(new_len)?;
        }
        self.engine
            .write_host(self.len, new_len, |region| region.fill(value))?;
        self.len = new_len;
        Ok(())
    }

    /// Replace the contents with `iter`
    pub fn assign(&mut self, iter: impl IntoIterator<Item = T>) -> Result<()> {
        let items: Vec<T> = iter.into_iter().collect();
        self.grow_to(items.len())?;
        self.engine
            .write_host(0, items.len(), |region| region.copy_from_slice(&items))?;
        self.len = items.len();
        Ok(())
    }

    /// Replace the contents with `count` copies of `value`
    pub fn assign_fill(&mut self, count: usize, value: T) -> Result<()> {
        self.grow_to(count)?;
        self.engine
            .write_host(0, count, |region| region.fill(value))?;
        self.len = count;
        Ok(())
    }

    /// Append a copy of `items`
    pub fn extend_from_slice(&mut self, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.grow_for(items.len())?;
        let start = self.len;
        let end = start + items.len();
        self.engine
            .write_host(start, end, |region| region.copy_from_slice(items))?;
        self.len = end;
        Ok(())
    }

    /// Append every item of `iter`
    pub fn try_extend(&mut self, iter: impl IntoIterator<Item = T>) -> Result<()> {
        let items: Vec<T> = iter.into_iter().collect();
        self.extend_from_slice(&items)
    }

    /// Exchange the elements at `a` and `b`
    pub fn swap(&mut self, a: usize, b: usize) -> Result<()> {
        self.at(a)?.swap_with(&self.at(b)?)
    }

    /// Push pending host writes and make sure the accelerator buffer exists
    pub fn prefetch_to_device(&self) -> Result<()> {
        self.engine.sync_to_device()?;
        self.engine.accelerator_handle().map(drop)
    }

    /// Grow capacity so `additional` more elements fit
    fn grow_for(&mut self, additional: usize) -> Result<()> {
        let required = self
            .len
            .checked_add(additional)
            .ok_or_else(|| Error::host_out_of_memory::<T>(usize::MAX))?;
        self.grow_to(required)
    }

    /// Grow capacity geometrically until `required` slots exist
    fn grow_to(&mut self, required: usize) -> Result<()> {
        let capacity = self.capacity();
        if required <= capacity {
            return Ok(());
        }

        let mut target = self.config.next_capacity(capacity);
        while target < required {
            target = self.config.next_capacity(target);
        }
        self.engine.resize(target)
    }

    // =========================================================================
    // Comparison
    // =========================================================================

    /// Compare synchronized host views
    pub fn try_eq(&self, other: &Self) -> Result<bool>
    where
        T: PartialEq,
    {
        if std::ptr::eq(self, other) {
            return Ok(true);
        }
        if self.len != other.len {
            return Ok(false);
        }
        let mine = self.to_vec()?;
        let theirs = other.view()?;
        Ok(mine[..] == theirs[..])
    }

    /// Lexicographic comparison of synchronized host views
    pub fn try_partial_cmp(&self, other: &Self) -> Result<Option<Ordering>>
    where
        T: PartialOrd,
    {
        if std::ptr::eq(self, other) {
            return Ok(Some(Ordering::Equal));
        }
        let mine = self.to_vec()?;
        let theirs = other.view()?;
        Ok(mine[..].partial_cmp(&theirs[..]))
    }
}

impl<T, B> PartialEq for UnifiedVec<T, B>
where
    T: Pod + Send + Sync + PartialEq,
    B: AcceleratorBackend,
{
    fn eq(&self, other: &Self) -> bool {
        self.try_eq(other).unwrap_or_else(|err| {
            warn!(error = %err, "comparison failed to synchronize");
            false
        })
    }
}

impl<T, B> PartialOrd for UnifiedVec<T, B>
where
    T: Pod + Send + Sync + PartialOrd,
    B: AcceleratorBackend,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.try_partial_cmp(other).unwrap_or_else(|err| {
            warn!(error = %err, "comparison failed to synchronize");
            None
        })
    }
}

impl<T: Pod + Send + Sync, B: AcceleratorBackend> std::fmt::Debug for UnifiedVec<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedVec")
            .field("len", &self.len)
            .field("capacity", &self.engine.capacity())
            .field("state", &self.engine.state())
            .finish()
    }
}
