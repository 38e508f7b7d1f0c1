//! Element proxy
//!
//! An [`ElementRef`] names one slot of a [`UnifiedVec`] and routes every read
//! and write through the coherence engine. It never hands out `&T` or
//! `&mut T`: a reference would let writes bypass dirty tracking.
//!
//! Reads pull device writes back first (the whole buffer; the device side
//! tracks no ranges). Writes mark exactly `[index, index + 1)`.

use std::ops::{AddAssign, DivAssign, MulAssign, RemAssign, SubAssign};

use bytemuck::Pod;

use crate::backend::AcceleratorBackend;
use crate::vector::UnifiedVec;
use crate::{Error, Result};

/// Proxy for one element of a [`UnifiedVec`]
pub struct ElementRef<'a, T: Pod, B: AcceleratorBackend> {
    vec: &'a UnifiedVec<T, B>,
    index: usize,
}

impl<'a, T, B> ElementRef<'a, T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    pub(crate) fn new(vec: &'a UnifiedVec<T, B>, index: usize) -> Self {
        Self { vec, index }
    }

    /// Position inside the container
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Read the current value, synchronizing device writes to host first
    pub fn get(&self) -> Result<T> {
        self.vec.engine().read(self.index)
    }

    /// Overwrite the value and mark the slot host-dirty
    pub fn set(&self, value: T) -> Result<()> {
        let end = self
            .index
            .checked_add(1)
            .ok_or_else(|| Error::out_of_bounds(self.index, self.vec.capacity()))?;
        self.vec
            .engine()
            .write_host(self.index, end, |slot| slot[0] = value)
    }

    /// Apply `f` to the value, store and return the result
    ///
    /// Read and write are separate engine calls; the pair is not atomic.
    pub fn update(&self, f: impl FnOnce(T) -> T) -> Result<T> {
        let value = f(self.get()?);
        self.set(value)?;
        Ok(value)
    }

    /// Store `value` and return the previous one
    pub fn replace(&self, value: T) -> Result<T> {
        let old = self.get()?;
        self.set(value)?;
        Ok(old)
    }

    /// Exchange values with another slot
    pub fn swap_with(&self, other: &ElementRef<'_, T, B>) -> Result<()> {
        let mine = self.get()?;
        let theirs = other.get()?;
        self.set(theirs)?;
        other.set(mine)
    }

    /// `*self += rhs`
    pub fn add_assign<U>(&self, rhs: U) -> Result<()>
    where
        T: AddAssign<U>,
    {
        self.modify(|v| *v += rhs)
    }

    /// `*self -= rhs`
    pub fn sub_assign<U>(&self, rhs: U) -> Result<()>
    where
        T: SubAssign<U>,
    {
        self.modify(|v| *v -= rhs)
    }

    /// `*self *= rhs`
    pub fn mul_assign<U>(&self, rhs: U) -> Result<()>
    where
        T: MulAssign<U>,
    {
        self.modify(|v| *v *= rhs)
    }

    /// `*self /= rhs`
    pub fn div_assign<U>(&self, rhs: U) -> Result<()>
    where
        T: DivAssign<U>,
    {
        self.modify(|v| *v /= rhs)
    }

    /// `*self %= rhs`
    pub fn rem_assign<U>(&self, rhs: U) -> Result<()>
    where
        T: RemAssign<U>,
    {
        self.modify(|v| *v %= rhs)
    }

    fn modify(&self, f: impl FnOnce(&mut T)) -> Result<()> {
        let mut value = self.get()?;
        f(&mut value);
        self.set(value)
    }
}

impl<T: Pod, B: AcceleratorBackend> Clone for ElementRef<'_, T, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Pod, B: AcceleratorBackend> Copy for ElementRef<'_, T, B> {}

impl<T: Pod, B: AcceleratorBackend> std::fmt::Debug for ElementRef<'_, T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementRef")
            .field("index", &self.index)
            .finish()
    }
}
