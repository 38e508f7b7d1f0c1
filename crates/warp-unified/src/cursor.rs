//! Positional cursors and iterators
//!
//! A cursor is a `(container, index)` pair with random-access arithmetic.
//! [`Cursor`] produces [`ElementRef`] proxies; [`ReadCursor`] produces values.
//! Two cursors are equal when they name the same container and the same
//! index. Cursors over different containers are unordered.
//!
//! Cursors may sit anywhere from `0` to `len` (the end position); reading
//! through one past the live length is the caller's bug, caught by the
//! engine only when it falls outside the capacity.

use std::cmp::Ordering;

use bytemuck::Pod;

use crate::Result;
use crate::backend::AcceleratorBackend;
use crate::element::ElementRef;
use crate::vector::UnifiedVec;

macro_rules! cursor_arithmetic {
    ($name:ident) => {
        impl<'a, T, B> $name<'a, T, B>
        where
            T: Pod + Send + Sync,
            B: AcceleratorBackend,
        {
            pub(crate) fn new(vec: &'a UnifiedVec<T, B>, index: usize) -> Self {
                Self { vec, index }
            }

            /// Current position
            #[inline]
            pub fn index(&self) -> usize {
                self.index
            }

            /// Move forward by `n` positions
            #[inline]
            pub fn advance(&mut self, n: usize) {
                self.index = self.index.saturating_add(n);
            }

            /// Move back by `n` positions, stopping at position 0
            #[inline]
            pub fn retreat(&mut self, n: usize) {
                self.index = self.index.saturating_sub(n);
            }

            /// Cursor `delta` positions away, or `None` when that is before 0
            pub fn offset(&self, delta: isize) -> Option<Self> {
                self.index
                    .checked_add_signed(delta)
                    .map(|index| Self::new(self.vec, index))
            }

            /// Signed number of positions from `self` to `other`
            pub fn distance(&self, other: &Self) -> isize {
                if other.index >= self.index {
                    (other.index - self.index) as isize
                } else {
                    -((self.index - other.index) as isize)
                }
            }

            fn same_container(&self, other: &Self) -> bool {
                std::ptr::eq(self.vec, other.vec)
            }
        }

        impl<T: Pod, B: AcceleratorBackend> Clone for $name<'_, T, B> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T: Pod, B: AcceleratorBackend> Copy for $name<'_, T, B> {}

        impl<T, B> PartialEq for $name<'_, T, B>
        where
            T: Pod + Send + Sync,
            B: AcceleratorBackend,
        {
            fn eq(&self, other: &Self) -> bool {
                self.same_container(other) && self.index == other.index
            }
        }

        impl<T, B> PartialOrd for $name<'_, T, B>
        where
            T: Pod + Send + Sync,
            B: AcceleratorBackend,
        {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                self.same_container(other)
                    .then(|| self.index.cmp(&other.index))
            }
        }

        impl<T: Pod, B: AcceleratorBackend> std::fmt::Debug for $name<'_, T, B> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("index", &self.index)
                    .finish()
            }
        }
    };
}

/// Mutable cursor yielding element proxies
pub struct Cursor<'a, T: Pod, B: AcceleratorBackend> {
    vec: &'a UnifiedVec<T, B>,
    index: usize,
}

/// Read-only cursor yielding values
pub struct ReadCursor<'a, T: Pod, B: AcceleratorBackend> {
    vec: &'a UnifiedVec<T, B>,
    index: usize,
}

cursor_arithmetic!(Cursor);
cursor_arithmetic!(ReadCursor);

impl<'a, T, B> Cursor<'a, T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    /// Proxy for the element under the cursor
    pub fn element(&self) -> ElementRef<'a, T, B> {
        ElementRef::new(self.vec, self.index)
    }

    /// Read the element under the cursor
    pub fn get(&self) -> Result<T> {
        self.element().get()
    }

    /// Write the element under the cursor
    pub fn set(&self, value: T) -> Result<()> {
        self.element().set(value)
    }

    /// Read-only cursor at the same position
    pub fn as_read(&self) -> ReadCursor<'a, T, B> {
        ReadCursor::new(self.vec, self.index)
    }
}

impl<T, B> ReadCursor<'_, T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    /// Read the element under the cursor, synchronizing device writes first
    pub fn get(&self) -> Result<T> {
        self.vec.engine().read(self.index)
    }
}

/// Iterator over element values, see [`UnifiedVec::iter`]
///
/// Each item is read through the engine, so a failed device-to-host transfer
/// surfaces as an `Err` item.
pub struct Values<'a, T: Pod, B: AcceleratorBackend> {
    vec: &'a UnifiedVec<T, B>,
    front: usize,
    back: usize,
}

impl<'a, T, B> Values<'a, T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    pub(crate) fn new(vec: &'a UnifiedVec<T, B>) -> Self {
        Self {
            vec,
            front: 0,
            back: vec.len(),
        }
    }
}

impl<T, B> Iterator for Values<'_, T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let index = self.front;
        self.front += 1;
        Some(self.vec.engine().read(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl<T, B> DoubleEndedIterator for Values<'_, T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(self.vec.engine().read(self.back))
    }
}

impl<T, B> ExactSizeIterator for Values<'_, T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
}

/// Iterator over element proxies, see [`UnifiedVec::elements`]
pub struct Elements<'a, T: Pod, B: AcceleratorBackend> {
    vec: &'a UnifiedVec<T, B>,
    range: std::ops::Range<usize>,
}

impl<'a, T, B> Elements<'a, T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    pub(crate) fn new(vec: &'a UnifiedVec<T, B>) -> Self {
        Self {
            vec,
            range: 0..vec.len(),
        }
    }
}

impl<'a, T, B> Iterator for Elements<'a, T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    type Item = ElementRef<'a, T, B>;

    fn next(&mut self) -> Option<Self::Item> {
        self.range
            .next()
            .map(|index| ElementRef::new(self.vec, index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.range.size_hint()
    }
}

impl<T, B> DoubleEndedIterator for Elements<'_, T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    fn next_back(&mut self) -> Option<Self::Item> {
        self.range
            .next_back()
            .map(|index| ElementRef::new(self.vec, index))
    }
}

impl<T, B> ExactSizeIterator for Elements<'_, T, B>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
}
