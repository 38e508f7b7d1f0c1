//! Memory coherence state
//!
//! Exactly one state holds at any instant:
//!
//! ```text
//! Clean --(host write)--> HostDirty --(sync_to_device)--> Clean
//! Clean --(device write)--> DeviceDirty --(sync_to_host)--> Clean
//! ```
//!
//! There is no direct edge between `HostDirty` and `DeviceDirty`.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Which side holds the authoritative copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum MemoryState {
    /// Host and device copies agree
    #[default]
    Clean = 0,
    /// Host has writes the device has not seen
    HostDirty = 1,
    /// Device has writes the host has not seen
    DeviceDirty = 2,
}

impl MemoryState {
    #[inline]
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => MemoryState::HostDirty,
            2 => MemoryState::DeviceDirty,
            _ => MemoryState::Clean,
        }
    }

    /// Get name
    pub fn name(&self) -> &'static str {
        match self {
            MemoryState::Clean => "clean",
            MemoryState::HostDirty => "host-dirty",
            MemoryState::DeviceDirty => "device-dirty",
        }
    }
}

impl std::fmt::Display for MemoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lock-free cell holding a [`MemoryState`]
///
/// Loads use acquire and stores use release, so a thread that observes a
/// state also observes the buffer writes made before it was published.
#[derive(Debug, Default)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) const fn new(state: MemoryState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub(crate) fn load(&self) -> MemoryState {
        MemoryState::from_raw(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn store(&self, state: MemoryState) {
        self.0.store(state as u8, Ordering::Release);
    }
}
