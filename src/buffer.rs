//! The staging buffer.
//!
//! One process-wide byte array is used as the in/out payload area of every
//! proxy transaction.  It has no lock of its own: ownership follows the
//! proxy state, so the buffer may only be touched by whoever moved the proxy
//! out of `Available`.  See [`crate::state::ProxyState`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::cell::UnsafeCell;
use core::ops::Range;

/// Fixed-capacity staging buffer.
pub struct StagingBuffer<const N: usize> {
    bytes: UnsafeCell<[u8; N]>,
}

// SAFETY: every access goes through the unsafe accessors below, whose
// callers must hold the proxy (state != Available).  Concurrent access by
// several partitions during a batch is to disjoint ranges only.
unsafe impl<const N: usize> Sync for StagingBuffer<N> {}

impl<const N: usize> StagingBuffer<N> {
    // Must be const so that the proxy can live in a static.
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            bytes: UnsafeCell::new([0; N]),
        }
    }

    /// Capacity in bytes.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Shared view of `range`.
    ///
    /// # Safety
    ///
    /// The caller must own the proxy, and no mutable view of an
    /// overlapping range may be live.
    ///
    /// # Panics
    ///
    /// If `range` is not within the buffer.
    pub unsafe fn slice(&self, range: Range<usize>) -> &[u8] {
        check_range(&range, N);
        let base = self.bytes.get() as *const u8;
        // SAFETY: range checked above, aliasing guaranteed by the caller.
        unsafe { core::slice::from_raw_parts(base.add(range.start), range.len()) }
    }

    /// Mutable view of `range`.
    ///
    /// Built from a raw pointer so that two partitions holding disjoint
    /// ranges never create overlapping references to the whole array.
    ///
    /// # Safety
    ///
    /// The caller must own the proxy, and no other view of an overlapping
    /// range may be live.
    ///
    /// # Panics
    ///
    /// If `range` is not within the buffer.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, range: Range<usize>) -> &mut [u8] {
        check_range(&range, N);
        let base = self.bytes.get() as *mut u8;
        // SAFETY: range checked above, aliasing guaranteed by the caller.
        unsafe { core::slice::from_raw_parts_mut(base.add(range.start), range.len()) }
    }
}

fn check_range(range: &Range<usize>, capacity: usize) {
    assert!(
        range.start <= range.end && range.end <= capacity,
        "staging range {}..{} exceeds capacity {capacity}",
        range.start,
        range.end
    );
}
