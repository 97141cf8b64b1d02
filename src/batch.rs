//! DAQ/STIM batch processing.
//!
//! The event scheduler serialises the work of one event as a run of
//! [`SampleDescriptor`]s in a shared, globally indexed [`DescriptorRing`].
//! Every partition owning at least one entry of the event walks the whole
//! run, and the entries it owns are performed against its own memory, with
//! their payload at a deterministic offset of the shared staging buffer.
//!
//! The write offset is advanced by *every* entry's size, owned or not.
//! Because all partitions walk the same descriptors, each computes the same
//! byte range for every entry, and together they fill one coherent buffer
//! without ever writing into each other's slice, or needing a lock to do
//! so.  Skipping the offset contribution of foreign entries would break
//! this.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::cell::UnsafeCell;
use core::ops::Range;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::memory::MemoryIo;
use crate::request::PartitionId;

/// What to do with one entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SampleOp {
    /// Sample: copy `size` bytes at `primary_addr` into the buffer
    #[default]
    PlainCopy,
    /// Stimulate: copy the value at `secondary_addr` (or, if none, the
    /// value already staged) to `primary_addr`
    Stimulate,
    /// Write bank select byte 0 at `primary_addr`, then sample
    SampleBank0,
    /// Write bank select byte 1 at `primary_addr`, then sample
    SampleBank1,
    /// OR `bit_mask` into the value at `secondary_addr` and stimulate
    /// `primary_addr` with the result
    StimulateSet,
    /// AND out `bit_mask` from the value at `secondary_addr` and stimulate
    /// `primary_addr` with the result
    StimulateClear,
}

/// One entry of the descriptor ring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SampleDescriptor {
    /// Partition whose memory this entry touches
    pub owner: PartitionId,
    pub op: SampleOp,
    pub primary_addr: u32,
    pub secondary_addr: Option<u32>,
    pub size: usize,
    pub bit_mask: u8,
}

impl SampleDescriptor {
    const EMPTY: Self = Self {
        owner: PartitionId(0),
        op: SampleOp::PlainCopy,
        primary_addr: 0,
        secondary_addr: None,
        size: 0,
        bit_mask: 0,
    };

    /// Plain sample of `size` bytes at `addr`.
    pub const fn sample(owner: PartitionId, addr: u32, size: usize) -> Self {
        Self {
            owner,
            op: SampleOp::PlainCopy,
            primary_addr: addr,
            secondary_addr: None,
            size,
            bit_mask: 0,
        }
    }

    /// Stimulation of `size` bytes at `addr` from the staged value.
    pub const fn stimulate(owner: PartitionId, addr: u32, size: usize) -> Self {
        Self {
            owner,
            op: SampleOp::Stimulate,
            primary_addr: addr,
            secondary_addr: None,
            size,
            bit_mask: 0,
        }
    }

    pub const fn with_op(mut self, op: SampleOp) -> Self {
        self.op = op;
        self
    }

    pub const fn with_secondary(mut self, addr: u32) -> Self {
        self.secondary_addr = Some(addr);
        self
    }

    pub const fn with_bit_mask(mut self, mask: u8) -> Self {
        self.bit_mask = mask;
        self
    }

    fn source(&self) -> u32 {
        self.secondary_addr.unwrap_or(self.primary_addr)
    }
}

/// Shared ring of descriptors.
///
/// Multi-reader: every partition processing an event reads it.  Single
/// writer: only the scheduler stores into it, never into slots of an event
/// being processed.
pub struct DescriptorRing<const C: usize> {
    slots: [UnsafeCell<SampleDescriptor>; C],
}

// SAFETY: writes only happen through `store`, whose contract excludes
// concurrent readers of the slot written.
unsafe impl<const C: usize> Sync for DescriptorRing<C> {}

impl<const C: usize> DescriptorRing<C> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            slots: [const { UnsafeCell::new(SampleDescriptor::EMPTY) }; C],
        }
    }

    pub const fn capacity(&self) -> usize {
        C
    }

    /// Store `descriptor` at `index` (mod capacity).
    ///
    /// # Safety
    ///
    /// No event whose run covers `index` may be being processed, by any
    /// partition, while this is called.
    pub unsafe fn store(&self, index: usize, descriptor: SampleDescriptor) {
        // SAFETY: exclusive access to the slot is the caller's contract.
        unsafe { *self.slots[index % C].get() = descriptor };
    }

    /// Descriptor at `index` (mod capacity).
    pub fn get(&self, index: usize) -> SampleDescriptor {
        // SAFETY: `store` never runs concurrently with a read of the slot.
        unsafe { *self.slots[index % C].get() }
    }

    /// `count` descriptors from `start`, wrapping.
    pub fn run(&self, start: usize, count: usize) -> impl Iterator<Item = SampleDescriptor> + '_ {
        (0..count).map(move |i| self.get((start + i) % C))
    }
}

/// Walk a run of the ring on behalf of partition `me`.
///
/// Calls `each` with the staging byte range of every entry owned by `me`,
/// and returns the total length of the run.  Offsets account for every
/// entry, whoever owns it.
pub fn walk<const C: usize>(
    ring: &DescriptorRing<C>,
    start: usize,
    count: usize,
    me: PartitionId,
    mut each: impl FnMut(Range<usize>, &SampleDescriptor),
) -> usize {
    let mut write_offset = 0usize;
    for descriptor in ring.run(start, count) {
        let range = write_offset..write_offset + descriptor.size;
        write_offset = range.end;
        if descriptor.owner == me {
            each(range, &descriptor);
        }
    }
    write_offset
}

/// Perform one descriptor against `memory`, with `payload` its slice of the
/// staging buffer.
pub fn perform<M: MemoryIo + ?Sized>(descriptor: &SampleDescriptor, memory: &M, payload: &mut [u8]) {
    debug_assert_eq!(payload.len(), descriptor.size);
    trace!(
        "{:?} {:#010X} ({} bytes)",
        descriptor.op, descriptor.primary_addr, descriptor.size
    );
    match descriptor.op {
        SampleOp::PlainCopy => memory.read_bulk(descriptor.primary_addr, payload),
        SampleOp::Stimulate => {
            if let Some(src) = descriptor.secondary_addr {
                memory.read_bulk(src, payload);
            }
            memory.write_bulk(descriptor.primary_addr, payload);
        }
        SampleOp::SampleBank0 | SampleOp::SampleBank1 => {
            let select = u8::from(descriptor.op == SampleOp::SampleBank1);
            memory.write_u8(descriptor.primary_addr, select);
            memory.read_bulk(descriptor.source(), payload);
        }
        SampleOp::StimulateSet | SampleOp::StimulateClear => {
            memory.read_bulk(descriptor.source(), payload);
            if let Some(first) = payload.first_mut() {
                *first = if descriptor.op == SampleOp::StimulateSet {
                    *first | descriptor.bit_mask
                } else {
                    *first & !descriptor.bit_mask
                };
            }
            memory.write_bulk(descriptor.primary_addr, payload);
        }
    }
}

/// Process a run of the ring for partition `me` into `staging`, which must
/// hold the whole run.  Returns the run length.
///
/// # Panics
///
/// If the run does not fit in `staging`.
pub fn process_batch<M: MemoryIo + ?Sized, const C: usize>(
    ring: &DescriptorRing<C>,
    start: usize,
    count: usize,
    me: PartitionId,
    memory: &M,
    staging: &mut [u8],
) -> usize {
    let capacity = staging.len();
    walk(ring, start, count, me, |range, descriptor| {
        assert!(
            range.end <= capacity,
            "batch overruns staging buffer ({} > {capacity})",
            range.end
        );
        perform(descriptor, memory, &mut staging[range]);
    })
}
