//! Proxy request descriptor.
//!
//! A [`ProxyRequest`] is built by the protocol engine immediately before it
//! calls into the proxy, and is moved into the proxy by value.  It is only
//! retained past that call while an asynchronous callout is outstanding.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use crate::bitfield::BitModify;

/// Protocol event channel number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u16);

/// Identifier of a protected execution partition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub u8);

impl PartitionId {
    /// Index into per-partition tables.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a request does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Target memory into the staging buffer
    Upload,
    /// Staging buffer into target memory
    Download,
    /// Read-modify-write of a 32-bit cell
    ModifyBits(BitModify),
    /// One scheduled DAQ/STIM event over the descriptor ring
    EventBatch {
        event: EventId,
        /// First ring slot of the event
        start_index: usize,
        /// Number of ring entries in the event
        count: usize,
    },
}

/// The single in-flight transaction descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyRequest {
    pub kind: RequestKind,
    /// Target address, unused for `EventBatch`
    pub address: u32,
    /// Length in bytes, unused for `EventBatch`
    pub size: usize,
    /// Index into the memory area table, unused for `EventBatch`
    pub memory_area: usize,
}

impl ProxyRequest {
    pub const fn upload(memory_area: usize, address: u32, size: usize) -> Self {
        Self {
            kind: RequestKind::Upload,
            address,
            size,
            memory_area,
        }
    }

    pub const fn download(memory_area: usize, address: u32, size: usize) -> Self {
        Self {
            kind: RequestKind::Download,
            address,
            size,
            memory_area,
        }
    }

    /// Bit modify of the 32-bit cell at `address`.  Size is always 4.
    pub const fn modify_bits(memory_area: usize, address: u32, modify: BitModify) -> Self {
        Self {
            kind: RequestKind::ModifyBits(modify),
            address,
            size: 4,
            memory_area,
        }
    }

    pub const fn event_batch(event: EventId, start_index: usize, count: usize) -> Self {
        Self {
            kind: RequestKind::EventBatch {
                event,
                start_index,
                count,
            },
            address: 0,
            size: 0,
            memory_area: 0,
        }
    }

    /// Event this request belongs to, if any.
    pub fn event(&self) -> Option<EventId> {
        match self.kind {
            RequestKind::EventBatch { event, .. } => Some(event),
            _ => None,
        }
    }
}
