//! Cross-partition memory access proxy for XCP-style measurement and
//! calibration engines.
//!
//! The protocol engine of a calibration stack (CTO/DTO framing, DAQ lists,
//! the event scheduler) usually runs in one protected partition, while the
//! memory it reads and writes belongs to others - possibly on another core,
//! possibly behind a vendor storage driver which only offers asynchronous
//! read/write calls.  This crate is the piece in between: a single proxy
//! which performs the actual memory access on the engine's behalf.
//!
//! `no_std`.  Requires `alloc` only for the async callout bridge, which is
//! behind the default `async` feature.
//!
//! ## Architecture
//!
//! There is exactly one in-flight proxy transaction at a time, system wide.
//! Its payload lives in one fixed-size [`buffer::StagingBuffer`], guarded by
//! a small atomic state machine ([`state::ProxyState`]):
//!
//! ```text
//!   Available --try_acquire--> Busy --release(true)--> Ready --read_result--> Available
//!                               |
//!                               +--release(false) / interrupted--> Available
//! ```
//!
//! No lock is taken anywhere a caller may be in interrupt context.  A request
//! arriving while the proxy is `Busy` latches `Interrupted` instead of
//! waiting; the running transaction then finishes to `Available`, discarding
//! its result, so the engine can reissue.
//!
//! Requests are described by [`request::ProxyRequest`] and come in four
//! kinds:
//!
//! - **Upload** - target memory into the staging buffer
//! - **Download** - staging buffer into target memory
//! - **ModifyBits** - read-modify-write of a 32-bit cell, see [`bitfield`]
//! - **EventBatch** - one scheduled DAQ/STIM event, see [`batch`]
//!
//! Each memory area is either plain memory, accessed synchronously through a
//! [`memory::MemoryIo`] implementation, or owned by a vendor
//! [`callout::CalloutDriver`], in which case the transaction suspends until
//! the driver reports completion through
//! [`proxy::MemoryProxy::on_read_complete()`] /
//! [`proxy::MemoryProxy::on_write_complete()`] - from whatever context the
//! driver happens to run in.
//!
//! When a transaction has produced a result, the [`dispatch::Dispatcher`]
//! notifies the partition currently running the protocol engine, either
//! directly or through a per partition-pair stub.
//!
//! For DAQ/STIM, every partition owning entries of an event runs the same
//! batch over the shared [`batch::DescriptorRing`].  Each advances its write
//! offset over *every* entry, owned or not, so all partitions agree on the
//! byte range of every entry without talking to each other.  The engine side
//! bookkeeping for this (building the descriptor run, queueing events while
//! the proxy is busy, counting partition responses) is in [`event`].
//!
//! ## Modules
//!
//! - [`request`] - request descriptor and id types
//! - [`buffer`] - the staging buffer
//! - [`state`] - proxy and callout state machines
//! - [`memory`] - plain memory access and the memory area table
//! - [`callout`] - asynchronous vendor driver path
//! - [`bitfield`] - bit modify engine
//! - [`batch`] - DAQ/STIM descriptor ring and batch processor
//! - [`dispatch`] - cross-partition result notification
//! - [`proxy`] - the proxy itself
//! - [`event`] - engine side event coordination
//! - [`io`] - async memory I/O traits, used by the async callout bridge
//!
//! ## Features
//!
//! Default features:
//! - `async` - Enable [`callout::futures`], which drives a callout memory
//!   area from an async driver (requires `alloc`).
//!
//! Compile with `--no-default-features` for a target with no allocator.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "async")]
extern crate alloc;

pub mod batch;
pub mod bitfield;
pub mod buffer;
pub mod callout;
pub mod dispatch;
pub mod event;
pub mod io;
pub mod memory;
pub mod proxy;
pub mod request;
pub mod state;

pub use proxy::{MemoryProxy, Outcome, Transaction};
pub use request::{EventId, PartitionId, ProxyRequest, RequestKind};

/// Proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Proxy is owned by another transaction
    Busy,
    /// No result is waiting to be read
    NotReady,
    /// Callout driver reported, or refused, an access
    Driver,
    /// Address range or access mode not permitted by the memory area
    AccessDenied,
    /// Completion arrived with no outstanding callout
    Stale,
    /// Batch refers to an event which is not the open event
    WrongEvent,
    /// Pending event queue is full
    QueueFull,
    /// Descriptor ring has no free slot outside the in-flight event
    RingFull,
    /// Invalid operation for the current state
    InvalidOperation,
}

/// Type to represent the result of a proxy operation
pub type Result<T> = core::result::Result<T, Error>;
