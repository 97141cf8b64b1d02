//! The memory proxy.
//!
//! [`MemoryProxy`] is the single entry point of the protocol engine.  It
//! owns the staging buffer and the state machines guarding it, and borrows
//! everything configured at build time: the memory area table, the
//! descriptor ring, the notifier and the partition runtime.  It is designed
//! to live in a `static`, and every method takes `&self`, so that it can be
//! called from any partition, task or interrupt handler.
//!
//! Single transactions start with [`MemoryProxy::try_acquire()`], which
//! hands out a [`Transaction`] - the only way to touch the staging buffer
//! while the proxy is `Busy`:
//!
//! ```rust,ignore
//! let Some(mut tx) = PROXY.try_acquire() else {
//!     return; // busy, try again next cycle
//! };
//! tx.buffer_mut()[..4].copy_from_slice(&value.to_le_bytes());
//! match tx.submit(ProxyRequest::download(AREA_RAM, 0x2000_0100, 4)) {
//!     Outcome::Ready => PROXY.read_result(|_| ())?,
//!     Outcome::Pending => {} // result_ready() follows
//!     other => warn!("Download failed: {other:?}"),
//! }
//! ```
//!
//! [`MemoryProxy::handle()`] does both steps for requests with no payload
//! to stage.
//!
//! DAQ/STIM events are different: the engine opens an event session with
//! [`Transaction::open_event()`], every partition owning entries then calls
//! [`MemoryProxy::handle()`] with the same `EventBatch` request, and the
//! engine ends the session with [`MemoryProxy::close_event()`] once all of
//! them have responded.  [`crate::event::EventCoordinator`] does this
//! bookkeeping.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::batch::{self, DescriptorRing};
use crate::bitfield::CELL_SIZE;
use crate::buffer::StagingBuffer;
use crate::dispatch::{Notify, PartitionRuntime};
use crate::memory::{self, Access, Backing, MemoryArea, MemoryIo};
use crate::request::{EventId, ProxyRequest, RequestKind};
use crate::state::{CalloutState, ProxyPhase, ProxyState};
use crate::{Error, Result};

const NO_EVENT: u32 = u32::MAX;

/// How a request ended, as far as the caller can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed synchronously, result waiting in the staging buffer and
    /// the engine notified
    Ready,
    /// Completed, but the proxy was interrupted and the result dropped
    Discarded,
    /// Handed to a callout driver, completion follows
    Pending,
    /// Batch processed and the engine notified
    Dispatched,
    /// Another transaction owns the proxy
    Busy,
    /// Rejected, or failed, with no result
    Failed(Error),
}

/// Cross-partition memory access proxy.
///
/// - `M` - plain memory access
/// - `N` - staging buffer capacity in bytes
/// - `C` - descriptor ring capacity in entries
pub struct MemoryProxy<'a, M: MemoryIo, const N: usize, const C: usize> {
    pub(crate) memory: M,
    pub(crate) areas: &'a [MemoryArea<'a>],
    ring: &'a DescriptorRing<C>,
    pub(crate) notifier: &'a dyn Notify,
    runtime: &'a dyn PartitionRuntime,
    pub(crate) state: ProxyState,
    pub(crate) callout: CalloutState,
    pub(crate) staging: StagingBuffer<N>,
    // Retained only while a callout is outstanding
    pub(crate) request: UnsafeCell<Option<ProxyRequest>>,
    pub(crate) result_len: AtomicUsize,
    open_event: AtomicU32,
}

// SAFETY: the staging buffer and retained request are only touched by the
// holder of the proxy state, see `StagingBuffer`.
unsafe impl<M: MemoryIo + Sync, const N: usize, const C: usize> Sync for MemoryProxy<'_, M, N, C> {}

impl<'a, M: MemoryIo, const N: usize, const C: usize> MemoryProxy<'a, M, N, C> {
    /// Create the proxy.
    ///
    /// Arguments:
    /// - `memory` - Plain memory access, used for `Plain` areas and batches
    /// - `areas` - Memory area table, indexed by `ProxyRequest::memory_area`
    /// - `ring` - DAQ/STIM descriptor ring
    /// - `notifier` - Result notification, usually a
    ///   [`crate::dispatch::Dispatcher`]
    /// - `runtime` - Partition identity
    pub const fn new(
        memory: M,
        areas: &'a [MemoryArea<'a>],
        ring: &'a DescriptorRing<C>,
        notifier: &'a dyn Notify,
        runtime: &'a dyn PartitionRuntime,
    ) -> Self {
        Self {
            memory,
            areas,
            ring,
            notifier,
            runtime,
            state: ProxyState::new(),
            callout: CalloutState::new(),
            staging: StagingBuffer::new(),
            request: UnsafeCell::new(None),
            result_len: AtomicUsize::new(0),
            open_event: AtomicU32::new(NO_EVENT),
        }
    }

    pub fn phase(&self) -> ProxyPhase {
        self.state.phase()
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.is_interrupted()
    }

    /// Whether no callout completion is outstanding.
    pub fn callout_idle(&self) -> bool {
        !self.callout.is_awaiting()
    }

    /// Event of the open event session, if any.
    pub fn open_event(&self) -> Option<EventId> {
        match self.open_event.load(Ordering::SeqCst) {
            NO_EVENT => None,
            event => Some(EventId(event as u16)),
        }
    }

    /// Take ownership of the proxy for one transaction.
    ///
    /// Fails if another transaction is running, in which case that one is
    /// marked interrupted and will drop its result, or if a result is still
    /// waiting to be read.
    pub fn try_acquire(&self) -> Option<Transaction<'_, 'a, M, N, C>> {
        if self.state.try_acquire() {
            trace!("Proxy acquired");
            Some(Transaction {
                proxy: self,
                done: false,
            })
        } else {
            None
        }
    }

    /// Entry point for requests which need nothing staged beforehand.
    ///
    /// `Upload` and `ModifyBits` (and `Download`, of whatever the buffer
    /// happens to hold) acquire the proxy, run, and release it.
    /// `EventBatch` runs this partition's share of an open event session.
    pub fn handle(&self, request: ProxyRequest) -> Outcome {
        match request.kind {
            RequestKind::EventBatch {
                event,
                start_index,
                count,
            } => self.run_batch(event, start_index, count),
            _ => match self.try_acquire() {
                Some(tx) => tx.submit(request),
                None => {
                    debug!("Proxy busy, {:?} request refused", request.kind);
                    Outcome::Busy
                }
            },
        }
    }

    /// Run `f` over the waiting result, then make the proxy `Available`.
    pub fn read_result<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        if self.state.phase() != ProxyPhase::Ready {
            return Err(Error::NotReady);
        }
        let len = self.result_len.load(Ordering::SeqCst);
        // SAFETY: nothing leaves `Ready` other than `consume()` below.
        let result = f(unsafe { self.staging.slice(0..len) });
        self.state.consume();
        Ok(result)
    }

    /// End the session of `event`.  With `had_result` the combined batch is
    /// left `Ready` for [`Self::read_result()`].
    pub fn close_event(&self, event: EventId, had_result: bool) -> Result<ProxyPhase> {
        if self
            .open_event
            .compare_exchange(
                event.0 as u32,
                NO_EVENT,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            warn!("Close of event {} which is not open", event.0);
            return Err(Error::WrongEvent);
        }
        let phase = self.state.release(had_result);
        debug!("Event {} closed, proxy {phase:?}", event.0);
        Ok(phase)
    }

    // Runs with the proxy held `Busy`.
    fn run(&self, request: ProxyRequest) -> Outcome {
        let access = match request.kind {
            RequestKind::Upload => Access::READ,
            RequestKind::Download => Access::WRITE,
            RequestKind::ModifyBits(_) => {
                assert_eq!(request.size, CELL_SIZE, "bit modify of {} bytes", request.size);
                Access::READ_WRITE
            }
            RequestKind::EventBatch { event, .. } => {
                warn!("Event {} batch submitted as a transaction", event.0);
                self.state.release(false);
                return Outcome::Failed(Error::InvalidOperation);
            }
        };
        assert!(
            request.size <= N,
            "request of {} bytes exceeds staging capacity {N}",
            request.size
        );

        let area = memory::area(self.areas, request.memory_area);
        if let Err(e) = area.check(request.address, request.size, access) {
            self.state.release(false);
            return Outcome::Failed(e);
        }

        match area.backing {
            Backing::Plain => self.run_sync(request),
            Backing::Callout(driver) => self.issue(driver, request),
        }
    }

    fn run_sync(&self, request: ProxyRequest) -> Outcome {
        let range = 0..request.size;
        // SAFETY: the proxy is held `Busy` by this transaction.
        let staged = unsafe { self.staging.slice_mut(range) };
        match request.kind {
            RequestKind::Upload => self.memory.read_bulk(request.address, staged),
            RequestKind::Download => self.memory.write_bulk(request.address, staged),
            RequestKind::ModifyBits(modify) => {
                self.memory.read_bulk(request.address, staged);
                modify.apply_in_place(staged);
                self.memory.write_bulk(request.address, staged);
            }
            RequestKind::EventBatch { .. } => unreachable!("batches never run as a transaction"),
        }
        trace!(
            "{:?} {:#010X} ({} bytes) done",
            request.kind, request.address, request.size
        );
        match self.complete(&request) {
            ProxyPhase::Ready => Outcome::Ready,
            _ => Outcome::Discarded,
        }
    }

    fn run_batch(&self, event: EventId, start_index: usize, count: usize) -> Outcome {
        if self.state.phase() != ProxyPhase::Busy || self.open_event() != Some(event) {
            warn!("Event {} batch without an open session", event.0);
            return Outcome::Failed(Error::WrongEvent);
        }

        let me = self.runtime.current_partition();
        let total = batch::walk(self.ring, start_index, count, me, |range, descriptor| {
            // SAFETY: the session holds the proxy `Busy`, and every
            // partition walking this run is handed disjoint ranges.
            let payload = unsafe { self.staging.slice_mut(range) };
            batch::perform(descriptor, &self.memory, payload);
        });
        debug!(
            "Event {} batch of {count} entries ({total} bytes) processed in partition {}",
            event.0, me.0
        );

        self.result_len.store(total, Ordering::SeqCst);
        self.notifier.notify(Some(event));
        Outcome::Dispatched
    }

    // Ends a successful single request, sync or callout.  The engine is
    // only notified of a result it can read.
    pub(crate) fn complete(&self, request: &ProxyRequest) -> ProxyPhase {
        self.result_len.store(request.size, Ordering::SeqCst);
        let phase = self.state.release(true);
        match phase {
            ProxyPhase::Ready => self.notifier.notify(request.event()),
            _ => debug!("{:?} completed, result dropped ({phase:?})", request.kind),
        }
        phase
    }

    pub(crate) fn abort(&self) {
        self.state.release(false);
    }
}

/// Exclusive ownership of the proxy for one transaction.
///
/// Dropping a transaction without submitting it releases the proxy with no
/// result.
pub struct Transaction<'p, 'a, M: MemoryIo, const N: usize, const C: usize> {
    proxy: &'p MemoryProxy<'a, M, N, C>,
    done: bool,
}

impl<M: MemoryIo, const N: usize, const C: usize> Transaction<'_, '_, M, N, C> {
    /// The whole staging buffer, e.g. to stage `Download` data.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        // SAFETY: this transaction holds the proxy `Busy`.
        unsafe { self.proxy.staging.slice_mut(0..N) }
    }

    /// Run `request`.  Consumes the transaction: from here the proxy is
    /// released by the request itself, now or on callout completion.
    pub fn submit(mut self, request: ProxyRequest) -> Outcome {
        self.done = true;
        self.proxy.run(request)
    }

    /// Turn this transaction into the session of DAQ/STIM `event`.  The
    /// proxy stays `Busy` until [`MemoryProxy::close_event()`].
    pub fn open_event(mut self, event: EventId) {
        self.done = true;
        debug!("Event {} session opened", event.0);
        self.proxy.result_len.store(0, Ordering::SeqCst);
        self.proxy.open_event.store(event.0 as u32, Ordering::SeqCst);
    }
}

impl<M: MemoryIo, const N: usize, const C: usize> Drop for Transaction<'_, '_, M, N, C> {
    fn drop(&mut self) {
        if !self.done {
            debug!("Transaction dropped unsubmitted");
            self.proxy.state.release(false);
        }
    }
}
