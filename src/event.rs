//! Engine side DAQ/STIM event coordination.
//!
//! The proxy runs one batch at a time.  [`EventCoordinator`] sits in the
//! protocol engine's partition and does the surrounding bookkeeping:
//!
//! - builds each event's run of descriptors in the shared ring, never
//!   overwriting slots of an event not yet finished with
//! - opens the proxy's event session for an event, or queues the event
//!   while the proxy is in use
//! - counts the responses of the partitions owning entries, and closes the
//!   session once they have all processed their share
//! - starts the next queued event once the engine has read the result
//!
//! ```rust,ignore
//! coordinator.begin(EventId(3));
//! for descriptor in daq_list.descriptors() {
//!     coordinator.stage(descriptor)?;
//! }
//! let pending = coordinator.finish()?;
//! if let Submitted::Started(started) = coordinator.submit(&PROXY, pending)? {
//!     for partition in started.responders.iter() {
//!         forward(partition, started.request);
//!     }
//! }
//! ```
//!
//! Each partition runs the forwarded request through
//! [`crate::MemoryProxy::handle()`], which notifies the engine, whose
//! result-ready handler then calls [`EventCoordinator::on_response()`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use heapless::Deque;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::batch::{DescriptorRing, SampleDescriptor};
use crate::memory::MemoryIo;
use crate::proxy::MemoryProxy;
use crate::request::{EventId, PartitionId, ProxyRequest};
use crate::state::ProxyPhase;
use crate::{Error, Result};

/// Set of partitions, as a bitmap.  Supports partitions 0 to 31.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSet(u32);

impl PartitionSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, partition: PartitionId) {
        assert!(partition.0 < 32, "partition {} out of range", partition.0);
        self.0 |= 1 << partition.0;
    }

    pub fn contains(&self, partition: PartitionId) -> bool {
        partition.0 < 32 && self.0 & (1 << partition.0) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = PartitionId> + '_ {
        (0..32u8)
            .map(PartitionId)
            .filter(|partition| self.contains(*partition))
    }
}

/// A fully staged event, ready to submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    pub event: EventId,
    pub start_index: usize,
    pub count: usize,
    /// Partitions owning at least one entry
    pub responders: PartitionSet,
}

impl PendingEvent {
    pub fn request(&self) -> ProxyRequest {
        ProxyRequest::event_batch(self.event, self.start_index, self.count)
    }
}

/// An event whose session was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Started {
    /// To forward to every responder
    pub request: ProxyRequest,
    pub responders: PartitionSet,
}

/// What [`EventCoordinator::submit()`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Session opened, forward the request to the responders
    Started(Started),
    /// Event had no entries, so its (empty) result is ready at once
    Completed,
    /// Waiting behind the in-flight event
    Queued,
    /// Event is already in flight or queued
    Duplicate,
    /// Queue full, overload already reported
    Dropped,
}

/// Progress of the in-flight event after a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventProgress {
    /// Still waiting for this many partitions
    Waiting(usize),
    /// Every responder has answered, the combined result is `Ready`
    Complete,
    /// Response was not for the in-flight event, or was a repeat
    Ignored,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    pending: PendingEvent,
    answered: PartitionSet,
}

#[derive(Debug, Clone, Copy)]
struct Building {
    event: EventId,
    start_index: usize,
    responders: PartitionSet,
}

/// Event bookkeeping for one protocol engine.
///
/// - `C` - descriptor ring capacity, as for the proxy
/// - `Q` - maximum number of queued events
pub struct EventCoordinator<'a, const C: usize, const Q: usize> {
    ring: &'a DescriptorRing<C>,
    // Absolute ring index of the next free slot
    cursor: usize,
    building: Option<Building>,
    in_flight: Option<InFlight>,
    queue: Deque<PendingEvent, Q>,
    overload_reported: bool,
}

impl<'a, const C: usize, const Q: usize> EventCoordinator<'a, C, Q> {
    pub const fn new(ring: &'a DescriptorRing<C>) -> Self {
        Self {
            ring,
            cursor: 0,
            building: None,
            in_flight: None,
            queue: Deque::new(),
            overload_reported: false,
        }
    }

    /// Event currently holding the proxy, if any.
    pub fn in_flight(&self) -> Option<EventId> {
        self.in_flight.map(|f| f.pending.event)
    }

    /// Number of queued events.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Start building the descriptor run of `event`.  Any run being built
    /// and not finished is abandoned.
    pub fn begin(&mut self, event: EventId) {
        if let Some(building) = self.building.take() {
            warn!("Abandoning unfinished run of event {}", building.event.0);
            self.cursor = building.start_index;
        }
        self.building = Some(Building {
            event,
            start_index: self.cursor,
            responders: PartitionSet::empty(),
        });
    }

    /// Append `descriptor` to the run being built.
    pub fn stage(&mut self, descriptor: SampleDescriptor) -> Result<()> {
        let oldest = self.oldest_live();
        let Some(building) = self.building.as_mut() else {
            warn!("Descriptor staged with no event begun");
            return Err(Error::InvalidOperation);
        };
        if self.cursor.wrapping_sub(oldest) >= C {
            warn!("Descriptor ring full staging event {}", building.event.0);
            return Err(Error::RingFull);
        }
        // SAFETY: the slot lies outside every event in flight or queued,
        // so no partition is reading it.
        unsafe { self.ring.store(self.cursor, descriptor) };
        building.responders.insert(descriptor.owner);
        self.cursor = self.cursor.wrapping_add(1);
        Ok(())
    }

    /// Finish the run being built.
    pub fn finish(&mut self) -> Result<PendingEvent> {
        let building = self.building.take().ok_or(Error::InvalidOperation)?;
        let pending = PendingEvent {
            event: building.event,
            start_index: building.start_index,
            count: self.cursor.wrapping_sub(building.start_index),
            responders: building.responders,
        };
        trace!(
            "Event {} staged: {} entries for {} partitions",
            pending.event.0,
            pending.count,
            pending.responders.len()
        );
        Ok(pending)
    }

    /// Start `pending`, or queue it if the proxy is in use.
    ///
    /// Queue overload is reported, as `Error::QueueFull`, once.  Further
    /// overloads drop the event silently until the queue has drained.
    pub fn submit<M: MemoryIo, const N: usize>(
        &mut self,
        proxy: &MemoryProxy<'_, M, N, C>,
        pending: PendingEvent,
    ) -> Result<Submitted> {
        let event = pending.event;
        if self.in_flight() == Some(event) || self.queue.iter().any(|p| p.event == event) {
            debug!("Event {} already pending, dropped", event.0);
            return Ok(Submitted::Duplicate);
        }

        if self.in_flight.is_none() && self.queue.is_empty() {
            if let Some(submitted) = self.start(proxy, pending) {
                return Ok(submitted);
            }
        }

        match self.queue.push_back(pending) {
            Ok(()) => {
                trace!("Event {} queued ({} waiting)", event.0, self.queue.len());
                Ok(Submitted::Queued)
            }
            Err(_) if self.overload_reported => Ok(Submitted::Dropped),
            Err(_) => {
                warn!("Event queue overloaded, event {} dropped", event.0);
                self.overload_reported = true;
                Err(Error::QueueFull)
            }
        }
    }

    /// A partition has processed its share of `event`.
    pub fn on_response<M: MemoryIo, const N: usize>(
        &mut self,
        proxy: &MemoryProxy<'_, M, N, C>,
        event: EventId,
        from: PartitionId,
    ) -> Result<EventProgress> {
        let Some(in_flight) = self.in_flight.as_mut() else {
            warn!("Response for event {} with none in flight", event.0);
            return Ok(EventProgress::Ignored);
        };
        if in_flight.pending.event != event
            || !in_flight.pending.responders.contains(from)
            || in_flight.answered.contains(from)
        {
            warn!("Unexpected response for event {} from partition {}", event.0, from.0);
            return Ok(EventProgress::Ignored);
        }

        in_flight.answered.insert(from);
        let remaining = in_flight.pending.responders.len() - in_flight.answered.len();
        if remaining > 0 {
            return Ok(EventProgress::Waiting(remaining));
        }

        self.in_flight = None;
        proxy.close_event(event, true)?;
        Ok(EventProgress::Complete)
    }

    /// Start the next queued event, if the proxy is free for it.  Call
    /// once the engine has read the previous result.
    pub fn resume<M: MemoryIo, const N: usize>(
        &mut self,
        proxy: &MemoryProxy<'_, M, N, C>,
    ) -> Option<Submitted> {
        if self.in_flight.is_some() {
            return None;
        }
        let pending = *self.queue.front()?;
        let submitted = self.start(proxy, pending)?;
        self.queue.pop_front();
        if self.queue.is_empty() {
            self.overload_reported = false;
        }
        Some(submitted)
    }

    /// Drop every queued event and the ring contents.  An open session is
    /// closed with no result.
    pub fn reset<M: MemoryIo, const N: usize>(&mut self, proxy: &MemoryProxy<'_, M, N, C>) {
        if let Some(in_flight) = self.in_flight.take() {
            let _ = proxy.close_event(in_flight.pending.event, false);
        }
        debug!("Event coordinator reset, {} queued events dropped", self.queue.len());
        self.queue.clear();
        self.building = None;
        self.cursor = 0;
        self.overload_reported = false;
    }

    fn start<M: MemoryIo, const N: usize>(
        &mut self,
        proxy: &MemoryProxy<'_, M, N, C>,
        pending: PendingEvent,
    ) -> Option<Submitted> {
        // Acquiring a busy proxy would interrupt its transaction.
        if proxy.phase() != ProxyPhase::Available {
            return None;
        }
        let tx = proxy.try_acquire()?;
        tx.open_event(pending.event);

        if pending.responders.is_empty() {
            let _ = proxy.close_event(pending.event, true);
            return Some(Submitted::Completed);
        }

        debug!(
            "Event {} started for {} partitions",
            pending.event.0,
            pending.responders.len()
        );
        self.in_flight = Some(InFlight {
            pending,
            answered: PartitionSet::empty(),
        });
        Some(Submitted::Started(Started {
            request: pending.request(),
            responders: pending.responders,
        }))
    }

    // Absolute index of the oldest slot still needed.
    fn oldest_live(&self) -> usize {
        self.in_flight
            .map(|f| f.pending.start_index)
            .or_else(|| self.queue.front().map(|p| p.start_index))
            .or_else(|| self.building.map(|b| b.start_index))
            .unwrap_or(self.cursor)
    }
}
