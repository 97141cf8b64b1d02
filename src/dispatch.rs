//! Cross-partition result notification.
//!
//! When a transaction has put its result in the staging buffer, the
//! partition running the protocol engine must be told.  If that is the
//! partition we are running in, the local [`ResultReadyHandler`] is called
//! directly.  Otherwise the [`PartitionDispatchTable`] provides a stub for
//! the (current, owner) partition pair, which carries the notification
//! across the boundary by whatever means the runtime offers.
//!
//! The dispatcher neither buffers nor retries.  Delivery guarantees are the
//! runtime's.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{AtomicU8, Ordering};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::request::{EventId, PartitionId};

/// Partition identity, provided by the OS/partition runtime.
pub trait PartitionRuntime: Sync {
    /// Partition the caller is executing in.
    fn current_partition(&self) -> PartitionId;
}

/// Engine side handler, called once a result is ready.
///
/// `event` is `None` for a single Upload/Download/ModifyBits transaction.
pub trait ResultReadyHandler: Sync {
    fn result_ready(&self, event: Option<EventId>);
}

/// Call stub delivering a notification from one partition to another.
pub trait PartitionStub: Sync {
    fn deliver(&self, event: Option<EventId>);
}

/// The seam between the proxy and notification delivery.
pub trait Notify: Sync {
    fn notify(&self, event: Option<EventId>);
}

/// Stubs indexed by `[caller][owner]`.  Built once, immutable afterwards.
pub struct PartitionDispatchTable<'a, const P: usize> {
    stubs: [[Option<&'a dyn PartitionStub>; P]; P],
}

impl<'a, const P: usize> PartitionDispatchTable<'a, P> {
    pub const fn new(stubs: [[Option<&'a dyn PartitionStub>; P]; P]) -> Self {
        Self { stubs }
    }

    /// Table where every ordered pair of distinct partitions uses `stub`.
    pub fn uniform(stub: &'a dyn PartitionStub) -> Self {
        let mut stubs = [[None; P]; P];
        for (caller, row) in stubs.iter_mut().enumerate() {
            for (owner, slot) in row.iter_mut().enumerate() {
                if caller != owner {
                    *slot = Some(stub);
                }
            }
        }
        Self { stubs }
    }

    pub fn stub(&self, caller: PartitionId, owner: PartitionId) -> Option<&'a dyn PartitionStub> {
        self.stubs
            .get(caller.index())
            .and_then(|row| row.get(owner.index()))
            .copied()
            .flatten()
    }
}

/// Routes result notifications to the partition of the active connection.
pub struct Dispatcher<'a, const P: usize> {
    runtime: &'a dyn PartitionRuntime,
    local: &'a dyn ResultReadyHandler,
    table: PartitionDispatchTable<'a, P>,
    owner: AtomicU8,
}

impl<'a, const P: usize> Dispatcher<'a, P> {
    /// Create a dispatcher.
    ///
    /// Arguments:
    /// - `runtime` - Partition identity provider
    /// - `local` - Handler called when already running in the owner
    ///   partition
    /// - `table` - Stubs for every other partition pair
    /// - `owner` - Partition initially running the protocol engine
    pub const fn new(
        runtime: &'a dyn PartitionRuntime,
        local: &'a dyn ResultReadyHandler,
        table: PartitionDispatchTable<'a, P>,
        owner: PartitionId,
    ) -> Self {
        Self {
            runtime,
            local,
            table,
            owner: AtomicU8::new(owner.0),
        }
    }

    /// Partition running the protocol engine for the active connection.
    pub fn owner(&self) -> PartitionId {
        PartitionId(self.owner.load(Ordering::SeqCst))
    }

    /// Record which partition now runs the active connection.
    pub fn set_owner(&self, owner: PartitionId) {
        assert!(owner.index() < P, "partition {} out of range", owner.0);
        debug!("Active connection now in partition {}", owner.0);
        self.owner.store(owner.0, Ordering::SeqCst);
    }
}

impl<const P: usize> Notify for Dispatcher<'_, P> {
    fn notify(&self, event: Option<EventId>) {
        let current = self.runtime.current_partition();
        let owner = self.owner();
        if current == owner {
            trace!("Notify {event:?} locally in partition {}", current.0);
            self.local.result_ready(event);
        } else {
            let stub = self.table.stub(current, owner);
            assert!(
                stub.is_some(),
                "no dispatch stub from partition {} to {}",
                current.0,
                owner.0
            );
            if let Some(stub) = stub {
                trace!("Notify {event:?} from partition {} to {}", current.0, owner.0);
                stub.deliver(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Fixed(PartitionId);

    impl PartitionRuntime for Fixed {
        fn current_partition(&self) -> PartitionId {
            self.0
        }
    }

    #[derive(Default)]
    struct Record(Mutex<Vec<Option<EventId>>>);

    impl ResultReadyHandler for Record {
        fn result_ready(&self, event: Option<EventId>) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl PartitionStub for Record {
        fn deliver(&self, event: Option<EventId>) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn local_owner_is_called_directly() {
        let runtime = Fixed(PartitionId(1));
        let local = Record::default();
        let stub = Record::default();
        let dispatcher = Dispatcher::<2>::new(
            &runtime,
            &local,
            PartitionDispatchTable::uniform(&stub),
            PartitionId(1),
        );

        dispatcher.notify(Some(EventId(3)));
        assert_eq!(*local.0.lock().unwrap(), vec![Some(EventId(3))]);
        assert!(stub.0.lock().unwrap().is_empty());
    }

    #[test]
    fn remote_owner_goes_through_pair_stub() {
        let runtime = Fixed(PartitionId(0));
        let local = Record::default();
        let to_one = Record::default();
        let to_two = Record::default();
        let table = PartitionDispatchTable::<3>::new([
            [None, Some(&to_one as &dyn PartitionStub), Some(&to_two as &dyn PartitionStub)],
            [None, None, None],
            [None, None, None],
        ]);
        let dispatcher = Dispatcher::new(&runtime, &local, table, PartitionId(2));

        dispatcher.notify(None);
        assert_eq!(*to_two.0.lock().unwrap(), vec![None]);
        assert!(to_one.0.lock().unwrap().is_empty());
        assert!(local.0.lock().unwrap().is_empty());

        dispatcher.set_owner(PartitionId(1));
        dispatcher.notify(Some(EventId(7)));
        assert_eq!(*to_one.0.lock().unwrap(), vec![Some(EventId(7))]);
    }

    #[test]
    #[should_panic(expected = "no dispatch stub")]
    fn missing_stub_is_fatal() {
        let runtime = Fixed(PartitionId(0));
        let local = Record::default();
        let table = PartitionDispatchTable::<2>::new([[None, None], [None, None]]);
        let dispatcher = Dispatcher::new(&runtime, &local, table, PartitionId(1));
        dispatcher.notify(None);
    }

    #[test]
    fn uniform_table_has_no_self_stubs() {
        let stub = Record::default();
        let table = PartitionDispatchTable::<2>::uniform(&stub);
        assert!(table.stub(PartitionId(0), PartitionId(0)).is_none());
        assert!(table.stub(PartitionId(0), PartitionId(1)).is_some());
        assert!(table.stub(PartitionId(5), PartitionId(1)).is_none());
    }
}
