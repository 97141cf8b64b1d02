//! Shared fixtures: RAM backed memory, per-thread partition identity,
//! notification capture and a scripted callout driver.

#![allow(dead_code)]

use std::cell::Cell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use xcp_memproxy::callout::CalloutDriver;
use xcp_memproxy::dispatch::{Notify, PartitionRuntime, PartitionStub, ResultReadyHandler};
use xcp_memproxy::memory::MemoryIo;
use xcp_memproxy::{Error, EventId, PartitionId, Result};

pub const BASE: u32 = 0x2000_0000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Byte addressable RAM starting at `base`.
pub struct Ram {
    base: u32,
    bytes: Mutex<Vec<u8>>,
}

impl Ram {
    pub const fn empty(base: u32) -> Self {
        Self {
            base,
            bytes: Mutex::new(Vec::new()),
        }
    }

    pub fn new(base: u32, len: usize) -> Self {
        Self {
            base,
            bytes: Mutex::new(vec![0; len]),
        }
    }

    pub fn load(&self, addr: u32, data: &[u8]) {
        let start = (addr - self.base) as usize;
        self.bytes.lock().unwrap()[start..start + data.len()].copy_from_slice(data);
    }

    pub fn peek(&self, addr: u32, len: usize) -> Vec<u8> {
        let start = (addr - self.base) as usize;
        self.bytes.lock().unwrap()[start..start + len].to_vec()
    }

    pub fn peek_u32(&self, addr: u32) -> u32 {
        let bytes = self.peek(addr, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl MemoryIo for Ram {
    fn read_bulk(&self, addr: u32, buf: &mut [u8]) {
        let start = (addr - self.base) as usize;
        buf.copy_from_slice(&self.bytes.lock().unwrap()[start..start + buf.len()]);
    }

    fn write_bulk(&self, addr: u32, data: &[u8]) {
        let start = (addr - self.base) as usize;
        self.bytes.lock().unwrap()[start..start + data.len()].copy_from_slice(data);
    }
}

thread_local! {
    static CURRENT: Cell<u8> = const { Cell::new(0) };
}

/// Partition identity of the calling thread, set with [`enter`].
pub struct ThreadPartition;

impl PartitionRuntime for ThreadPartition {
    fn current_partition(&self) -> PartitionId {
        PartitionId(CURRENT.with(Cell::get))
    }
}

pub fn enter(partition: PartitionId) {
    CURRENT.with(|current| current.set(partition.0));
}

/// Records every notification.
pub struct Notifications(Mutex<Vec<Option<EventId>>>);

impl Notifications {
    pub const fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    pub fn take(&self) -> Vec<Option<EventId>> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl Notify for Notifications {
    fn notify(&self, event: Option<EventId>) {
        self.0.lock().unwrap().push(event);
    }
}

impl ResultReadyHandler for Notifications {
    fn result_ready(&self, event: Option<EventId>) {
        self.notify(event);
    }
}

impl PartitionStub for Notifications {
    fn deliver(&self, event: Option<EventId>) {
        self.notify(event);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Read { addr: u32, len: usize },
    Write { addr: u32, data: Vec<u8> },
}

/// Callout driver which records issued calls, for the test to complete.
#[derive(Default)]
pub struct ScriptedDriver {
    calls: Mutex<Vec<Call>>,
    refuse: AtomicBool,
}

impl ScriptedDriver {
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn take(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    fn record(&self, call: Call) -> Result<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Driver);
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl CalloutDriver for ScriptedDriver {
    fn async_read(&self, addr: u32, len: usize) -> Result<()> {
        self.record(Call::Read { addr, len })
    }

    fn async_write(&self, addr: u32, data: &[u8]) -> Result<()> {
        self.record(Call::Write {
            addr,
            data: data.to_vec(),
        })
    }
}
