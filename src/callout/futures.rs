//! Async callout bridge.
//!
//! Lets a callout memory area be served by an async driver - for example
//! flash or EEPROM reached through another task, or target memory reached
//! over a debug probe - rather than by a vendor driver with its own
//! completion interrupts.
//!
//! [`CalloutPump`] is the [`CalloutDriver`] the memory area is configured
//! with.  Issued operations are only recorded; [`CalloutPump::pump()`],
//! awaited by whichever task owns the async driver, performs them and
//! feeds each result back into the proxy's completion handlers.
//!
//! ```rust,ignore
//! static PUMP: CalloutPump = CalloutPump::new();
//! static AREAS: [MemoryArea; 2] = [MemoryArea::plain(), MemoryArea::callout(&PUMP)];
//!
//! async fn storage_task(mut driver: impl AsyncMemoryDriver) {
//!     loop {
//!         wait_for_work().await;
//!         PUMP.pump(&mut driver, &PROXY).await;
//!     }
//! }
//! ```

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use async_trait::async_trait;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use spin::Mutex;

use crate::callout::CalloutDriver;
use crate::io::{Reader, Writer};
use crate::memory::MemoryIo;
use crate::proxy::MemoryProxy;
use crate::{Error, Result};

/// Trait for accessing memory through an async driver.
#[async_trait(?Send)]
pub trait AsyncMemoryDriver {
    /// Read `buf.len()` bytes at `addr`
    async fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `addr`
    async fn write(&mut self, addr: u32, data: &[u8]) -> Result<()>;
}

/// [`AsyncMemoryDriver`] implementation using [`crate::io::Reader`] and
/// [`crate::io::Writer`] traits.
pub struct ReaderWriterDriver<'a, R: Reader, W: Writer> {
    reader: &'a mut R,
    writer: &'a mut W,
}

impl<'a, R: Reader, W: Writer> ReaderWriterDriver<'a, R, W> {
    /// Create new instance
    pub fn new(reader: &'a mut R, writer: &'a mut W) -> Self {
        Self { reader, writer }
    }
}

#[async_trait(?Send)]
impl<R: Reader, W: Writer> AsyncMemoryDriver for ReaderWriterDriver<'_, R, W> {
    async fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.reader.read(addr, buf).await.map_err(|e| {
            debug!("Reader error at {addr:#010X}: {e:?}");
            Error::Driver
        })
    }

    async fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.writer.write(addr, data).await.map_err(|e| {
            debug!("Writer error at {addr:#010X}: {e:?}");
            Error::Driver
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingOp {
    Read { addr: u32, len: usize },
    Write { addr: u32, data: Vec<u8> },
}

/// Callout driver which defers every operation to an
/// [`AsyncMemoryDriver`].
pub struct CalloutPump {
    pending: Mutex<Option<PendingOp>>,
}

impl CalloutPump {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(None),
        }
    }

    /// Whether an operation is waiting to be pumped.
    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Perform recorded operations on `driver`, completing each into
    /// `proxy`, until none is left.  Returns the number performed.
    ///
    /// A bit modify issues its write from the read completion, so is
    /// performed in full by one call.
    pub async fn pump<D: AsyncMemoryDriver, M: MemoryIo, const N: usize, const C: usize>(
        &self,
        driver: &mut D,
        proxy: &MemoryProxy<'_, M, N, C>,
    ) -> usize {
        let mut performed = 0;
        loop {
            // The lock is never held across an await, or into the proxy.
            let op = self.pending.lock().take();
            let Some(op) = op else {
                break;
            };
            performed += 1;
            match op {
                PendingOp::Read { addr, len } => {
                    let mut buf = vec![0u8; len];
                    let result = driver.read(addr, &mut buf).await;
                    proxy.on_read_complete(result.map(|()| buf.as_slice()));
                }
                PendingOp::Write { addr, data } => {
                    let result = driver.write(addr, &data).await;
                    proxy.on_write_complete(result);
                }
            }
        }
        performed
    }

    fn record(&self, op: PendingOp) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            warn!("Callout issued with an operation already pending");
            return Err(Error::Busy);
        }
        *pending = Some(op);
        Ok(())
    }
}

impl CalloutDriver for CalloutPump {
    fn async_read(&self, addr: u32, len: usize) -> Result<()> {
        self.record(PendingOp::Read { addr, len })
    }

    fn async_write(&self, addr: u32, data: &[u8]) -> Result<()> {
        self.record(PendingOp::Write {
            addr,
            data: data.to_vec(),
        })
    }
}
