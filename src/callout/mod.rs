//! Asynchronous callout path - memory owned by a vendor storage driver.
//!
//! A callout driver only offers fire-and-forget read and write calls.  The
//! proxy issues one, records that a completion is outstanding, and returns
//! without blocking.  The driver later reports the result by calling
//! [`MemoryProxy::on_read_complete()`] or
//! [`MemoryProxy::on_write_complete()`], from whatever context it runs in -
//! an ISR, another partition's task, or even from inside the issuing call.
//!
//! ```text
//!  Upload:     IssueRead  -> OnReadComplete  -> release + notify
//!  Download:   IssueWrite -> OnWriteComplete -> release + notify
//!  ModifyBits: IssueRead  -> OnReadComplete  -> bitfield -> IssueWrite
//!                         -> OnWriteComplete -> release + notify
//! ```
//!
//! Any failed completion ends the transaction with no result and no
//! notification.  A completion arriving with nothing outstanding is stale
//! and ignored.
//!
//! [`MemoryProxy::on_read_complete()`]: crate::proxy::MemoryProxy::on_read_complete
//! [`MemoryProxy::on_write_complete()`]: crate::proxy::MemoryProxy::on_write_complete

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "async")]
pub mod futures;

#[cfg(feature = "async")]
pub use futures::{AsyncMemoryDriver, CalloutPump, ReaderWriterDriver};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::memory::{self, Backing, MemoryIo};
use crate::proxy::{MemoryProxy, Outcome};
use crate::request::{ProxyRequest, RequestKind};
use crate::state::CalloutPhase;
use crate::{Error, Result};

/// Vendor storage driver, accessed only via asynchronous issue/completion.
pub trait CalloutDriver: Sync {
    /// Start reading `len` bytes at `addr`.
    ///
    /// On success the driver must later call
    /// [`crate::proxy::MemoryProxy::on_read_complete()`] exactly once with
    /// the data read, or with an error.  Returning an error here means
    /// the read was never started and no completion will follow.
    fn async_read(&self, addr: u32, len: usize) -> Result<()>;

    /// Start writing `data` to `addr`.  `data` is only valid for the
    /// duration of the call.
    ///
    /// On success the driver must later call
    /// [`crate::proxy::MemoryProxy::on_write_complete()`] exactly once.
    fn async_write(&self, addr: u32, data: &[u8]) -> Result<()>;
}

impl<M: MemoryIo, const N: usize, const C: usize> MemoryProxy<'_, M, N, C> {
    // Start the first phase of `request` on `driver`.  Runs with the proxy
    // held `Busy`.
    pub(crate) fn issue(&self, driver: &dyn CalloutDriver, request: ProxyRequest) -> Outcome {
        // SAFETY: the proxy is held `Busy` and no callout is outstanding, so
        // no completion handler can be reading the request.
        unsafe { *self.request.get() = Some(request) };
        match request.kind {
            RequestKind::Download => self.issue_write(driver, &request),
            _ => self.issue_read(driver, &request),
        }
    }

    fn issue_read(&self, driver: &dyn CalloutDriver, request: &ProxyRequest) -> Outcome {
        trace!("Callout read {:#010X} ({} bytes)", request.address, request.size);
        self.callout.arm(CalloutPhase::AwaitingRead);
        match driver.async_read(request.address, request.size) {
            Ok(()) => Outcome::Pending,
            Err(e) => {
                error!("Callout read at {:#010X} refused: {e:?}", request.address);
                self.refused(CalloutPhase::AwaitingRead, e)
            }
        }
    }

    fn issue_write(&self, driver: &dyn CalloutDriver, request: &ProxyRequest) -> Outcome {
        trace!("Callout write {:#010X} ({} bytes)", request.address, request.size);
        self.callout.arm(CalloutPhase::AwaitingWrite);
        // SAFETY: the proxy is held `Busy`, and the driver only borrows the
        // data for the duration of the call.
        let data = unsafe { self.staging.slice(0..request.size) };
        match driver.async_write(request.address, data) {
            Ok(()) => Outcome::Pending,
            Err(e) => {
                error!("Callout write at {:#010X} refused: {e:?}", request.address);
                self.refused(CalloutPhase::AwaitingWrite, e)
            }
        }
    }

    // An issue call the driver refused is a failed completion.
    fn refused(&self, awaiting: CalloutPhase, e: Error) -> Outcome {
        if self.callout.disarm(awaiting) {
            self.fail();
        }
        Outcome::Failed(e)
    }

    fn fail(&self) {
        // SAFETY: the completion has been claimed, nothing else holds the
        // request.
        unsafe { *self.request.get() = None };
        self.abort();
    }

    /// Read completion from the callout driver.
    ///
    /// `data` is what was read, and must be exactly the requested length.
    /// May be called from any context.  Stale or duplicate completions are
    /// ignored.
    pub fn on_read_complete(&self, data: Result<&[u8]>) {
        if !self.callout.disarm(CalloutPhase::AwaitingRead) {
            warn!("Stale read completion ignored");
            return;
        }
        // SAFETY: the completion has been claimed, so the request is ours.
        let Some(request) = (unsafe { *self.request.get() }) else {
            error!("Read completion with no request");
            self.abort();
            return;
        };

        let data = match data {
            Ok(data) if data.len() == request.size => data,
            Ok(data) => {
                error!(
                    "Callout read at {:#010X} returned {} bytes, expected {}",
                    request.address,
                    data.len(),
                    request.size
                );
                self.fail();
                return;
            }
            Err(e) => {
                error!("Callout read at {:#010X} failed: {e:?}", request.address);
                self.fail();
                return;
            }
        };

        // SAFETY: the proxy is still held `Busy` by this transaction.
        let staged = unsafe { self.staging.slice_mut(0..request.size) };
        staged.copy_from_slice(data);

        match request.kind {
            RequestKind::ModifyBits(modify) => {
                modify.apply_in_place(staged);
                let area = memory::area(self.areas, request.memory_area);
                let Backing::Callout(driver) = area.backing else {
                    unreachable!("bit modify read completed on a plain area");
                };
                // A refused write has already failed the transaction, and
                // the driver's caller has nobody to report it to.
                let _outcome = self.issue_write(driver, &request);
            }
            _ => self.finish(&request),
        }
    }

    /// Write completion from the callout driver.  May be called from any
    /// context.  Stale or duplicate completions are ignored.
    pub fn on_write_complete(&self, result: Result<()>) {
        if !self.callout.disarm(CalloutPhase::AwaitingWrite) {
            warn!("Stale write completion ignored");
            return;
        }
        // SAFETY: the completion has been claimed, so the request is ours.
        let Some(request) = (unsafe { *self.request.get() }) else {
            error!("Write completion with no request");
            self.abort();
            return;
        };
        match result {
            Ok(()) => self.finish(&request),
            Err(e) => {
                error!("Callout write at {:#010X} failed: {e:?}", request.address);
                self.fail();
            }
        }
    }

    fn finish(&self, request: &ProxyRequest) {
        // SAFETY: as for `fail()`.
        unsafe { *self.request.get() = None };
        trace!("Callout {:?} {:#010X} done", request.kind, request.address);
        self.complete(request);
    }
}
