//! Proxy and callout state machines.
//!
//! Both are plain atomics, accessed with sequentially-consistent ordering so
//! that a successful acquire on one core is visible before any byte of the
//! staging buffer is touched, and a completion's buffer writes are visible
//! to whoever later observes `Ready`.  Nothing here ever blocks; callers may
//! be interrupt handlers.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{AtomicU8, Ordering};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Ownership phase of the staging buffer.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ProxyPhase {
    /// No transaction owns the buffer
    #[default]
    Available = 0,
    /// A transaction owns the buffer
    Busy = 1,
    /// A result is waiting in the buffer for the engine
    Ready = 2,
}

impl From<u8> for ProxyPhase {
    fn from(value: u8) -> Self {
        match value {
            0 => ProxyPhase::Available,
            2 => ProxyPhase::Ready,
            _ => ProxyPhase::Busy,
        }
    }
}

const PHASE_MASK: u8 = 0x03;
const INTERRUPTED: u8 = 0x80;

fn phase_of(word: u8) -> ProxyPhase {
    ProxyPhase::from(word & PHASE_MASK)
}

/// `Available`/`Busy`/`Ready` plus the `Interrupted` latch.
///
/// The latch shares a byte with the phase, and is only ever set while the
/// phase is `Busy`, so it cannot outlive the transaction it interrupted.
pub struct ProxyState(AtomicU8);

impl ProxyState {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self(AtomicU8::new(ProxyPhase::Available as u8))
    }

    pub fn phase(&self) -> ProxyPhase {
        phase_of(self.0.load(Ordering::SeqCst))
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst) & INTERRUPTED != 0
    }

    /// Take ownership of the proxy.
    ///
    /// `Available → Busy`.  If another transaction is running, latch
    /// `Interrupted` so that it finishes to `Available` and return `false`.
    /// If a result is waiting to be read, return `false` and leave it.
    pub fn try_acquire(&self) -> bool {
        if self
            .0
            .compare_exchange(
                ProxyPhase::Available as u8,
                ProxyPhase::Busy as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            return true;
        }

        // The owner may release between the failed exchange and here, in
        // which case there is nothing left to interrupt.
        let latched = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                (phase_of(word) == ProxyPhase::Busy && word & INTERRUPTED == 0)
                    .then_some(word | INTERRUPTED)
            })
            .is_ok();
        if latched {
            debug!("Proxy busy, latching interrupt");
        }
        false
    }

    /// End the running transaction, returning the phase entered.
    ///
    /// An interrupted transaction always ends `Available`, dropping its
    /// result.
    pub fn release(&self, had_pending_result: bool) -> ProxyPhase {
        let next = |word: u8| {
            if word & INTERRUPTED != 0 || !had_pending_result {
                ProxyPhase::Available
            } else {
                ProxyPhase::Ready
            }
        };
        // Retries only if a contender latches concurrently.
        let (Ok(old) | Err(old)) = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                Some(next(word) as u8)
            });
        if old & INTERRUPTED != 0 {
            debug!("Interrupted transaction finished, result discarded");
        }
        next(old)
    }

    /// Result has been read: `Ready → Available`.
    pub fn consume(&self) -> bool {
        self.0
            .compare_exchange(
                ProxyPhase::Ready as u8,
                ProxyPhase::Available as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

/// Whether a call into a callout driver is outstanding, and which.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CalloutPhase {
    #[default]
    Idle = 0,
    AwaitingRead = 1,
    AwaitingWrite = 2,
}

impl From<u8> for CalloutPhase {
    fn from(value: u8) -> Self {
        match value {
            1 => CalloutPhase::AwaitingRead,
            2 => CalloutPhase::AwaitingWrite,
            _ => CalloutPhase::Idle,
        }
    }
}

/// Tracks the outstanding callout, so that late or duplicate completions
/// can be recognised and ignored.
pub struct CalloutState(AtomicU8);

impl CalloutState {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self(AtomicU8::new(CalloutPhase::Idle as u8))
    }

    pub fn phase(&self) -> CalloutPhase {
        CalloutPhase::from(self.0.load(Ordering::SeqCst))
    }

    pub fn is_awaiting(&self) -> bool {
        self.phase() != CalloutPhase::Idle
    }

    /// Mark a callout as issued.  Must happen before the driver is called,
    /// as the driver may complete from within the call.
    pub fn arm(&self, awaiting: CalloutPhase) {
        debug_assert_ne!(awaiting, CalloutPhase::Idle);
        self.0.store(awaiting as u8, Ordering::SeqCst);
    }

    /// Claim the outstanding completion of kind `awaiting`.  Returns
    /// `false` if there was none, so that only one handler ever acts on a
    /// completion.
    pub fn disarm(&self, awaiting: CalloutPhase) -> bool {
        self.0
            .compare_exchange(
                awaiting as u8,
                CalloutPhase::Idle as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}
