//! Plain memory access and the memory area table.
//!
//! Every request names a memory area by index.  The area decides how the
//! request's address is reached: directly over the memory bus, through a
//! [`MemoryIo`] implementation, or through a vendor [`CalloutDriver`].
//! Areas may also restrict the address window and the access mode.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::ops::Range;

use bitflags::bitflags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::callout::CalloutDriver;
use crate::{Error, Result};

/// Trait for synchronous access to plain memory.
///
/// Plain memory access cannot fail; range and permission checks happen
/// against the [`MemoryArea`] before an implementation is called.
pub trait MemoryIo {
    /// Bulk read from the absolute address `addr`
    fn read_bulk(&self, addr: u32, buf: &mut [u8]);

    /// Bulk write to the absolute address `addr`
    fn write_bulk(&self, addr: u32, data: &[u8]);

    /// Single byte read
    fn read_u8(&self, addr: u32) -> u8 {
        let mut byte = [0u8; 1];
        self.read_bulk(addr, &mut byte);
        byte[0]
    }

    /// Single byte write
    fn write_u8(&self, addr: u32, value: u8) {
        self.write_bulk(addr, &[value]);
    }
}

impl<T: MemoryIo + ?Sized> MemoryIo for &T {
    fn read_bulk(&self, addr: u32, buf: &mut [u8]) {
        (**self).read_bulk(addr, buf)
    }

    fn write_bulk(&self, addr: u32, data: &[u8]) {
        (**self).write_bulk(addr, data)
    }
}

/// Memory I/O implementation using direct access to the local address
/// space.  Typically used on the target.
#[derive(Clone, Copy)]
pub struct RamMemoryIo {
    _private: (),
}

impl RamMemoryIo {
    /// Create a new RamMemoryIo instance.
    ///
    /// ```rust,ignore
    /// static PROXY: MemoryProxy<'static, RamMemoryIo, 256, 64> =
    ///     MemoryProxy::new(unsafe { RamMemoryIo::new() }, &AREAS, &RING, &DISPATCHER, &RUNTIME);
    /// ```
    ///
    /// # Safety
    ///
    /// Every address reaching this instance, through the memory area table,
    /// must be valid for volatile byte access for the requested length.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl MemoryIo for RamMemoryIo {
    fn read_bulk(&self, addr: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            let ptr = (addr as usize + i) as *const u8;
            // SAFETY: address validity is the constructor's contract.
            *byte = unsafe { core::ptr::read_volatile(ptr) };
        }
    }

    fn write_bulk(&self, addr: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let ptr = (addr as usize + i) as *mut u8;
            // SAFETY: address validity is the constructor's contract.
            unsafe { core::ptr::write_volatile(ptr, *byte) };
        }
    }
}

bitflags! {
    /// Access modes a memory area permits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ  = 0x01;
        const WRITE = 0x02;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// How a memory area is reached.
#[derive(Clone, Copy)]
pub enum Backing<'a> {
    /// Over the memory bus, synchronously
    Plain,
    /// Through a vendor driver, asynchronously
    Callout(&'a dyn CalloutDriver),
}

impl core::fmt::Debug for Backing<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Backing::Plain => f.write_str("Plain"),
            Backing::Callout(_) => f.write_str("Callout"),
        }
    }
}

/// One entry of the memory area table.
#[derive(Debug, Clone)]
pub struct MemoryArea<'a> {
    pub backing: Backing<'a>,
    /// Permitted address window, `None` for unrestricted
    pub range: Option<Range<u32>>,
    pub access: Access,
}

impl<'a> MemoryArea<'a> {
    /// Unrestricted plain memory.
    pub const fn plain() -> Self {
        Self {
            backing: Backing::Plain,
            range: None,
            access: Access::READ_WRITE,
        }
    }

    /// Unrestricted memory behind a callout driver.
    pub const fn callout(driver: &'a dyn CalloutDriver) -> Self {
        Self {
            backing: Backing::Callout(driver),
            range: None,
            access: Access::READ_WRITE,
        }
    }

    /// Restrict the area to `range`.
    pub const fn within(mut self, range: Range<u32>) -> Self {
        self.range = Some(range);
        self
    }

    /// Restrict the area's access modes.
    pub const fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Check that `len` bytes at `addr` may be accessed with `access`.
    pub fn check(&self, addr: u32, len: usize, access: Access) -> Result<()> {
        if !self.access.contains(access) {
            warn!("Access {access:?} not permitted at {addr:#010X}");
            return Err(Error::AccessDenied);
        }
        if let Some(range) = &self.range {
            let end = addr as u64 + len as u64;
            if addr < range.start || end > range.end as u64 {
                warn!(
                    "Access {addr:#010X}+{len} outside area {:#010X}..{:#010X}",
                    range.start, range.end
                );
                return Err(Error::AccessDenied);
            }
        }
        Ok(())
    }
}

/// Look up a memory area.  An invalid index is a configuration error.
pub(crate) fn area<'t, 'a>(areas: &'t [MemoryArea<'a>], index: usize) -> &'t MemoryArea<'a> {
    assert!(
        index < areas.len(),
        "memory area {index} not configured ({} areas)",
        areas.len()
    );
    &areas[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_area_allows_everything() {
        let area = MemoryArea::plain();
        assert_eq!(area.check(0xFFFF_FFF0, 16, Access::READ_WRITE), Ok(()));
    }

    #[test]
    fn range_is_enforced_at_both_ends() {
        let area = MemoryArea::plain().within(0x2000_0000..0x2000_0100);
        assert_eq!(area.check(0x2000_0000, 0x100, Access::READ), Ok(()));
        assert_eq!(
            area.check(0x1FFF_FFFF, 1, Access::READ),
            Err(Error::AccessDenied)
        );
        assert_eq!(
            area.check(0x2000_00FF, 2, Access::READ),
            Err(Error::AccessDenied)
        );
    }

    #[test]
    fn read_only_area_refuses_writes() {
        let area = MemoryArea::plain().with_access(Access::READ);
        assert_eq!(area.check(0, 4, Access::READ), Ok(()));
        assert_eq!(area.check(0, 4, Access::WRITE), Err(Error::AccessDenied));
        assert_eq!(
            area.check(0, 4, Access::READ_WRITE),
            Err(Error::AccessDenied)
        );
    }

    #[test]
    #[should_panic(expected = "not configured")]
    fn bad_area_index_is_fatal() {
        let areas = [MemoryArea::plain()];
        let _ = area(&areas, 1);
    }
}
