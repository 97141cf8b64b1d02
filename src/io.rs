//! Async I/O traits for accessing target memory, flash, EEPROM, etc.
//!
//! These traits describe a store which is read and written asynchronously,
//! such as flash behind a storage task, or a target's memory reached over a
//! debug probe.  [`crate::callout::ReaderWriterDriver`] adapts a pair of
//! them to serve a callout memory area.
//!
//! # Address Space
//!
//! The methods use absolute addresses as they appear in the target's
//! memory map - the same addresses the calibration engine puts in its
//! requests.  The implementation is responsible for translating these to
//! whatever internal representation it uses (sector offsets, probe
//! commands, etc.).

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

/// Reader trait.
pub trait Reader {
    /// The error type returned by read operations.
    ///
    /// This allows implementations to use their own error types.
    type Error: core::fmt::Debug;

    /// Read bytes at the specified absolute address.
    ///
    /// # Arguments
    ///
    /// * `addr` - The absolute address to read from (e.g., `0x80000200`)
    /// * `buf` - Buffer to fill with the read data
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not backed by the store, or the
    /// underlying read fails.  A failed read may have partially filled
    /// `buf`.
    fn read(
        &mut self,
        addr: u32,
        buf: &mut [u8],
    ) -> impl core::future::Future<Output = Result<(), Self::Error>> + Send;
}

/// Writer trait.
pub trait Writer {
    /// The error type returned by write operations.
    type Error: core::fmt::Debug;

    /// Write bytes at the specified absolute address.
    ///
    /// # Arguments
    ///
    /// * `addr` - The absolute address to write to (e.g., `0x80000200`)
    /// * `data` - Data to write
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not backed by the store, is
    /// write protected, or the underlying write fails.
    fn write(
        &mut self,
        addr: u32,
        data: &[u8],
    ) -> impl core::future::Future<Output = Result<(), Self::Error>> + Send;
}
