//! Bit modify engine.
//!
//! Changes selected bits of a 32-bit cell, as the XCP `MODIFY_BITS` command
//! does: the bits of the field selected by `shift` whose `and_mask` bit is 0
//! are cleared, then `xor_mask` is XORed into the field.
//!
//! ```text
//! clear = (!and_mask as u32) << shift
//! set   = (xor_mask as u32) << shift
//! v'    = (v & !clear) ^ set
//! ```
//!
//! This is a true read-modify-write, not a hardware atomic.  It is correct
//! because the proxy stays `Busy` from the read to the write-back, so no
//! other transaction can write the cell in between.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

/// Size of the cell a bit modify operates on.
pub const CELL_SIZE: usize = 4;

/// Parameters of a bit modify request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitModify {
    pub shift: u8,
    pub and_mask: u16,
    pub xor_mask: u16,
}

impl BitModify {
    pub const fn new(shift: u8, and_mask: u16, xor_mask: u16) -> Self {
        Self {
            shift,
            and_mask,
            xor_mask,
        }
    }

    /// Bits cleared before the XOR.
    pub fn clear_mask(&self) -> u32 {
        shifted(!self.and_mask, self.shift)
    }

    /// Bits toggled after the clear.
    pub fn set_mask(&self) -> u32 {
        shifted(self.xor_mask, self.shift)
    }

    pub fn apply(&self, value: u32) -> u32 {
        (value & !self.clear_mask()) ^ self.set_mask()
    }

    /// Apply to a cell staged little-endian in `cell`.
    pub fn apply_in_place(&self, cell: &mut [u8]) {
        assert_eq!(cell.len(), CELL_SIZE, "bit modify needs a 4 byte cell");
        let value = u32::from_le_bytes([cell[0], cell[1], cell[2], cell[3]]);
        cell.copy_from_slice(&self.apply(value).to_le_bytes());
    }
}

// Bits shifted out of the cell are lost, as on the wire.
fn shifted(mask: u16, shift: u8) -> u32 {
    (mask as u32).checked_shl(shift as u32).unwrap_or(0)
}
