//! Remote receive-buffer credit derived from the status byte.
//!
//! # Status Byte
//!
//! ```text
//!   7      6..5       4..3        2..0
//! +----+----------+------------+-------+
//! | PE | reserved | size class | count |
//! +----+----------+------------+-------+
//! ```
//!
//! The remote side advertises `SIZE_TABLE[class] * count` free bytes in its
//! receive ring. The value is a snapshot taken when the exchange completed;
//! the remote keeps draining its ring independently, so it is only ever a
//! throttling hint.

use log::warn;

/// Block size for each size class.
pub const SIZE_TABLE: [usize; 4] = [32, 256, 2 * 1024, 16 * 1024];

const COUNT_MASK: u8 = 0x07;
const CLASS_SHIFT: u8 = 3;
const CLASS_MASK: u8 = 0x18;
const PENDING_ERROR_MASK: u8 = 0x80;

/// Largest credit a status byte can express. Assumed at open.
pub const MAX_CREDIT: usize = SIZE_TABLE[3] * COUNT_MASK as usize;

/// A decoded status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusByte(u8);

impl StatusByte {
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Builds a status byte. `class` and `count` are truncated to their fields.
    pub const fn new(class: u8, count: u8, pending_error: bool) -> Self {
        let mut bits = ((class << CLASS_SHIFT) & CLASS_MASK) | (count & COUNT_MASK);
        if pending_error {
            bits |= PENDING_ERROR_MASK;
        }
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn size_class(&self) -> usize {
        ((self.0 & CLASS_MASK) >> CLASS_SHIFT) as usize
    }

    pub const fn block_count(&self) -> usize {
        (self.0 & COUNT_MASK) as usize
    }

    /// Remote buffer pressure was flagged.
    pub const fn pending_error(&self) -> bool {
        self.0 & PENDING_ERROR_MASK != 0
    }

    pub const fn available(&self) -> usize {
        SIZE_TABLE[self.size_class()] * self.block_count()
    }
}

/// Host-side estimate of remote receive headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditTracker {
    available: usize,
    last_status: Option<StatusByte>,
}

impl CreditTracker {
    pub const fn new() -> Self {
        Self {
            available: MAX_CREDIT,
            last_status: None,
        }
    }

    /// Returns the current credit in bytes.
    #[inline]
    pub const fn available(&self) -> usize {
        self.available
    }

    pub const fn last_status(&self) -> Option<StatusByte> {
        self.last_status
    }

    /// Recomputes credit from the status byte of the last exchange.
    pub fn update(&mut self, status: StatusByte) -> usize {
        self.available = status.available();
        self.last_status = Some(status);

        if status.pending_error() {
            warn!(
                "Remote buffer pressure: status 0x{:02x} (PE), avail {}",
                status.bits(),
                self.available
            );
        }

        self.available
    }

    /// Back to the assumed maximum, as at open.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for CreditTracker {
    fn default() -> Self {
        Self::new()
    }
}
