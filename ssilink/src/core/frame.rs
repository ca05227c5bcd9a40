//! Stream frame layout and the length field codec.
//!
//! Every exchange on the link is one frame. The host clocks out a control
//! byte, an optional length field and payload; in the same exchange the
//! remote side clocks back a status byte, its own length field and payload.
//!
//! # Frame Format
//!
//! ```text
//!            byte 0       bytes 1..=W          bytes W+1..
//!          +----------+-------------------+-------------------+
//!  host -> | control  | length (LE, W=1/2) | payload ...       |
//!          +----------+-------------------+-------------------+
//!  host <- | status   | length (LE, W=1/2) | payload ...       |
//!          +----------+-------------------+-------------------+
//! ```
//!
//! `W` is zero for transmit frames in half-duplex mode.
//!
//! # Control Byte
//!
//! ```text
//!   7       6        5       4        3      2..0
//! +-----+--------+------+--------+------+----------+
//! | DBG | DUPLEX | READ | LEN 2B |  FC  | reserved |
//! +-----+--------+------+--------+------+----------+
//! ```

use crate::config::{Duplex, LengthWidth, LinkConfig};
use crate::{MAX_FRAME_LEN, MIN_FRAME_LEN};

/// Control byte sent as the first byte of every exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlByte(u8);

impl ControlByte {
    /// Streaming mode, write transaction, half duplex, 1-byte length.
    pub const STREAM: Self = Self(0x00);

    /// Full-duplex transfers.
    pub const FULL_DUPLEX: Self = Self(0x40);

    /// Read transaction (cleared for writes).
    pub const READ: Self = Self(0x20);

    /// 2-byte length field (cleared for 1 byte).
    pub const LENGTH_2B: Self = Self(0x10);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Number of bytes in the length field this control byte announces.
    pub const fn length_width(&self) -> usize {
        if self.contains(Self::LENGTH_2B) { 2 } else { 1 }
    }
}

/// Reads the length field at the start of `data`.
pub fn decode_length(ctrl: ControlByte, data: &[u8]) -> u16 {
    if ctrl.contains(ControlByte::LENGTH_2B) {
        u16::from_le_bytes([data[0], data[1]])
    } else {
        data[0] as u16
    }
}

/// Writes `len` into the length field at the start of `data`.
///
/// With a 1-byte field only the low byte is kept.
pub fn encode_length(ctrl: ControlByte, data: &mut [u8], len: u16) {
    if ctrl.contains(ControlByte::LENGTH_2B) {
        data[..2].copy_from_slice(&len.to_le_bytes());
    } else {
        data[0] = len as u8;
    }
}

pub fn clear_length(ctrl: ControlByte, data: &mut [u8]) {
    encode_length(ctrl, data, 0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Transmit,
    Receive,
}

/// Per-direction stream protocol parameters, fixed for one open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProtocol {
    pub direction: Direction,
    pub ctrl_byte: ControlByte,
    /// Length field width on the wire (0, 1 or 2).
    pub length_len: usize,
    /// Flow-control field width. Always 0.
    pub fc_len: usize,
    /// Framing overhead: length + flow control + control/status byte.
    pub ctrl_len: usize,
    /// Largest exchange, framing included.
    pub frame_len: usize,
}

impl StreamProtocol {
    pub fn new(direction: Direction, config: &LinkConfig) -> Self {
        let mut ctrl_byte = ControlByte::STREAM;
        if config.duplex == Duplex::Full {
            ctrl_byte.insert(ControlByte::FULL_DUPLEX);
        }
        if config.length_width == LengthWidth::Two {
            ctrl_byte.insert(ControlByte::LENGTH_2B);
        }
        if direction == Direction::Receive {
            ctrl_byte.insert(ControlByte::READ);
        }

        let length_len = match (direction, config.duplex) {
            (Direction::Transmit, Duplex::Half) => 0,
            _ => config.length_width.bytes(),
        };
        let fc_len = 0;

        let frame_len = match config.length_width {
            LengthWidth::One => MIN_FRAME_LEN,
            LengthWidth::Two => MAX_FRAME_LEN,
        };

        Self {
            direction,
            ctrl_byte,
            length_len,
            fc_len,
            ctrl_len: length_len + fc_len + 1,
            frame_len,
        }
    }

    /// Payload bytes that fit in one frame.
    pub const fn payload_capacity(&self) -> usize {
        self.frame_len - self.ctrl_len
    }

    pub const fn has_length(&self) -> bool {
        self.length_len != 0
    }

    pub const fn is_full_duplex(&self) -> bool {
        self.ctrl_byte.contains(ControlByte::FULL_DUPLEX)
    }
}
