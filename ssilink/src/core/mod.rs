//! Wire-level building blocks.
//!
//! - Frame: control byte, stream protocol parameters and the length codec
//! - Credit: status byte decoding into remote buffer headroom

mod credit;
mod frame;

pub use credit::{CreditTracker, StatusByte, MAX_CREDIT, SIZE_TABLE};
pub use frame::{
    clear_length, decode_length, encode_length, ControlByte, Direction, StreamProtocol,
};
