//! Buffer management for the byte-stream side of the link.
//!
//! One [`RingBuffer`] per direction decouples client reads and writes from
//! frame-sized transfers.

mod ring;

pub use ring::RingBuffer;
