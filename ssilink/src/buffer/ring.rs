//! Staging ring buffer between byte-stream clients and frame transfers.
//!
//! Capacity is a power of two. `head` and `tail` run freely and are masked
//! on access, so the byte count is `head - tail` and the whole capacity is
//! usable.

use crate::error::{Error, Result};

/// A fixed-capacity byte FIFO.
///
/// Copies in and out are split into at most two segments at the wrap
/// boundary.
#[derive(Debug)]
pub struct RingBuffer {
    /// The underlying storage.
    buffer: Box<[u8]>,

    /// Write position (producer).
    head: usize,

    /// Read position (consumer).
    tail: usize,
}

impl RingBuffer {
    /// Creates an empty ring. `capacity` must be a power of two.
    pub fn new(capacity: usize) -> Result<Self> {
        if !capacity.is_power_of_two() {
            return Err(Error::InvalidConfig("ring capacity must be a power of two"));
        }
        Ok(Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        })
    }

    /// Returns the number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the number of bytes that can be written.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len()
    }

    #[inline]
    fn mask(&self, pos: usize) -> usize {
        pos & (self.capacity() - 1)
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Copies as much of `data` as fits.
    ///
    /// Returns the number of bytes written; `head` advances by exactly that.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let to_write = core::cmp::min(data.len(), self.remaining());
        if to_write == 0 {
            return 0;
        }

        let start = self.mask(self.head);
        let first_chunk = core::cmp::min(to_write, self.capacity() - start);
        self.buffer[start..start + first_chunk].copy_from_slice(&data[..first_chunk]);

        if to_write > first_chunk {
            let second_chunk = to_write - first_chunk;
            self.buffer[..second_chunk].copy_from_slice(&data[first_chunk..to_write]);
        }

        self.head = self.head.wrapping_add(to_write);
        to_write
    }

    /// Writes all of `data` or nothing.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.remaining() {
            return Err(Error::BufferFull);
        }

        self.write(data);
        Ok(())
    }

    /// Moves up to `buf.len()` bytes out of the ring.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.peek(buf);
        self.tail = self.tail.wrapping_add(n);
        n
    }

    /// Copies up to `buf.len()` bytes without consuming them.
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        let to_read = core::cmp::min(buf.len(), self.len());
        if to_read == 0 {
            return 0;
        }

        let start = self.mask(self.tail);
        let first_chunk = core::cmp::min(to_read, self.capacity() - start);
        buf[..first_chunk].copy_from_slice(&self.buffer[start..start + first_chunk]);

        if to_read > first_chunk {
            let second_chunk = to_read - first_chunk;
            buf[first_chunk..to_read].copy_from_slice(&self.buffer[..second_chunk]);
        }

        to_read
    }

    /// Consumes bytes without copying them.
    pub fn skip(&mut self, count: usize) -> usize {
        let to_skip = core::cmp::min(count, self.len());
        self.tail = self.tail.wrapping_add(to_skip);
        to_skip
    }
}
