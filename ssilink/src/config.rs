//! Link configuration.
//!
//! Everything here is fixed for the lifetime of a [`Device`](crate::Device);
//! the per-direction stream protocols are derived from it at every open.

use core::time::Duration;

use crate::error::{Error, Result};
use crate::{DEFAULT_RING_SIZE, MAX_FRAME_LEN};

/// Width of the frame length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthWidth {
    /// 1-byte length, frames up to [`MIN_FRAME_LEN`](crate::MIN_FRAME_LEN).
    One,
    /// 2-byte little-endian length, frames up to [`MAX_FRAME_LEN`].
    Two,
}

impl LengthWidth {
    pub const fn bytes(self) -> usize {
        match self {
            LengthWidth::One => 1,
            LengthWidth::Two => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplex {
    /// Transmit frames carry no length field and no inbound payload.
    Half,
    /// Inbound payload rides along with every transmit exchange.
    Full,
}

/// What a client write does when the transmit ring cannot hold all of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Accept the prefix that fits and drop the rest.
    Truncate,
    /// Accept nothing and fail with [`Error::WouldBlock`].
    Reject,
}

/// REQUEST/RESPONSE wake handshake timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Polls of RESPONSE before giving up.
    pub max_polls: u32,
    /// Polls that use `poll_interval`; later polls use `slow_poll_interval`.
    pub fast_poll_limit: u32,
    pub poll_interval: Duration,
    pub slow_poll_interval: Duration,
    /// REQUEST is pulsed low then high every this many polls.
    pub retoggle_every: u32,
    pub retoggle_pulse: Duration,
}

impl HandshakeConfig {
    pub const fn new() -> Self {
        Self {
            max_polls: 100,
            fast_poll_limit: 100,
            poll_interval: Duration::from_millis(1),
            slow_poll_interval: Duration::from_millis(2),
            retoggle_every: 20,
            retoggle_pulse: Duration::from_millis(1),
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub length_width: LengthWidth,
    pub duplex: Duplex,
    /// Capacity of the inbound (client read) ring. Power of two.
    pub read_buf_size: usize,
    /// Capacity of the outbound (client write) ring. Power of two.
    pub write_buf_size: usize,
    pub write_overflow: OverflowPolicy,
    /// Pause inserted when the remote side reports no credit.
    pub credit_backoff: Duration,
    pub handshake: HandshakeConfig,
}

impl LinkConfig {
    pub fn new() -> Self {
        Self {
            length_width: LengthWidth::Two,
            duplex: Duplex::Full,
            read_buf_size: DEFAULT_RING_SIZE,
            write_buf_size: DEFAULT_RING_SIZE,
            write_overflow: OverflowPolicy::Truncate,
            credit_backoff: Duration::from_millis(1),
            handshake: HandshakeConfig::new(),
        }
    }

    pub fn with_length_width(mut self, width: LengthWidth) -> Self {
        self.length_width = width;
        self
    }

    pub fn with_duplex(mut self, duplex: Duplex) -> Self {
        self.duplex = duplex;
        self
    }

    pub fn with_buffer_sizes(mut self, read: usize, write: usize) -> Self {
        self.read_buf_size = read;
        self.write_buf_size = write;
        self
    }

    pub fn with_write_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.write_overflow = policy;
        self
    }

    pub fn with_credit_backoff(mut self, backoff: Duration) -> Self {
        self.credit_backoff = backoff;
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    /// Checks the invariants the ring buffers and scheduler rely on.
    pub fn validate(&self) -> Result<()> {
        if !self.read_buf_size.is_power_of_two() {
            return Err(Error::InvalidConfig("read buffer size must be a power of two"));
        }
        if !self.write_buf_size.is_power_of_two() {
            return Err(Error::InvalidConfig("write buffer size must be a power of two"));
        }
        if self.write_buf_size < MAX_FRAME_LEN {
            return Err(Error::InvalidConfig("write buffer smaller than a frame"));
        }
        if self.handshake.max_polls == 0 {
            return Err(Error::InvalidConfig("handshake needs at least one poll"));
        }
        if self.handshake.retoggle_every == 0 {
            return Err(Error::InvalidConfig("retoggle interval must be non-zero"));
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.length_width.bytes(), 2);
        assert_eq!(config.handshake.max_polls, 100);
        assert_eq!(config.handshake.retoggle_every, 20);
    }

    #[test]
    fn test_rejects_odd_ring_size() {
        let config = LinkConfig::new().with_buffer_sizes(3000, DEFAULT_RING_SIZE);
        assert_eq!(
            config.validate(),
            Err(Error::InvalidConfig("read buffer size must be a power of two"))
        );
    }

    #[test]
    fn test_rejects_tiny_write_ring() {
        let config = LinkConfig::new().with_buffer_sizes(1024, 1024);
        assert!(config.validate().is_err());
    }
}
