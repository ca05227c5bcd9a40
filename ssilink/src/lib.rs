//! # ssilink - Host Side of a Streaming Serial Link
//!
//! ssilink drives a synchronous full-duplex serial link (SPI-like) to a
//! remote microcontroller using a streaming framing protocol with
//! credit-based flow control:
//!
//! - **Framing**: control/status byte plus a 1- or 2-byte length field
//! - **Full duplex**: inbound payload rides along with outbound frames
//! - **Credit**: the remote reports its free receive space in every status byte
//! - **Wake handshake**: REQUEST/RESPONSE lines with bounded polling
//! - **Byte-stream sessions**: non-blocking read/write over staging rings
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Client (Session read / write)               │
//! ├─────────────────────────────────────────────────────────┤
//! │        Staging Rings (read ring)   (write ring)          │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Scheduler (worker)                    │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────┐   │
//! │  │  Handshake  │ │ Active loop │ │ IRQ gate        │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Transfer Engine                       │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────┐   │
//! │  │ Frame codec │ │   Credit    │ │  Inbound carry  │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │            Transport (exchange) + Signals (lines)        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use ssilink::{DeviceBuilder, LinkConfig, StdDelay};
//!
//! let device = DeviceBuilder::new(LinkConfig::default())
//!     .consumer(|chunk: &[u8]| println!("{} bytes in", chunk.len()))
//!     .recovery(|| reset_mcu())
//!     .build(spi, lines, StdDelay)?;
//!
//! let session = device.open()?;
//! session.write(b"Hello, MCU!")?;
//!
//! let mut buf = [0u8; 1024];
//! let n = session.read(&mut buf)?;
//! ```

#![deny(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod core;
pub mod device;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod scheduler;
pub mod sim;
pub mod stats;
pub mod transport;

// Re-export commonly used types
pub use crate::core::{ControlByte, CreditTracker, StatusByte, StreamProtocol, MAX_CREDIT};
pub use config::{Duplex, HandshakeConfig, LengthWidth, LinkConfig, OverflowPolicy};
pub use device::{Device, DeviceBuilder, Interest, Readiness, Session};
pub use engine::{PayloadSink, TransferEngine};
pub use error::{Error, Result};
pub use scheduler::{IrqHandle, Recovery, WorkItem};
pub use stats::LinkStats;
pub use transport::{Delay, NoDelay, Signals, StdDelay, Transport};

/// Largest frame with a 1-byte length field, framing included.
pub const MIN_FRAME_LEN: usize = 254;

/// Largest frame with a 2-byte length field, framing included.
pub const MAX_FRAME_LEN: usize = 8192;

/// Size of each exchange buffer.
pub const EXCHANGE_BUF_LEN: usize = MAX_FRAME_LEN;

/// Default capacity of each staging ring.
pub const DEFAULT_RING_SIZE: usize = 32 * 1024;
