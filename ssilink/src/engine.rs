//! Transfer engine: single exchanges on the link.
//!
//! The engine owns the exchange buffers, both stream protocols and the
//! credit tracker. It is driven from the scheduler's worker only, so none of
//! its state is locked.

use core::cmp::{max, min};
use core::fmt::Write as _;
use std::sync::Arc;

use log::{debug, log_enabled, trace, warn, Level};

use crate::config::LinkConfig;
use crate::core::{
    clear_length, decode_length, encode_length, CreditTracker, Direction, StatusByte,
    StreamProtocol,
};
use crate::error::{Error, Result};
use crate::stats::Counters;
use crate::transport::Transport;
use crate::EXCHANGE_BUF_LEN;

/// Consumer of decoded inbound payload.
///
/// Called once per decoded chunk with exactly the bytes the frame carried.
pub trait PayloadSink {
    fn deliver(&mut self, payload: &[u8]);
}

impl<F: FnMut(&[u8])> PayloadSink for F {
    fn deliver(&mut self, payload: &[u8]) {
        self(payload)
    }
}

type ExchangeBuf = heapless::Vec<u8, EXCHANGE_BUF_LEN>;

fn zeroed() -> ExchangeBuf {
    let mut buf = ExchangeBuf::new();
    // Requested length equals the capacity.
    let _ = buf.resize(EXCHANGE_BUF_LEN, 0);
    buf
}

pub struct TransferEngine<T> {
    transport: T,

    tx_proto: StreamProtocol,
    rx_proto: StreamProtocol,

    /// Outbound frame: control byte, length field, payload.
    tx_buf: ExchangeBuf,

    /// Inbound frame: status byte, length field, payload.
    rx_buf: ExchangeBuf,

    credit: CreditTracker,

    /// Inbound bytes advertised during a full-duplex transmit but not yet
    /// clocked in.
    inbound_carry: usize,

    counters: Arc<Counters>,
}

impl<T: Transport> TransferEngine<T> {
    pub fn new(transport: T, config: &LinkConfig, counters: Arc<Counters>) -> Self {
        Self {
            transport,
            tx_proto: StreamProtocol::new(Direction::Transmit, config),
            rx_proto: StreamProtocol::new(Direction::Receive, config),
            tx_buf: zeroed(),
            rx_buf: zeroed(),
            credit: CreditTracker::new(),
            inbound_carry: 0,
            counters,
        }
    }

    /// Rebuilds both stream protocols and forgets all link state.
    pub fn reconfigure(&mut self, config: &LinkConfig) {
        self.tx_proto = StreamProtocol::new(Direction::Transmit, config);
        self.rx_proto = StreamProtocol::new(Direction::Receive, config);
        self.credit.reset();
        self.inbound_carry = 0;

        debug!(
            "tx ctrl {:02X}: total {} = len {} + fc {} + cmd 1",
            self.tx_proto.ctrl_byte.bits(),
            self.tx_proto.ctrl_len,
            self.tx_proto.length_len,
            self.tx_proto.fc_len
        );
        debug!(
            "rx ctrl {:02X}: total {} = len {} + fc {} + stat 1",
            self.rx_proto.ctrl_byte.bits(),
            self.rx_proto.ctrl_len,
            self.rx_proto.length_len,
            self.rx_proto.fc_len
        );
    }

    pub fn tx_protocol(&self) -> &StreamProtocol {
        &self.tx_proto
    }

    /// Current credit estimate in bytes.
    pub fn credit(&self) -> usize {
        self.credit.available()
    }

    pub fn credit_tracker(&self) -> &CreditTracker {
        &self.credit
    }

    pub fn inbound_carry(&self) -> usize {
        self.inbound_carry
    }

    /// Payload area of the next transmit frame.
    ///
    /// The caller copies the outbound bytes here before [`transmit`](Self::transmit).
    pub fn staging_area(&mut self) -> &mut [u8] {
        let start = self.tx_proto.ctrl_len;
        let end = start + self.tx_proto.payload_capacity();
        &mut self.tx_buf[start..end]
    }

    /// Payload fetched by the last successful [`receive`](Self::receive).
    pub fn payload(&self, length: usize) -> &[u8] {
        let start = self.rx_proto.ctrl_len;
        &self.rx_buf[start..start + length]
    }

    /// Sends `length` staged bytes in one exchange.
    ///
    /// In full duplex the same exchange carries inbound payload, which is
    /// handed to `sink` before returning. Returns the inbound byte count.
    pub fn transmit(&mut self, length: usize, sink: &mut dyn PayloadSink) -> Result<usize> {
        let proto = self.tx_proto;
        let capacity = proto.payload_capacity();
        if length > capacity {
            return Err(Error::BufferFull);
        }

        let exchanged = max(length, self.inbound_carry);

        self.tx_buf[0] = proto.ctrl_byte.bits();
        if proto.has_length() {
            encode_length(proto.ctrl_byte, &mut self.tx_buf[1..], length as u16);
        }
        self.tx_buf[proto.ctrl_len + length..proto.ctrl_len + exchanged].fill(0);

        debug!(
            "tx {} bytes (exchange {}), carry {}",
            length, exchanged, self.inbound_carry
        );

        let result = self.exchange(exchanged + proto.ctrl_len);
        self.update_credit();

        if let Err(e) = result {
            Counters::add(&self.counters.tx_failures, 1);
            return Err(e);
        }

        Counters::add(&self.counters.frames_sent, 1);
        Counters::add(&self.counters.bytes_sent, length);

        if !proto.is_full_duplex() {
            return Ok(0);
        }

        let mut inbound = decode_length(proto.ctrl_byte, &self.rx_buf[1..]) as usize;
        if inbound > capacity {
            warn!(
                "Full-duplex inbound length {} overflows frame payload {}",
                inbound, capacity
            );
            inbound = capacity;
        }

        // Only `exchanged` payload bytes were clocked in; the rest stays
        // on the remote side for the next exchange.
        let delivered = min(inbound, exchanged);
        self.inbound_carry = inbound - delivered;

        if delivered > 0 {
            let start = proto.ctrl_len;
            sink.deliver(&self.rx_buf[start..start + delivered]);
            Counters::add(&self.counters.bytes_received, delivered);
        }

        Ok(delivered)
    }

    /// Probes for inbound payload and fetches it.
    ///
    /// Returns the payload length, readable through [`payload`](Self::payload).
    /// An empty probe is [`Error::NoData`], not an empty success.
    pub fn receive(&mut self) -> Result<usize> {
        let proto = self.rx_proto;

        self.tx_buf[0] = proto.ctrl_byte.bits();
        clear_length(proto.ctrl_byte, &mut self.tx_buf[1..]);
        self.rx_buf[0] = 0;

        if let Err(e) = self.exchange(proto.ctrl_len) {
            Counters::add(&self.counters.rx_failures, 1);
            return Err(e);
        }
        self.update_credit();

        let advertised = decode_length(proto.ctrl_byte, &self.rx_buf[1..]) as usize;
        debug!("rx probe: len {}", advertised);
        if advertised == 0 {
            return Err(Error::NoData);
        }

        let mut length = min(proto.payload_capacity(), advertised);
        self.tx_buf[1..proto.ctrl_len + length].fill(0);

        if let Err(e) = self.exchange(length + proto.ctrl_len) {
            Counters::add(&self.counters.rx_failures, 1);
            return Err(e);
        }

        let confirmed = decode_length(proto.ctrl_byte, &self.rx_buf[1..]) as usize;
        if confirmed < length {
            debug!("rx fetch: probe said {}, frame says {}", length, confirmed);
            length = confirmed;
        }

        self.inbound_carry = 0;
        Counters::add(&self.counters.frames_received, 1);
        Counters::add(&self.counters.bytes_received, length);

        Ok(length)
    }

    fn update_credit(&mut self) {
        let status = StatusByte::from_bits(self.rx_buf[0]);
        if status.pending_error() {
            Counters::add(&self.counters.pending_errors, 1);
        }
        let avail = self.credit.update(status);
        trace!("status 0x{:02x}: credit {}", status.bits(), avail);
    }

    fn exchange(&mut self, len: usize) -> Result<()> {
        dump_frame("w", &self.tx_buf[..len]);

        let result = self
            .transport
            .exchange(&self.tx_buf[..len], &mut self.rx_buf[..len]);

        match result {
            Ok(()) => dump_frame("r", &self.rx_buf[..len]),
            Err(e) => debug!("Exchange error for cmd 0x{:02x}: {}", self.tx_buf[0], e),
        }
        result
    }
}

/// Hex dump of one direction of an exchange, 32 bytes per line.
fn dump_frame(dir: &str, data: &[u8]) {
    if !log_enabled!(Level::Trace) {
        return;
    }

    for (i, chunk) in data.chunks(32).enumerate() {
        let mut line = String::with_capacity(chunk.len() * 3);
        for byte in chunk {
            let _ = write!(line, "{:02X} ", byte);
        }
        if i == 0 {
            trace!("{} {:5}: {}", dir, data.len(), line);
        } else {
            trace!("{}        {}", dir, line);
        }
    }
}
