//! In-memory remote MCU.
//!
//! [`SimulatedMcu`] speaks the remote side of the streaming protocol well
//! enough to drive the engine without hardware: it answers the handshake,
//! reports a scripted status byte, advertises and returns queued outbound
//! payload, and records what the host sent. Clones share one state, so a
//! test can keep a handle while the device owns another.

use core::cmp::min;
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;

use crate::core::{decode_length, encode_length, ControlByte, StatusByte, MAX_CREDIT, SIZE_TABLE};
use crate::error::{Error, Result};
use crate::scheduler::IrqHandle;
use crate::transport::{Delay, Signals, Transport};
use crate::{MAX_FRAME_LEN, MIN_FRAME_LEN};

/// Exchanges kept in the log before the oldest are dropped.
const EXCHANGE_LOG_LEN: usize = 4096;

/// One exchange as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRecord {
    pub tx: Vec<u8>,
    pub rx: Vec<u8>,
    pub ok: bool,
}

impl ExchangeRecord {
    pub fn is_read(&self) -> bool {
        self.tx
            .first()
            .is_some_and(|&b| ControlByte::from_bits(b).contains(ControlByte::READ))
    }
}

struct McuState {
    /// Payload waiting to go to the host. Non-empty drives DATA-READY.
    outbound: VecDeque<u8>,
    /// Payload the host wrote.
    received: Vec<u8>,
    echo: bool,
    status: StatusByte,
    status_script: VecDeque<StatusByte>,
    advertised_override: Option<u16>,
    fail_next: usize,
    fail_at: Vec<usize>,
    attempts: usize,
    unresponsive: bool,
    request: bool,
    exchanges: VecDeque<ExchangeRecord>,
    irq: Option<IrqHandle>,
}

impl McuState {
    fn next_status(&mut self) -> StatusByte {
        self.status_script.pop_front().unwrap_or(self.status)
    }

    fn should_fail(&mut self) -> bool {
        let index = self.attempts;
        self.attempts += 1;

        if let Some(pos) = self.fail_at.iter().position(|&i| i == index) {
            self.fail_at.swap_remove(pos);
            return true;
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return true;
        }
        false
    }

    /// Largest payload the remote puts in one frame.
    fn frame_payload(width: usize) -> usize {
        let frame_len = if width == 2 { MAX_FRAME_LEN } else { MIN_FRAME_LEN };
        frame_len - width - 1
    }

    fn advertise(&self, width: usize) -> u16 {
        self.advertised_override
            .unwrap_or(min(self.outbound.len(), Self::frame_payload(width)) as u16)
    }

    /// Moves up to `room` outbound bytes into `dst` and returns the count.
    fn send(&mut self, dst: &mut [u8], room: usize) -> usize {
        let n = min(room, self.outbound.len());
        for (slot, byte) in dst.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn respond(&mut self, tx: &[u8], rx: &mut [u8]) {
        rx.fill(0);
        if tx.is_empty() {
            return;
        }

        let ctrl = ControlByte::from_bits(tx[0]);
        let width = ctrl.length_width();
        rx[0] = self.next_status().bits();

        if ctrl.contains(ControlByte::READ) {
            let ctrl_len = width + 1;
            let room = tx.len().saturating_sub(ctrl_len);
            if room == 0 {
                let advertised = self.advertise(width);
                encode_length(ctrl, &mut rx[1..], advertised);
            } else {
                let n = self.send(&mut rx[ctrl_len..], room);
                encode_length(ctrl, &mut rx[1..], n as u16);
            }
            return;
        }

        let echoed = if ctrl.contains(ControlByte::FULL_DUPLEX) {
            let ctrl_len = width + 1;
            let room = tx.len().saturating_sub(ctrl_len);
            let written = min(decode_length(ctrl, &tx[1..]) as usize, room);

            let advertised = self.advertise(width);
            self.send(&mut rx[ctrl_len..], room);
            encode_length(ctrl, &mut rx[1..], advertised);

            &tx[ctrl_len..ctrl_len + written]
        } else {
            &tx[1..]
        };

        self.received.extend_from_slice(echoed);
        if self.echo {
            self.outbound.extend(echoed.iter().copied());
        }
    }

    fn record(&mut self, tx: &[u8], rx: &[u8], ok: bool) {
        if self.exchanges.len() == EXCHANGE_LOG_LEN {
            self.exchanges.pop_front();
        }
        self.exchanges.push_back(ExchangeRecord {
            tx: tx.to_vec(),
            rx: rx.to_vec(),
            ok,
        });
    }
}

/// Simulated remote MCU sharing one state between clones.
#[derive(Clone)]
pub struct SimulatedMcu {
    state: Arc<Mutex<McuState>>,
}

impl SimulatedMcu {
    /// A responsive MCU with an empty outbound queue reporting full credit.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(McuState {
                outbound: VecDeque::new(),
                received: Vec::new(),
                echo: false,
                status: StatusByte::new(3, (MAX_CREDIT / SIZE_TABLE[3]) as u8, false),
                status_script: VecDeque::new(),
                advertised_override: None,
                fail_next: 0,
                fail_at: Vec::new(),
                attempts: 0,
                unresponsive: false,
                request: false,
                exchanges: VecDeque::new(),
                irq: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, McuState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// DATA-READY edges are delivered to `irq`.
    pub fn attach_irq(&self, irq: IrqHandle) {
        self.state().irq = Some(irq);
    }

    /// Queues payload for the host and raises DATA-READY.
    pub fn push_inbound(&self, data: &[u8]) {
        let irq = {
            let mut state = self.state();
            state.outbound.extend(data.iter().copied());
            state.irq.clone()
        };
        if let Some(irq) = irq {
            irq.raise();
        }
    }

    /// Outbound bytes not yet fetched by the host.
    pub fn pending_inbound(&self) -> usize {
        self.state().outbound.len()
    }

    /// Everything the host wrote so far.
    pub fn received(&self) -> Vec<u8> {
        self.state().received.clone()
    }

    pub fn take_received(&self) -> Vec<u8> {
        core::mem::take(&mut self.state().received)
    }

    /// Loops every byte the host writes back to it.
    pub fn set_echo(&self, echo: bool) {
        self.state().echo = echo;
    }

    /// Status byte reported once the script runs out.
    pub fn set_status(&self, status: StatusByte) {
        self.state().status = status;
    }

    /// Status bytes for the next exchanges, one per exchange.
    pub fn script_status<I: IntoIterator<Item = StatusByte>>(&self, script: I) {
        self.state().status_script.extend(script);
    }

    /// Length reported on probes and full-duplex writes regardless of the queue.
    pub fn set_advertised_override(&self, length: Option<u16>) {
        self.state().advertised_override = length;
    }

    pub fn fail_next_exchanges(&self, count: usize) {
        self.state().fail_next = count;
    }

    /// Fails the exchange with this zero-based index, counted from creation.
    pub fn fail_exchange_at(&self, index: usize) {
        self.state().fail_at.push(index);
    }

    /// Stops answering REQUEST.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.state().unresponsive = unresponsive;
    }

    /// Logged exchanges, oldest first.
    pub fn exchanges(&self) -> Vec<ExchangeRecord> {
        self.state().exchanges.iter().cloned().collect()
    }

    pub fn clear_exchanges(&self) {
        self.state().exchanges.clear();
    }
}

impl Default for SimulatedMcu {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedMcu {
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        let mut state = self.state();

        if state.should_fail() {
            rx.fill(0);
            state.record(tx, rx, false);
            return Err(Error::Exchange);
        }

        state.respond(tx, rx);
        trace!("sim: {} byte exchange, {} queued", tx.len(), state.outbound.len());
        state.record(tx, rx, true);
        Ok(())
    }
}

impl Signals for SimulatedMcu {
    fn set_request(&self, level: bool) {
        self.state().request = level;
    }

    fn request(&self) -> bool {
        self.state().request
    }

    fn response(&self) -> bool {
        let state = self.state();
        state.request && !state.unresponsive
    }

    fn data_ready(&self) -> bool {
        !self.state().outbound.is_empty()
    }
}

/// Delay source that records instead of sleeping.
#[derive(Debug, Clone, Default)]
pub struct RecordingDelay {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total(&self) -> Duration {
        self.delays().iter().sum()
    }
}

impl Delay for RecordingDelay {
    fn delay(&mut self, duration: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_advertises_queue() {
        let mut mcu = SimulatedMcu::new();
        mcu.push_inbound(&[9u8; 300]);

        let tx = [0x70, 0, 0];
        let mut rx = [0u8; 3];
        mcu.exchange(&tx, &mut rx).unwrap();
        assert_eq!(u16::from_le_bytes([rx[1], rx[2]]), 300);
        assert_eq!(mcu.pending_inbound(), 300);
    }

    #[test]
    fn test_one_byte_probe_is_capped_to_frame() {
        let mut mcu = SimulatedMcu::new();
        mcu.push_inbound(&[9u8; 300]);

        let tx = [0x60, 0];
        let mut rx = [0u8; 2];
        mcu.exchange(&tx, &mut rx).unwrap();
        assert_eq!(rx[1] as usize, MIN_FRAME_LEN - 2);
    }

    #[test]
    fn test_echo_returns_written_bytes_later() {
        let mut mcu = SimulatedMcu::new();
        mcu.set_echo(true);

        let tx = [0x50, 2, 0, b'o', b'k'];
        let mut rx = [0u8; 5];
        mcu.exchange(&tx, &mut rx).unwrap();
        // Nothing was queued when the exchange started.
        assert_eq!(&rx[1..], &[0, 0, 0, 0]);
        assert_eq!(mcu.pending_inbound(), 2);
        assert_eq!(mcu.received(), b"ok");
    }

    #[test]
    fn test_scripted_status_then_fixed() {
        let mut mcu = SimulatedMcu::new();
        mcu.set_status(StatusByte::new(1, 1, false));
        mcu.script_status([StatusByte::new(0, 0, true)]);

        let tx = [0x70, 0, 0];
        let mut rx = [0u8; 3];
        mcu.exchange(&tx, &mut rx).unwrap();
        assert_eq!(rx[0], 0x80);
        mcu.exchange(&tx, &mut rx).unwrap();
        assert_eq!(rx[0], StatusByte::new(1, 1, false).bits());
    }

    #[test]
    fn test_failure_injection() {
        let mut mcu = SimulatedMcu::new();
        mcu.fail_exchange_at(1);

        let tx = [0x70, 0, 0];
        let mut rx = [0u8; 3];
        assert!(mcu.exchange(&tx, &mut rx).is_ok());
        assert_eq!(mcu.exchange(&tx, &mut rx), Err(Error::Exchange));
        assert!(mcu.exchange(&tx, &mut rx).is_ok());

        let log = mcu.exchanges();
        assert_eq!(log.iter().filter(|r| !r.ok).count(), 1);
        assert!(log.iter().all(ExchangeRecord::is_read));
    }

    #[test]
    fn test_lines() {
        let mcu = SimulatedMcu::new();
        assert!(!mcu.response());

        mcu.set_request(true);
        assert!(mcu.response());

        mcu.set_unresponsive(true);
        assert!(!mcu.response());
        assert!(!mcu.data_ready());

        mcu.push_inbound(b"x");
        assert!(mcu.data_ready());
    }
}
