//! Device context and the byte-stream client surface.
//!
//! A [`Device`] owns the worker thread. Opening it yields the single
//! [`Session`] through which a client reads and writes the stream.
//!
//! # Example
//!
//! ```no_run
//! use ssilink::sim::SimulatedMcu;
//! use ssilink::{DeviceBuilder, LinkConfig, StdDelay};
//!
//! let mcu = SimulatedMcu::new();
//! mcu.set_echo(true);
//!
//! let device = DeviceBuilder::new(LinkConfig::default())
//!     .build(mcu.clone(), mcu.clone(), StdDelay)
//!     .unwrap();
//! mcu.attach_irq(device.irq_handle());
//!
//! let session = device.open().unwrap();
//! session.write(b"hello").unwrap();
//! ```

use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::config::{LinkConfig, OverflowPolicy};
use crate::engine::{PayloadSink, TransferEngine};
use crate::error::{Error, Result};
use crate::handshake::Handshake;
use crate::scheduler::{IrqHandle, Job, Recovery, Shared, WorkItem, Worker};
use crate::stats::{Counters, LinkStats};
use crate::transport::{Delay, Signals, Transport};

/// Readiness of a session, as reported by [`Session::poll`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Inbound bytes are waiting.
    pub readable: bool,
    /// The write ring has room.
    pub writable: bool,
}

impl Readiness {
    fn satisfies(&self, interest: Interest) -> bool {
        (interest.readable && self.readable) || (interest.writable && self.writable)
    }
}

/// What [`Session::wait`] waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Self = Self {
        readable: false,
        writable: true,
    };
    pub const BOTH: Self = Self {
        readable: true,
        writable: true,
    };
}

/// Builder for [`Device`].
pub struct DeviceBuilder {
    config: LinkConfig,
    consumer: Option<Box<dyn PayloadSink + Send>>,
    recovery: Option<Box<dyn Recovery>>,
}

impl DeviceBuilder {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            consumer: None,
            recovery: None,
        }
    }

    /// Registers a consumer for every decoded inbound chunk.
    ///
    /// The consumer runs on the worker thread, before the chunk is copied
    /// into the read ring.
    pub fn consumer<S: PayloadSink + Send + 'static>(mut self, consumer: S) -> Self {
        self.consumer = Some(Box::new(consumer));
        self
    }

    /// Registers the hook invoked on every handshake timeout.
    pub fn recovery<R: Recovery + 'static>(mut self, recovery: R) -> Self {
        self.recovery = Some(Box::new(recovery));
        self
    }

    /// Validates the configuration and starts the worker thread.
    pub fn build<T, S, D>(self, transport: T, signals: S, delay: D) -> Result<Device>
    where
        T: Transport + 'static,
        S: Signals + 'static,
        D: Delay + 'static,
    {
        self.config.validate()?;

        let signals: Arc<dyn Signals> = Arc::new(signals);
        let counters = Arc::new(Counters::new());
        let (jobs_tx, jobs_rx) = mpsc::channel();

        let shared = Arc::new(Shared::new(
            &self.config,
            signals.clone(),
            counters.clone(),
            jobs_tx,
        )?);

        let worker = Worker::new(
            shared.clone(),
            TransferEngine::new(transport, &self.config, counters),
            Handshake::new(self.config.handshake, signals, delay),
            self.config,
            self.consumer,
            self.recovery,
        );

        let handle = thread::Builder::new()
            .name("ssilink-worker".into())
            .spawn(move || worker.run(jobs_rx))
            .map_err(|e| {
                error!("Failed to spawn worker: {}", e);
                Error::Disconnected
            })?;

        info!(
            "Device ready: {:?} duplex, {}-byte length, rings {}/{}",
            self.config.duplex,
            self.config.length_width.bytes(),
            self.config.read_buf_size,
            self.config.write_buf_size
        );

        Ok(Device {
            shared,
            config: self.config,
            worker: Some(handle),
        })
    }
}

/// The link device context.
///
/// Dropping it shuts the worker down.
pub struct Device {
    shared: Arc<Shared>,
    config: LinkConfig,
    worker: Option<JoinHandle<()>>,
}

impl Device {
    /// Opens the device for a client.
    ///
    /// Empties both rings at once. The worker then resets the statistics and
    /// the link state before it runs any work for the new session. Fails with
    /// [`Error::Busy`] while another session is open.
    pub fn open(&self) -> Result<Session> {
        if self
            .shared
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }

        let epoch = self.shared.begin_epoch();
        if let Err(e) = self.shared.post(Job::Open(epoch)) {
            self.shared.open.store(false, Ordering::Release);
            return Err(e);
        }
        self.shared.rearm();

        info!("Device opened");
        Ok(Session {
            shared: self.shared.clone(),
            policy: self.config.write_overflow,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Entry point for DATA-READY edges.
    pub fn irq_handle(&self) -> IrqHandle {
        IrqHandle::new(&self.shared)
    }

    pub fn stats(&self) -> LinkStats {
        self.shared.counters.snapshot()
    }

    /// Blocks until every job queued so far has run.
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.shared.post(Job::Flush(ack_tx))?;
        ack_rx.recv().map_err(|_| Error::Disconnected)
    }

    /// Stops new work, masks the interrupt and waits for queued work.
    pub fn suspend(&self) -> Result<()> {
        debug!("Suspending");
        self.shared.suspending.store(true, Ordering::Release);
        self.shared.mask_irq();
        self.flush()
    }

    /// Re-enables the interrupt and picks up bytes written meanwhile.
    pub fn resume(&self) -> Result<()> {
        debug!("Resuming");
        self.shared.suspending.store(false, Ordering::Release);
        if !self.is_open() {
            return Ok(());
        }

        self.shared.rearm();
        if !self.shared.lock_write().is_empty() {
            self.shared.dispatch(WorkItem::Transmit)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };

        self.shared.suspending.store(true, Ordering::Release);
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.mask_irq();

        if self.shared.post(Job::Shutdown).is_err() {
            warn!("Worker already gone at shutdown");
        }
        if handle.join().is_err() {
            error!("Worker panicked");
        }

        let stats = self.stats();
        info!(
            "Device shut down: {} frames / {} bytes sent, {} frames / {} bytes received, {} tx failures",
            stats.frames_sent,
            stats.bytes_sent,
            stats.frames_received,
            stats.bytes_received,
            stats.tx_failures
        );
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// An open client session.
///
/// All methods take `&self`, so one session can be shared between a reader
/// and a writer thread.
pub struct Session {
    shared: Arc<Shared>,
    policy: OverflowPolicy,
    closed: AtomicBool,
}

impl Session {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Drains up to `buf.len()` inbound bytes. Never blocks; returns 0 when
    /// nothing is waiting.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        Ok(self.shared.lock_read().read(buf))
    }

    /// Queues `data` for transmission and wakes the worker.
    ///
    /// When the write ring cannot hold all of `data`, the configured
    /// [`OverflowPolicy`] decides between a short write and
    /// [`Error::WouldBlock`].
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.check_open()?;
        if data.is_empty() {
            return Ok(0);
        }

        let accepted = {
            let mut ring = self.shared.lock_write();
            match self.policy {
                OverflowPolicy::Truncate => {
                    let written = ring.write(data);
                    if written < data.len() {
                        let dropped = data.len() - written;
                        Counters::add(&self.shared.counters.write_drops, dropped);
                        warn!(
                            "Write buffer full: dropped {} of {} bytes",
                            dropped,
                            data.len()
                        );
                    }
                    written
                }
                OverflowPolicy::Reject => {
                    ring.write_all(data).map_err(|_| Error::WouldBlock)?;
                    data.len()
                }
            }
        };

        if accepted > 0 && !self.shared.suspending.load(Ordering::Acquire) {
            self.shared.dispatch(WorkItem::Transmit)?;
        }

        Ok(accepted)
    }

    /// Free space in the write ring. A lone writer can always queue this much
    /// without loss.
    pub fn write_capacity(&self) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        self.shared.lock_write().remaining()
    }

    pub fn poll(&self) -> Readiness {
        if self.closed.load(Ordering::Acquire) {
            return Readiness::default();
        }
        Readiness {
            readable: !self.shared.lock_read().is_empty(),
            writable: !self.shared.lock_write().is_full(),
        }
    }

    /// Blocks until the session is ready for `interest` or `timeout` passes.
    ///
    /// Returns the readiness seen last, which may satisfy nothing on timeout.
    pub fn wait(&self, interest: Interest, timeout: Duration) -> Result<Readiness> {
        let deadline = Instant::now() + timeout;
        let mut generation = self.shared.lock_generation();

        loop {
            self.check_open()?;

            let ready = self.poll();
            if ready.satisfies(interest) {
                return Ok(ready);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(ready);
            }

            generation = self
                .shared
                .readiness()
                .wait_timeout(generation, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.shared.counters.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the session. Queued and unread bytes are discarded.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shared.mask_irq();
        self.shared.begin_epoch();
        self.shared.open.store(false, Ordering::Release);
        self.shared.notify();

        info!("Device closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StatusByte;
    use crate::sim::SimulatedMcu;
    use crate::transport::NoDelay;
    use std::sync::{Condvar, Mutex};

    fn device(config: LinkConfig) -> (Device, SimulatedMcu) {
        let mcu = SimulatedMcu::new();
        let device = DeviceBuilder::new(config)
            .build(mcu.clone(), mcu.clone(), NoDelay)
            .unwrap();
        mcu.attach_irq(device.irq_handle());
        (device, mcu)
    }

    /// Holds exchanges while closed and counts the ones that arrived.
    #[derive(Clone, Default)]
    struct Gate {
        state: Arc<(Mutex<(bool, usize)>, Condvar)>,
    }

    impl Gate {
        fn hold(&self) {
            self.state.0.lock().unwrap().0 = true;
        }

        fn release(&self) {
            self.state.0.lock().unwrap().0 = false;
            self.state.1.notify_all();
        }

        fn wait_arrived(&self, count: usize) {
            let (lock, cvar) = &*self.state;
            let guard = lock.lock().unwrap();
            let _guard = cvar
                .wait_timeout_while(guard, Duration::from_secs(3), |s| s.1 < count)
                .unwrap();
        }

        fn pass(&self) {
            let (lock, cvar) = &*self.state;
            let mut guard = lock.lock().unwrap();
            guard.1 += 1;
            cvar.notify_all();
            let _guard = cvar.wait_while(guard, |s| s.0).unwrap();
        }
    }

    struct GatedTransport {
        mcu: SimulatedMcu,
        gate: Gate,
    }

    impl Transport for GatedTransport {
        fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
            self.gate.pass();
            self.mcu.exchange(tx, rx)
        }
    }

    fn gated_device(gate: &Gate) -> (Arc<Device>, SimulatedMcu) {
        let mcu = SimulatedMcu::new();
        let transport = GatedTransport {
            mcu: mcu.clone(),
            gate: gate.clone(),
        };
        let device = DeviceBuilder::new(LinkConfig::new())
            .build(transport, mcu.clone(), NoDelay)
            .unwrap();
        mcu.attach_irq(device.irq_handle());
        (Arc::new(device), mcu)
    }

    /// Runs `suspend` on its own thread so a hang fails the test instead of
    /// blocking it.
    fn suspend_in_background(device: &Arc<Device>) -> mpsc::Receiver<Result<()>> {
        let (done_tx, done_rx) = mpsc::channel();
        let device = device.clone();
        thread::spawn(move || {
            let _ = done_tx.send(device.suspend());
        });
        done_rx
    }

    #[test]
    fn test_open_is_exclusive() {
        let (device, _) = device(LinkConfig::new());
        let session = device.open().unwrap();
        assert!(matches!(device.open(), Err(Error::Busy)));

        session.close();
        assert!(!device.is_open());
        assert!(device.open().is_ok());
    }

    #[test]
    fn test_closed_session_rejects_io() {
        let (device, _) = device(LinkConfig::new());
        let session = device.open().unwrap();
        session.close();

        assert_eq!(session.write(b"x"), Err(Error::Closed));
        assert_eq!(session.read(&mut [0u8; 4]), Err(Error::Closed));
        assert_eq!(session.poll(), Readiness::default());
    }

    #[test]
    fn test_reject_policy_is_all_or_nothing() {
        let config = LinkConfig::new()
            .with_buffer_sizes(1024, 8192)
            .with_write_overflow(OverflowPolicy::Reject);
        let (device, _) = device(config);
        let session = device.open().unwrap();
        device.suspend().unwrap();

        assert_eq!(session.write(&[0u8; 8000]), Ok(8000));
        assert_eq!(session.write(&[0u8; 500]), Err(Error::WouldBlock));
        assert_eq!(session.write(&[0u8; 192]), Ok(192));
        assert!(!session.poll().writable);
        assert_eq!(device.stats().write_drops, 0);
    }

    #[test]
    fn test_truncate_policy_counts_drops() {
        let config = LinkConfig::new().with_buffer_sizes(1024, 8192);
        let (device, _) = device(config);
        let session = device.open().unwrap();
        device.suspend().unwrap();

        assert_eq!(session.write(&[0u8; 8000]), Ok(8000));
        assert_eq!(session.write(&[0u8; 500]), Ok(192));
        assert_eq!(device.stats().write_drops, 308);
    }

    #[test]
    fn test_suspend_holds_writes_until_resume() {
        let (device, mcu) = device(LinkConfig::new());
        let session = device.open().unwrap();

        device.suspend().unwrap();
        session.write(b"parked").unwrap();
        device.flush().unwrap();
        assert!(mcu.received().is_empty());

        device.resume().unwrap();
        device.flush().unwrap();
        assert_eq!(mcu.received(), b"parked");
    }

    #[test]
    fn test_wait_times_out_without_data() {
        let (device, _) = device(LinkConfig::new());
        let session = device.open().unwrap();

        let ready = session
            .wait(Interest::READABLE, Duration::from_millis(10))
            .unwrap();
        assert!(!ready.readable);
        assert!(ready.writable);
    }

    #[test]
    fn test_open_resets_statistics() {
        let (device, mcu) = device(LinkConfig::new());
        let session = device.open().unwrap();
        session.write(b"abc").unwrap();
        device.flush().unwrap();
        assert_eq!(mcu.received(), b"abc");
        assert_eq!(device.stats().bytes_sent, 3);

        session.close();
        let _session = device.open().unwrap();
        device.flush().unwrap();
        assert_eq!(device.stats(), LinkStats::default());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mcu = SimulatedMcu::new();
        let result = DeviceBuilder::new(LinkConfig::new().with_buffer_sizes(100, 8192))
            .build(mcu.clone(), mcu, NoDelay);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_suspend_returns_while_credit_stays_zero() {
        let (device, mcu) = device(LinkConfig::new());
        let device = Arc::new(device);
        let session = device.open().unwrap();

        mcu.set_status(StatusByte::new(0, 0, false));
        session.write(&[1u8; 100]).unwrap();
        device.flush().unwrap();
        session.write(&[2u8; 100]).unwrap();
        thread::sleep(Duration::from_millis(50));

        let done = suspend_in_background(&device);
        assert_eq!(done.recv_timeout(Duration::from_secs(3)), Ok(Ok(())));
        assert!(!mcu.request());
        assert_eq!(mcu.received(), vec![1u8; 100]);
        assert_eq!(session.write_capacity(), device.config().write_buf_size - 100);
        assert!(mcu.exchanges().len() < 4);
    }

    #[test]
    fn test_suspend_waits_for_in_flight_frame() {
        let gate = Gate::default();
        let (device, mcu) = gated_device(&gate);
        let session = device.open().unwrap();

        gate.hold();
        session.write(&[7u8; 100]).unwrap();
        gate.wait_arrived(1);

        let done = suspend_in_background(&device);
        assert!(done.recv_timeout(Duration::from_millis(50)).is_err());

        gate.release();
        assert_eq!(done.recv_timeout(Duration::from_secs(3)), Ok(Ok(())));
        assert_eq!(mcu.received(), vec![7u8; 100]);
        assert!(!mcu.request());

        session.write(b"parked").unwrap();
        device.flush().unwrap();
        assert_eq!(mcu.received().len(), 100);
    }

    #[test]
    fn test_reopen_during_exchange_keeps_new_bytes() {
        let gate = Gate::default();
        let (device, mcu) = gated_device(&gate);
        let session = device.open().unwrap();

        gate.hold();
        session.write(&[1u8; 100]).unwrap();
        gate.wait_arrived(1);

        session.close();
        let session = device.open().unwrap();
        session.write(b"new").unwrap();

        gate.release();
        device.flush().unwrap();

        let mut expected = vec![1u8; 100];
        expected.extend_from_slice(b"new");
        assert_eq!(mcu.received(), expected);
        assert_eq!(session.write_capacity(), device.config().write_buf_size);
        assert_eq!(device.stats().bytes_sent, 3);
    }

    #[test]
    fn test_close_during_exchange_discards_reply() {
        let gate = Gate::default();
        let (device, mcu) = gated_device(&gate);
        let session = device.open().unwrap();

        gate.hold();
        mcu.push_inbound(b"late reply");
        gate.wait_arrived(1);

        session.close();
        gate.release();
        device.flush().unwrap();

        let session = device.open().unwrap();
        device.flush().unwrap();
        assert_eq!(session.read(&mut [0u8; 16]), Ok(0));
        assert_eq!(device.stats(), LinkStats::default());
    }
}
