//! Work-item scheduler.
//!
//! Interrupt context only masks the DATA-READY gate and posts a work item.
//! A single worker thread runs every cycle:
//!
//! ```text
//!  Idle --(Receive | Transmit)--> Handshake --ok--> Active --> Release --> Idle
//!                                     |
//!                                     +--timeout--> recovery --> Idle
//! ```
//!
//! The worker is the only consumer of the write ring and the only producer of
//! the read ring. Credit and protocol state live in the engine it owns.
//!
//! Every open and close starts a new session epoch. A cycle only touches the
//! rings while the epoch it was configured for is still current, so a cycle
//! blocked in an exchange across close and reopen cannot consume or fill the
//! next session's bytes.

use core::cmp::min;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, error, info, trace, warn};

use crate::buffer::RingBuffer;
use crate::config::LinkConfig;
use crate::engine::{PayloadSink, TransferEngine};
use crate::error::{Error, Result};
use crate::handshake::Handshake;
use crate::stats::Counters;
use crate::transport::{Delay, Signals, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    /// DATA-READY edge.
    Receive,
    /// Client write.
    Transmit,
}

impl WorkItem {
    const fn index(self) -> usize {
        match self {
            WorkItem::Receive => 0,
            WorkItem::Transmit => 1,
        }
    }
}

pub(crate) enum Job {
    Work(WorkItem),
    /// Session opened at the given epoch: rebuild protocols, reset credit
    /// and statistics.
    Open(u64),
    /// Acknowledged once every earlier job ran.
    Flush(Sender<()>),
    Shutdown,
}

/// Invoked once per handshake timeout, typically to reset the remote MCU.
pub trait Recovery: Send {
    fn recover(&mut self);
}

impl<F: FnMut() + Send> Recovery for F {
    fn recover(&mut self) {
        self()
    }
}

/// State shared between the worker, sessions and the interrupt handle.
pub(crate) struct Shared {
    pub(crate) read_ring: Mutex<RingBuffer>,
    pub(crate) write_ring: Mutex<RingBuffer>,

    /// Bumped on every readiness change.
    generation: Mutex<u64>,
    readiness: Condvar,

    pub(crate) open: AtomicBool,
    /// Bumped under both ring locks at every open and close.
    epoch: AtomicU64,
    pub(crate) suspending: AtomicBool,
    /// Set at shutdown; ends an active loop early.
    pub(crate) stopping: AtomicBool,
    irq_enabled: AtomicBool,

    /// Per-kind "queued" flags. A kind is queued at most once.
    pending: [AtomicBool; 2],
    jobs: Sender<Job>,

    pub(crate) signals: Arc<dyn Signals>,
    pub(crate) counters: Arc<Counters>,
}

impl Shared {
    pub(crate) fn new(
        config: &LinkConfig,
        signals: Arc<dyn Signals>,
        counters: Arc<Counters>,
        jobs: Sender<Job>,
    ) -> Result<Self> {
        Ok(Self {
            read_ring: Mutex::new(RingBuffer::new(config.read_buf_size)?),
            write_ring: Mutex::new(RingBuffer::new(config.write_buf_size)?),
            generation: Mutex::new(0),
            readiness: Condvar::new(),
            open: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            suspending: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            irq_enabled: AtomicBool::new(false),
            pending: [AtomicBool::new(false), AtomicBool::new(false)],
            jobs,
            signals,
            counters,
        })
    }

    pub(crate) fn lock_read(&self) -> MutexGuard<'_, RingBuffer> {
        self.read_ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_write(&self) -> MutexGuard<'_, RingBuffer> {
        self.write_ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_generation(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Empties both rings and starts a new session epoch, returning it.
    pub(crate) fn begin_epoch(&self) -> u64 {
        let mut write = self.lock_write();
        let mut read = self.lock_read();
        write.clear();
        read.clear();
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn readiness(&self) -> &Condvar {
        &self.readiness
    }

    /// Wakes every readiness waiter.
    pub(crate) fn notify(&self) {
        let mut generation = self.lock_generation();
        *generation = generation.wrapping_add(1);
        self.readiness.notify_all();
    }

    pub(crate) fn post(&self, job: Job) -> Result<()> {
        self.jobs.send(job).map_err(|_| Error::Disconnected)
    }

    /// Queues `item` unless one of its kind is already queued.
    pub(crate) fn dispatch(&self, item: WorkItem) -> Result<()> {
        let pending = &self.pending[item.index()];
        if pending.swap(true, Ordering::AcqRel) {
            trace!("{:?} work already queued", item);
            return Ok(());
        }
        self.post(Job::Work(item)).inspect_err(|_| {
            pending.store(false, Ordering::Release);
        })
    }

    pub(crate) fn irq_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::Acquire)
    }

    /// Masks the DATA-READY gate. Returns whether it was enabled.
    pub(crate) fn mask_irq(&self) -> bool {
        self.irq_enabled.swap(false, Ordering::AcqRel)
    }

    /// Unmasks the DATA-READY gate unless suspending.
    ///
    /// The line is level-triggered: unmasking while it is asserted fires at
    /// once.
    pub(crate) fn rearm(&self) {
        if self.suspending.load(Ordering::Acquire) {
            return;
        }
        if !self.irq_enabled.swap(true, Ordering::AcqRel) {
            self.on_data_ready();
        }
    }

    /// Interrupt handler body.
    pub(crate) fn on_data_ready(&self) {
        if !self.signals.data_ready() {
            return;
        }
        if !self.mask_irq() {
            return;
        }
        if self.suspending.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.dispatch(WorkItem::Receive) {
            error!("Failed to queue receive work: {}", e);
        }
    }

    /// Stores decoded inbound payload for client reads of session `epoch`.
    pub(crate) fn push_inbound(&self, epoch: u64, payload: &[u8]) {
        let written = {
            let mut ring = self.lock_read();
            if self.epoch() != epoch {
                debug!("Dropped {} inbound bytes of a closed session", payload.len());
                return;
            }
            ring.write(payload)
        };
        if written < payload.len() {
            let dropped = payload.len() - written;
            Counters::add(&self.counters.read_overruns, dropped);
            warn!(
                "Read buffer overrun: dropped {} of {} bytes",
                dropped,
                payload.len()
            );
        }
        self.notify();
    }
}

/// DATA-READY interrupt entry point.
///
/// Hand this to whatever observes the line (a GPIO edge callback, or
/// [`SimulatedMcu::attach_irq`](crate::sim::SimulatedMcu::attach_irq)).
#[derive(Clone)]
pub struct IrqHandle {
    shared: Weak<Shared>,
}

impl IrqHandle {
    pub(crate) fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    /// Signals a DATA-READY edge.
    ///
    /// Ignored while the line is low or the gate is masked. Otherwise masks
    /// the gate and queues receive work.
    pub fn raise(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_data_ready();
        }
    }
}

/// Routes decoded payload to the read ring and the registered consumer.
struct Delivery<'a> {
    shared: &'a Shared,
    epoch: u64,
    consumer: &'a mut Option<Box<dyn PayloadSink + Send>>,
}

impl PayloadSink for Delivery<'_> {
    fn deliver(&mut self, payload: &[u8]) {
        if let Some(consumer) = self.consumer.as_mut() {
            consumer.deliver(payload);
        }
        self.shared.push_inbound(self.epoch, payload);
    }
}

/// Why an active loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// Nothing left to exchange.
    Drained,
    /// A credit probe found no inbound data but refreshed the credit, so the
    /// queued bytes can go out in a follow-up cycle.
    CreditRefreshed,
    /// An exchange failed, credit stayed at zero or the session went away.
    Stopped,
}

pub(crate) struct Worker<T, D> {
    shared: Arc<Shared>,
    engine: TransferEngine<T>,
    handshake: Handshake<D>,
    config: LinkConfig,
    consumer: Option<Box<dyn PayloadSink + Send>>,
    recovery: Option<Box<dyn Recovery>>,
    /// Session epoch the engine is configured for.
    epoch: u64,
}

impl<T: Transport, D: Delay> Worker<T, D> {
    pub(crate) fn new(
        shared: Arc<Shared>,
        engine: TransferEngine<T>,
        handshake: Handshake<D>,
        config: LinkConfig,
        consumer: Option<Box<dyn PayloadSink + Send>>,
        recovery: Option<Box<dyn Recovery>>,
    ) -> Self {
        let epoch = shared.epoch();
        Self {
            shared,
            engine,
            handshake,
            config,
            consumer,
            recovery,
            epoch,
        }
    }

    pub(crate) fn run(mut self, jobs: Receiver<Job>) {
        debug!("Worker started");

        while let Ok(job) = jobs.recv() {
            match job {
                Job::Work(item) => {
                    self.shared.pending[item.index()].store(false, Ordering::Release);
                    self.run_cycle(item);
                }
                Job::Open(epoch) => self.open_session(epoch),
                Job::Flush(ack) => {
                    let _ = ack.send(());
                }
                Job::Shutdown => break,
            }
        }

        debug!("Worker stopped");
    }

    /// Whether the session this worker is configured for is still open.
    fn session_current(&self) -> bool {
        self.shared.open.load(Ordering::Acquire) && self.shared.epoch() == self.epoch
    }

    fn open_session(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.engine.reconfigure(&self.config);
        self.shared.counters.reset();
        if !self.session_current() {
            debug!("Session {} closed before it was configured", epoch);
            return;
        }

        // Work queued before this job belonged to the previous session and
        // was discarded: pick up whatever the new one has already produced.
        self.shared.mask_irq();
        self.shared.rearm();
        if !self.shared.lock_write().is_empty() {
            self.requeue_transmit();
        }
        debug!("Session {} configured", epoch);
    }

    /// Queues transmit work for bytes no cycle is going to pick up.
    fn requeue_transmit(&self) {
        if self.shared.suspending.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.shared.dispatch(WorkItem::Transmit) {
            error!("Failed to queue transmit work: {}", e);
        }
    }

    /// One Handshake → Active → Release cycle.
    pub(crate) fn run_cycle(&mut self, item: WorkItem) {
        if !self.session_current() {
            trace!("{:?} work discarded: session closed", item);
            return;
        }

        if let Err(e) = self.handshake.wake() {
            self.handshake_failed(item, e);
            return;
        }

        let exit = self.active_loop();

        self.handshake.release();
        self.shared.rearm();

        if exit == LoopExit::CreditRefreshed {
            self.requeue_transmit();
        }
    }

    fn handshake_failed(&mut self, item: WorkItem, err: Error) {
        Counters::add(&self.shared.counters.handshake_timeouts, 1);
        warn!("{:?} work aborted: {}", item, err);

        let signals = &self.shared.signals;
        info!(
            "Lines: REQUEST {} RESPONSE {} DATA-READY {}, irq {}",
            signals.request() as u8,
            signals.response() as u8,
            signals.data_ready() as u8,
            if self.shared.irq_enabled() { "enabled" } else { "masked" }
        );
        info!(
            "Link: credit {}, last status {:?}, carry {}, {} bytes queued",
            self.engine.credit(),
            self.engine.credit_tracker().last_status(),
            self.engine.inbound_carry(),
            self.shared.lock_write().len()
        );

        if let Some(recovery) = self.recovery.as_mut() {
            recovery.recover();
        }

        // Edge-only re-arm: a line still stuck high must not spin here.
        if !self.shared.suspending.load(Ordering::Acquire) {
            self.shared.irq_enabled.store(true, Ordering::Release);
        }
    }

    fn active_loop(&mut self) -> LoopExit {
        let capacity = self.engine.tx_protocol().payload_capacity();
        let mut awaiting_credit = false;

        loop {
            if self.shared.stopping.load(Ordering::Acquire) {
                debug!("Active loop interrupted by shutdown");
                return LoopExit::Stopped;
            }
            if !self.session_current() {
                debug!("Active loop ended: session closed");
                return LoopExit::Stopped;
            }

            let data_ready = self.shared.signals.data_ready();
            if data_ready || awaiting_credit {
                let credit_probe = awaiting_credit && !data_ready;
                awaiting_credit = false;

                match self.engine.receive() {
                    Ok(len) => {
                        let payload = self.engine.payload(len);
                        if let Some(consumer) = self.consumer.as_mut() {
                            consumer.deliver(payload);
                        }
                        self.shared.push_inbound(self.epoch, payload);
                    }
                    Err(Error::NoData) if credit_probe && self.engine.credit() > 0 => {
                        trace!("Credit probe: {} bytes", self.engine.credit());
                        return LoopExit::CreditRefreshed;
                    }
                    Err(e) => {
                        debug!("Receive failed: {}", e);
                        return LoopExit::Stopped;
                    }
                }
            }

            let queued = self.shared.lock_write().len();
            if queued > 0 {
                let mut avail = min(queued, capacity);
                let credit = self.engine.credit();

                if avail > credit {
                    if credit == 0 {
                        Counters::add(&self.shared.counters.credit_delays, 1);
                        awaiting_credit = true;
                        self.handshake.pause(self.config.credit_backoff);
                    } else {
                        Counters::add(&self.shared.counters.credit_retries, 1);
                    }
                    debug!("Credit {} caps {} queued bytes", credit, avail);
                    avail = credit;
                }

                if avail > 0 {
                    let staged = {
                        let ring = self.shared.lock_write();
                        if self.shared.epoch() != self.epoch {
                            return LoopExit::Stopped;
                        }
                        let area = &mut self.engine.staging_area()[..avail];
                        ring.peek(area)
                    };

                    let mut sink = Delivery {
                        shared: &self.shared,
                        epoch: self.epoch,
                        consumer: &mut self.consumer,
                    };
                    if let Err(e) = self.engine.transmit(staged, &mut sink) {
                        debug!("Transmit of {} bytes failed: {}", staged, e);
                        return LoopExit::Stopped;
                    }

                    {
                        let mut ring = self.shared.lock_write();
                        if self.shared.epoch() != self.epoch {
                            return LoopExit::Stopped;
                        }
                        ring.skip(staged);
                    }
                    self.shared.notify();
                }
            }

            let more = self.shared.signals.data_ready() || !self.shared.lock_write().is_empty();
            if !more {
                return LoopExit::Drained;
            }
        }
    }
}
