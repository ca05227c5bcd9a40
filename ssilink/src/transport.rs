//! Hardware seams.
//!
//! The engine never touches a bus or a pin directly. It drives:
//!
//! - [`Transport`]: one synchronous full-duplex exchange on the serial bus
//! - [`Signals`]: the REQUEST, RESPONSE and DATA-READY control lines
//! - [`Delay`]: waits inside the handshake and credit backoff
//!
//! The in-memory remote side in [`sim`](crate::sim) implements the first two
//! for tests and demos.

use core::time::Duration;

use crate::error::Result;

/// A synchronous full-duplex serial bus.
///
/// Implement this trait to run the engine over a real bus driver.
pub trait Transport: Send {
    /// Clocks `tx` out while clocking the same number of bytes into `rx`.
    ///
    /// `tx` and `rx` always have equal length. An error means the exchange
    /// did not complete and `rx` holds no usable data.
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        (**self).exchange(tx, rx)
    }
}

/// Control lines shared between the host and the remote MCU.
pub trait Signals: Send + Sync {
    /// Drives the host REQUEST line.
    fn set_request(&self, level: bool);

    /// Samples the REQUEST line as driven.
    fn request(&self) -> bool;

    /// Samples the remote RESPONSE line.
    fn response(&self) -> bool;

    /// Samples the remote DATA-READY line.
    fn data_ready(&self) -> bool;
}

/// Source of waits. Tests inject one that does not sleep.
pub trait Delay: Send {
    fn delay(&mut self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl Delay for NoDelay {
    fn delay(&mut self, _duration: Duration) {}
}
