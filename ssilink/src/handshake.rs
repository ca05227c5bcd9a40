//! REQUEST/RESPONSE wake handshake.
//!
//! The host raises REQUEST and polls RESPONSE until the remote MCU answers.
//! A sleeping MCU may miss the first edge, so REQUEST is pulsed every few
//! polls. The poll count is bounded; a timeout leaves REQUEST low.

use std::sync::Arc;

use log::{debug, info};

use crate::config::HandshakeConfig;
use crate::error::{Error, Result};
use crate::transport::{Delay, Signals};

pub struct Handshake<D> {
    config: HandshakeConfig,
    signals: Arc<dyn Signals>,
    delay: D,
}

impl<D: Delay> Handshake<D> {
    pub fn new(config: HandshakeConfig, signals: Arc<dyn Signals>, delay: D) -> Self {
        Self {
            config,
            signals,
            delay,
        }
    }

    /// Wakes the remote side.
    ///
    /// Returns the number of polls it took, or [`Error::HandshakeTimeout`]
    /// once `max_polls` polls went unanswered.
    pub fn wake(&mut self) -> Result<u32> {
        let mut polls = 0;

        self.signals.set_request(true);
        while !self.signals.response() {
            if polls >= self.config.max_polls {
                self.signals.set_request(false);
                debug!(
                    "RESPONSE timeout: no answer to REQUEST after {} polls",
                    polls
                );
                return Err(Error::HandshakeTimeout { polls });
            }
            polls += 1;

            let wait = if polls <= self.config.fast_poll_limit {
                self.config.poll_interval
            } else {
                self.config.slow_poll_interval
            };
            self.delay.delay(wait);

            if self.signals.response() {
                break;
            }

            if polls % self.config.retoggle_every == 0 {
                self.signals.set_request(false);
                self.delay.delay(self.config.retoggle_pulse);
                self.signals.set_request(true);
                self.delay.delay(self.config.retoggle_pulse);
            }
        }

        if polls > self.config.fast_poll_limit {
            info!("Handshake took {} polls", polls);
        }

        Ok(polls)
    }

    /// Lets the remote side go back to sleep.
    pub fn release(&mut self) {
        self.signals.set_request(false);
    }

    /// Waits through the injected delay source.
    pub fn pause(&mut self, duration: core::time::Duration) {
        self.delay.delay(duration);
    }
}
