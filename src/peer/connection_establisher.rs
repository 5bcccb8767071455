//! Connection handshake with one peer
//!
//! Both sides send `SynchronizeConnection` until the other side answers with
//! `AcknowledgeConnection`. Each side becomes established independently as
//! soon as its own synchronize is acknowledged.

use tracing::{debug, info, warn};

use crate::protocol::{Message, Peer};
use crate::timer::{Timer, TimerFactory};

use super::{Outbox, PeerTimeouts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablisherState {
    Handshaking,
    Established,
    /// The abort deadline passed before any acknowledgement arrived
    Aborted,
}

#[derive(Debug)]
pub struct ConnectionEstablisher {
    peer: Peer,
    state: EstablisherState,
    attempt: u64,
    synchronize_received: bool,
    retry_timer: Timer,
    abort_timer: Timer,
}

impl ConnectionEstablisher {
    /// Start the handshake; the first synchronize goes out immediately
    pub fn new(peer: Peer, timers: &TimerFactory, timeouts: &PeerTimeouts, outbox: &mut Outbox) -> Self {
        let mut establisher = Self {
            peer,
            state: EstablisherState::Handshaking,
            attempt: 0,
            synchronize_received: false,
            retry_timer: timers.create(timeouts.synchronize_retry),
            abort_timer: timers.create(timeouts.connection_abort),
        };
        establisher.send_synchronize(outbox);
        establisher
    }

    fn send_synchronize(&mut self, outbox: &mut Outbox) {
        self.attempt = self.attempt.saturating_add(1);
        outbox.send(&self.peer, Message::SynchronizeConnection { attempt: self.attempt });
        self.retry_timer.reset_timer();
    }

    pub fn try_send(&mut self, outbox: &mut Outbox) {
        if self.state != EstablisherState::Handshaking {
            return;
        }
        if self.abort_timer.is_time() {
            warn!(peer = %self.peer, attempts = self.attempt, "Connection handshake aborted");
            self.state = EstablisherState::Aborted;
            outbox.notify(
                &self.peer,
                Message::Timeout {
                    reason: format!("no AcknowledgeConnection after {} attempts", self.attempt),
                },
            );
        } else if self.retry_timer.is_time() {
            self.send_synchronize(outbox);
        }
    }

    /// Always acknowledged, so a peer that missed our answer can still finish
    pub fn received_synchronize_connection(&mut self, attempt: u64, outbox: &mut Outbox) {
        debug!(peer = %self.peer, attempt, "Received SynchronizeConnection");
        self.synchronize_received = true;
        outbox.send(&self.peer, Message::AcknowledgeConnection);
        if self.state == EstablisherState::Handshaking {
            // The peer is listening now; don't wait for the retry timer.
            self.send_synchronize(outbox);
        }
    }

    pub fn received_acknowledge_connection(&mut self, outbox: &mut Outbox) {
        match self.state {
            EstablisherState::Handshaking => {
                info!(peer = %self.peer, attempts = self.attempt, "Connection established");
                self.state = EstablisherState::Established;
                outbox.notify(&self.peer, Message::ConnectionIsReady);
            }
            EstablisherState::Established => {}
            EstablisherState::Aborted => {
                debug!(peer = %self.peer, "Ignoring AcknowledgeConnection after abort");
            }
        }
    }

    pub fn state(&self) -> EstablisherState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == EstablisherState::Established
    }

    pub fn has_received_synchronize(&self) -> bool {
        self.synchronize_received
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn is_ready_to_stop(&self) -> bool {
        self.state != EstablisherState::Handshaking
    }
}
