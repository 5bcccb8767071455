//! Close handshake with one peer
//!
//! Both sides send `CloseConnection` until acknowledged. A side is closed
//! once it has both received the peer's `CloseConnection` and had its own
//! acknowledged, in either order, or when the close abort timer fires.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::protocol::{Message, Peer};
use crate::timer::{Timer, TimerFactory};

use super::{Outbox, PeerTimeouts};

/// Sends `CloseConnection` until the peer acknowledges it.
///
/// Nothing is sent before the first `try_send`; both timers start then.
#[derive(Debug)]
pub struct CloseConnectionSender {
    peer: Peer,
    timers: TimerFactory,
    timeouts: PeerTimeouts,
    retry_timer: Option<Timer>,
    abort_timer: Option<Timer>,
    acknowledged: bool,
}

impl CloseConnectionSender {
    pub fn new(peer: Peer, timers: &TimerFactory, timeouts: &PeerTimeouts) -> Self {
        Self {
            peer,
            timers: timers.clone(),
            timeouts: timeouts.clone(),
            retry_timer: None,
            abort_timer: None,
            acknowledged: false,
        }
    }

    pub fn try_send(&mut self, outbox: &mut Outbox) {
        if self.acknowledged {
            return;
        }
        match self.retry_timer.as_mut() {
            None => {
                debug!(peer = %self.peer, "Sending CloseConnection");
                outbox.send(&self.peer, Message::CloseConnection);
                self.retry_timer = Some(self.timers.create(self.timeouts.close_retry));
                self.abort_timer = Some(self.timers.create(self.timeouts.close_abort));
            }
            Some(retry_timer) => {
                if self.abort_timer.as_ref().is_some_and(Timer::is_time) {
                    return;
                }
                if retry_timer.is_time() {
                    outbox.send(&self.peer, Message::CloseConnection);
                    retry_timer.reset_timer();
                }
            }
        }
    }

    pub fn received_acknowledge_close_connection(&mut self) {
        self.acknowledged = true;
    }

    pub fn is_started(&self) -> bool {
        self.retry_timer.is_some()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// The close deadline passed, whatever the handshake reached by then
    pub fn is_abort_time(&self) -> bool {
        self.abort_timer.as_ref().is_some_and(Timer::is_time)
    }
}

/// Raises `ConnectionIsClosed` for the control loop, exactly once.
///
/// After both close conditions hold it lingers for
/// `connection_is_closed_wait`, so a retransmitted `CloseConnection` from the
/// peer still gets acknowledged. The abort path skips the linger.
#[derive(Debug)]
pub struct ConnectionIsClosedSender {
    peer: Peer,
    timers: TimerFactory,
    linger: Duration,
    close_received: bool,
    acknowledge_received: bool,
    linger_timer: Option<Timer>,
    finished: bool,
}

impl ConnectionIsClosedSender {
    pub fn new(peer: Peer, timers: &TimerFactory, timeouts: &PeerTimeouts) -> Self {
        Self {
            peer,
            timers: timers.clone(),
            linger: timeouts.connection_is_closed_wait,
            close_received: false,
            acknowledge_received: false,
            linger_timer: None,
            finished: false,
        }
    }

    pub fn received_close_connection(&mut self) {
        self.close_received = true;
    }

    pub fn received_acknowledge_close_connection(&mut self) {
        self.acknowledge_received = true;
    }

    pub fn try_send(&mut self, close_aborted: bool, outbox: &mut Outbox) {
        if self.finished {
            return;
        }
        if close_aborted && !(self.close_received && self.acknowledge_received) {
            warn!(
                peer = %self.peer,
                close_received = self.close_received,
                acknowledge_received = self.acknowledge_received,
                "Close handshake aborted"
            );
            self.emit(outbox);
            return;
        }
        if !(self.close_received && self.acknowledge_received) {
            return;
        }
        let linger_timer = self
            .linger_timer
            .get_or_insert_with(|| self.timers.create(self.linger));
        if linger_timer.is_time() {
            info!(peer = %self.peer, "Connection closed");
            self.emit(outbox);
        }
    }

    fn emit(&mut self, outbox: &mut Outbox) {
        outbox.notify(&self.peer, Message::ConnectionIsClosed);
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[derive(Debug)]
pub struct ConnectionCloser {
    peer: Peer,
    close_sender: CloseConnectionSender,
    closed_sender: ConnectionIsClosedSender,
}

impl ConnectionCloser {
    pub fn new(peer: Peer, timers: &TimerFactory, timeouts: &PeerTimeouts) -> Self {
        Self {
            close_sender: CloseConnectionSender::new(peer.clone(), timers, timeouts),
            closed_sender: ConnectionIsClosedSender::new(peer.clone(), timers, timeouts),
            peer,
        }
    }

    /// Acknowledged every time, also before this side started closing
    pub fn received_close_connection(&mut self, outbox: &mut Outbox) {
        outbox.send(&self.peer, Message::AcknowledgeCloseConnection);
        self.closed_sender.received_close_connection();
    }

    pub fn received_acknowledge_close_connection(&mut self) {
        if !self.close_sender.is_started() {
            debug!(peer = %self.peer, "AcknowledgeCloseConnection before CloseConnection was sent");
            return;
        }
        self.close_sender.received_acknowledge_close_connection();
        self.closed_sender.received_acknowledge_close_connection();
    }

    pub fn try_send(&mut self, outbox: &mut Outbox) {
        self.close_sender.try_send(outbox);
        let aborted = self.close_sender.is_abort_time();
        self.closed_sender.try_send(aborted, outbox);
    }

    pub fn is_started(&self) -> bool {
        self.close_sender.is_started()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_sender.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::test_support::{manual_timers, ms, peer, timeouts};

    fn closed_notifications(outbox: &mut Outbox) -> usize {
        outbox
            .take_local()
            .iter()
            .filter(|n| n.message == Message::ConnectionIsClosed)
            .count()
    }

    #[test]
    fn test_close_is_sent_on_first_tick_and_retried() {
        let (clock, timers) = manual_timers();
        let mut outbox = Outbox::new();
        let mut closer = ConnectionCloser::new(peer("b"), &timers, &timeouts());
        assert!(!closer.is_started());

        closer.try_send(&mut outbox);
        assert_eq!(outbox.take_outgoing()[0].message, Message::CloseConnection);

        closer.try_send(&mut outbox);
        assert!(outbox.take_outgoing().is_empty());

        clock.advance(ms(10));
        closer.try_send(&mut outbox);
        assert_eq!(outbox.take_outgoing().len(), 1);
    }

    #[test]
    fn test_closed_after_both_conditions_and_linger() {
        for close_first in [true, false] {
            let (clock, timers) = manual_timers();
            let mut outbox = Outbox::new();
            let mut closer = ConnectionCloser::new(peer("b"), &timers, &timeouts());
            closer.try_send(&mut outbox);

            if close_first {
                closer.received_close_connection(&mut outbox);
                closer.received_acknowledge_close_connection();
            } else {
                closer.received_acknowledge_close_connection();
                closer.received_close_connection(&mut outbox);
            }

            closer.try_send(&mut outbox);
            assert_eq!(closed_notifications(&mut outbox), 0);
            assert!(!closer.is_closed());

            clock.advance(ms(50));
            closer.try_send(&mut outbox);
            assert_eq!(closed_notifications(&mut outbox), 1);
            assert!(closer.is_closed());

            closer.try_send(&mut outbox);
            assert_eq!(closed_notifications(&mut outbox), 0);
        }
    }

    #[test]
    fn test_abort_closes_unresponsive_peer() {
        let (clock, timers) = manual_timers();
        let mut outbox = Outbox::new();
        let mut closer = ConnectionCloser::new(peer("gone"), &timers, &timeouts());
        closer.try_send(&mut outbox);

        clock.advance(ms(999));
        closer.try_send(&mut outbox);
        assert!(!closer.is_closed());

        clock.advance(ms(1));
        closer.try_send(&mut outbox);
        assert!(closer.is_closed());
        assert_eq!(closed_notifications(&mut outbox), 1);
    }

    #[test]
    fn test_abort_when_acknowledged_but_peer_never_closes() {
        let (clock, timers) = manual_timers();
        let mut outbox = Outbox::new();
        let mut closer = ConnectionCloser::new(peer("b"), &timers, &timeouts());
        closer.try_send(&mut outbox);
        closer.received_acknowledge_close_connection();

        clock.advance(ms(1000));
        closer.try_send(&mut outbox);
        assert!(closer.is_closed());
    }

    #[test]
    fn test_close_is_acknowledged_before_local_stop() {
        let (_clock, timers) = manual_timers();
        let mut outbox = Outbox::new();
        let mut closer = ConnectionCloser::new(peer("b"), &timers, &timeouts());

        closer.received_close_connection(&mut outbox);
        closer.received_close_connection(&mut outbox);
        let sent: Vec<_> = outbox.take_outgoing().into_iter().map(|m| m.message).collect();
        assert_eq!(sent, vec![Message::AcknowledgeCloseConnection; 2]);

        // A stray acknowledgement cannot satisfy a close we never sent.
        closer.received_acknowledge_close_connection();
        closer.try_send(&mut outbox);
        assert!(!closer.is_closed());
    }
}
