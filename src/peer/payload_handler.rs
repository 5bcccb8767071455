//! Reliable payload delivery with one peer
//!
//! Every payload gets a sequence number and is retransmitted until the peer
//! acknowledges it or the abort timer for that payload fires. The receiver
//! acknowledges every copy, drops duplicates and hands payloads to the
//! application strictly in sequence order.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::protocol::{Message, Peer};
use crate::timer::{Timer, TimerFactory};
use crate::transport::Frame;

use super::{Outbox, PeerTimeouts};

// ─────────────────────────────────────────────────────────────────
// Sender
// ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct InFlight {
    payload: Vec<Frame>,
    retry_timer: Timer,
    abort_timer: Timer,
    transmissions: u32,
}

#[derive(Debug)]
pub struct PayloadSender {
    peer: Peer,
    timers: TimerFactory,
    retry_timeout: Duration,
    abort_timeout: Duration,
    next_sequence_number: u64,
    in_flight: BTreeMap<u64, InFlight>,
}

impl PayloadSender {
    pub fn new(peer: Peer, timers: &TimerFactory, timeouts: &PeerTimeouts) -> Self {
        Self {
            peer,
            timers: timers.clone(),
            retry_timeout: timeouts.payload_retry,
            abort_timeout: timeouts.payload_abort,
            next_sequence_number: 0,
            in_flight: BTreeMap::new(),
        }
    }

    /// Oldest sequence number the peer may still receive from us
    fn first_unacknowledged(&self) -> u64 {
        self.in_flight
            .keys()
            .next()
            .copied()
            .unwrap_or(self.next_sequence_number)
    }

    fn transmit(&self, sequence_number: u64, payload: Vec<Frame>, outbox: &mut Outbox) {
        outbox.send_with_payload(
            &self.peer,
            Message::Payload {
                sequence_number,
                first_unacknowledged: self.first_unacknowledged(),
            },
            payload,
        );
    }

    /// Queue a payload and transmit it right away; returns its sequence number
    pub fn send_payload(&mut self, payload: Vec<Frame>, outbox: &mut Outbox) -> u64 {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;
        self.in_flight.insert(
            sequence_number,
            InFlight {
                payload: payload.clone(),
                retry_timer: self.timers.create(self.retry_timeout),
                abort_timer: self.timers.create(self.abort_timeout),
                transmissions: 1,
            },
        );
        self.transmit(sequence_number, payload, outbox);
        sequence_number
    }

    pub fn received_acknowledge_payload(&mut self, sequence_number: u64) {
        if self.in_flight.remove(&sequence_number).is_some() {
            trace!(peer = %self.peer, sequence_number, "Payload acknowledged");
        }
    }

    pub fn try_send(&mut self, outbox: &mut Outbox) {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.abort_timer.is_time())
            .map(|(seq, _)| *seq)
            .collect();
        for sequence_number in expired {
            if let Some(entry) = self.in_flight.remove(&sequence_number) {
                warn!(
                    peer = %self.peer,
                    sequence_number,
                    transmissions = entry.transmissions,
                    "Payload aborted, no acknowledgement"
                );
                outbox.notify(
                    &self.peer,
                    Message::AbortPayload {
                        sequence_number,
                        reason: format!("not acknowledged after {} transmissions", entry.transmissions),
                    },
                );
            }
        }

        let first_unacknowledged = self.first_unacknowledged();
        for (sequence_number, entry) in self.in_flight.iter_mut() {
            if entry.retry_timer.is_time() {
                entry.transmissions += 1;
                entry.retry_timer.reset_timer();
                outbox.send_with_payload(
                    &self.peer,
                    Message::Payload {
                        sequence_number: *sequence_number,
                        first_unacknowledged,
                    },
                    entry.payload.clone(),
                );
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_ready_to_stop(&self) -> bool {
        self.in_flight.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────
// Receiver
// ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PayloadReceiver {
    peer: Peer,
    next_sequence_number: u64,
    buffered: BTreeMap<u64, Vec<Frame>>,
}

impl PayloadReceiver {
    pub fn new(peer: Peer) -> Self {
        Self {
            peer,
            next_sequence_number: 0,
            buffered: BTreeMap::new(),
        }
    }

    pub fn received_payload(
        &mut self,
        sequence_number: u64,
        first_unacknowledged: u64,
        payload: Vec<Frame>,
        outbox: &mut Outbox,
    ) {
        outbox.send(&self.peer, Message::AcknowledgePayload { sequence_number });

        if first_unacknowledged > self.next_sequence_number {
            self.skip_abandoned(first_unacknowledged, outbox);
        }

        if sequence_number < self.next_sequence_number || self.buffered.contains_key(&sequence_number) {
            trace!(peer = %self.peer, sequence_number, "Duplicate payload");
            return;
        }
        self.buffered.insert(sequence_number, payload);
        self.deliver_in_order(outbox);
    }

    /// The sender gave up on everything below `first_unacknowledged`;
    /// release what did arrive and stop waiting for the rest.
    fn skip_abandoned(&mut self, first_unacknowledged: u64, outbox: &mut Outbox) {
        let keep = self.buffered.split_off(&first_unacknowledged);
        let arrived = std::mem::replace(&mut self.buffered, keep);
        let skipped = first_unacknowledged - self.next_sequence_number - arrived.len() as u64;
        debug!(
            peer = %self.peer,
            from = self.next_sequence_number,
            to = first_unacknowledged,
            skipped,
            "Skipping payloads abandoned by sender"
        );
        for (sequence_number, payload) in arrived {
            self.deliver(sequence_number, first_unacknowledged, payload, outbox);
        }
        self.next_sequence_number = first_unacknowledged;
    }

    fn deliver_in_order(&mut self, outbox: &mut Outbox) {
        while let Some(payload) = self.buffered.remove(&self.next_sequence_number) {
            let sequence_number = self.next_sequence_number;
            self.next_sequence_number += 1;
            self.deliver(sequence_number, sequence_number, payload, outbox);
        }
    }

    fn deliver(&self, sequence_number: u64, first_unacknowledged: u64, payload: Vec<Frame>, outbox: &mut Outbox) {
        outbox.notify_with_payload(
            &self.peer,
            Message::Payload {
                sequence_number,
                first_unacknowledged,
            },
            payload,
        );
    }

    /// Next sequence number the application will see
    pub fn next_sequence_number(&self) -> u64 {
        self.next_sequence_number
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }

    /// Out-of-order payloads are still waiting for a gap to fill
    pub fn is_ready_to_stop(&self) -> bool {
        self.buffered.is_empty()
    }

    /// The sender is closing, so no gap below the buffered payloads will
    /// ever fill. Deliver everything that arrived.
    pub fn release_buffered(&mut self, outbox: &mut Outbox) {
        let Some((&last, _)) = self.buffered.last_key_value() else {
            return;
        };
        self.skip_abandoned(last + 1, outbox);
    }
}

// ─────────────────────────────────────────────────────────────────
// Composite
// ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PayloadHandler {
    sender: PayloadSender,
    receiver: PayloadReceiver,
}

impl PayloadHandler {
    pub fn new(peer: Peer, timers: &TimerFactory, timeouts: &PeerTimeouts) -> Self {
        Self {
            sender: PayloadSender::new(peer.clone(), timers, timeouts),
            receiver: PayloadReceiver::new(peer),
        }
    }

    pub fn send_payload(&mut self, payload: Vec<Frame>, outbox: &mut Outbox) -> u64 {
        self.sender.send_payload(payload, outbox)
    }

    pub fn received_payload(
        &mut self,
        sequence_number: u64,
        first_unacknowledged: u64,
        payload: Vec<Frame>,
        outbox: &mut Outbox,
    ) {
        self.receiver
            .received_payload(sequence_number, first_unacknowledged, payload, outbox);
    }

    pub fn received_acknowledge_payload(&mut self, sequence_number: u64) {
        self.sender.received_acknowledge_payload(sequence_number);
    }

    pub fn try_send(&mut self, outbox: &mut Outbox) {
        self.sender.try_send(outbox);
    }

    pub fn sender(&self) -> &PayloadSender {
        &self.sender
    }

    pub fn receiver(&self) -> &PayloadReceiver {
        &self.receiver
    }

    /// Peer announced its close; flush whatever the receive buffer holds
    pub fn release_receive_buffer(&mut self, outbox: &mut Outbox) {
        self.receiver.release_buffered(outbox);
    }

    /// Both our unacknowledged payloads and a gap in the receive buffer
    /// hold the close back.
    pub fn is_ready_to_stop(&self) -> bool {
        self.sender.is_ready_to_stop() && self.receiver.is_ready_to_stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::test_support::{manual_timers, ms, peer, timeouts};

    fn frames(s: &str) -> Vec<Frame> {
        vec![s.as_bytes().to_vec()]
    }

    fn delivered(outbox: &mut Outbox) -> Vec<(u64, Vec<Frame>)> {
        outbox
            .take_local()
            .into_iter()
            .filter_map(|n| match n.message {
                Message::Payload { sequence_number, .. } => Some((sequence_number, n.payload)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_sender_numbers_payloads_and_retries() {
        let (clock, timers) = manual_timers();
        let mut outbox = Outbox::new();
        let mut sender = PayloadSender::new(peer("b"), &timers, &timeouts());

        assert_eq!(sender.send_payload(frames("a"), &mut outbox), 0);
        assert_eq!(sender.send_payload(frames("b"), &mut outbox), 1);
        assert_eq!(outbox.take_outgoing().len(), 2);

        sender.received_acknowledge_payload(0);
        clock.advance(ms(10));
        sender.try_send(&mut outbox);
        let resent = outbox.take_outgoing();
        assert_eq!(resent.len(), 1);
        assert_eq!(
            resent[0].message,
            Message::Payload {
                sequence_number: 1,
                first_unacknowledged: 1
            }
        );
        assert_eq!(resent[0].payload, frames("b"));

        sender.received_acknowledge_payload(1);
        assert!(sender.is_ready_to_stop());
    }

    #[test]
    fn test_sender_aborts_after_deadline() {
        let (clock, timers) = manual_timers();
        let mut outbox = Outbox::new();
        let mut sender = PayloadSender::new(peer("b"), &timers, &timeouts());
        sender.send_payload(frames("lost"), &mut outbox);

        clock.advance(ms(1000));
        sender.try_send(&mut outbox);
        let local = outbox.take_local();
        assert_eq!(local.len(), 1);
        assert!(matches!(local[0].message, Message::AbortPayload { sequence_number: 0, .. }));
        assert!(sender.is_ready_to_stop());

        // The next payload tells the receiver not to wait for 0.
        outbox.take_outgoing();
        sender.send_payload(frames("next"), &mut outbox);
        assert_eq!(
            outbox.take_outgoing()[0].message,
            Message::Payload {
                sequence_number: 1,
                first_unacknowledged: 1
            }
        );
    }

    #[test]
    fn test_receiver_acknowledges_and_drops_duplicates() {
        let mut outbox = Outbox::new();
        let mut receiver = PayloadReceiver::new(peer("a"));

        receiver.received_payload(0, 0, frames("x"), &mut outbox);
        receiver.received_payload(0, 0, frames("x"), &mut outbox);
        assert_eq!(outbox.take_outgoing().len(), 2);
        assert_eq!(delivered(&mut outbox), vec![(0, frames("x"))]);
    }

    #[test]
    fn test_receiver_restores_order() {
        let mut outbox = Outbox::new();
        let mut receiver = PayloadReceiver::new(peer("a"));

        receiver.received_payload(2, 0, frames("c"), &mut outbox);
        receiver.received_payload(1, 0, frames("b"), &mut outbox);
        assert!(delivered(&mut outbox).is_empty());
        assert_eq!(receiver.buffered(), 2);

        receiver.received_payload(0, 0, frames("a"), &mut outbox);
        let got: Vec<u64> = delivered(&mut outbox).into_iter().map(|(s, _)| s).collect();
        assert_eq!(got, vec![0, 1, 2]);
        assert_eq!(receiver.next_sequence_number(), 3);
        assert_eq!(receiver.buffered(), 0);
    }

    #[test]
    fn test_receiver_skips_abandoned_gap() {
        let mut outbox = Outbox::new();
        let mut receiver = PayloadReceiver::new(peer("a"));

        receiver.received_payload(1, 0, frames("b"), &mut outbox);
        assert!(delivered(&mut outbox).is_empty());

        // Sender aborted 0 and 2; 3 is the oldest still in flight.
        receiver.received_payload(3, 3, frames("d"), &mut outbox);
        let got: Vec<u64> = delivered(&mut outbox).into_iter().map(|(s, _)| s).collect();
        assert_eq!(got, vec![1, 3]);
        assert_eq!(receiver.next_sequence_number(), 4);
    }

    #[test]
    fn test_handler_stop_waits_for_receive_gaps() {
        let (_clock, timers) = manual_timers();
        let mut outbox = Outbox::new();
        let mut handler = PayloadHandler::new(peer("b"), &timers, &timeouts());
        handler.received_payload(5, 0, frames("late"), &mut outbox);
        handler.received_payload(3, 0, frames("early"), &mut outbox);
        assert!(!handler.is_ready_to_stop());
        assert!(delivered(&mut outbox).is_empty());

        handler.release_receive_buffer(&mut outbox);
        assert!(handler.is_ready_to_stop());
        assert_eq!(delivered(&mut outbox), vec![(3, frames("early")), (5, frames("late"))]);
        assert_eq!(handler.receiver().next_sequence_number(), 6);
        assert_eq!(handler.receiver().buffered(), 0);

        let seq = handler.send_payload(frames("mine"), &mut outbox);
        assert!(!handler.is_ready_to_stop());
        handler.received_acknowledge_payload(seq);
        assert!(handler.is_ready_to_stop());
    }

    #[test]
    fn test_release_with_empty_buffer_is_noop() {
        let mut outbox = Outbox::new();
        let mut receiver = PayloadReceiver::new(peer("b"));
        receiver.received_payload(0, 0, frames("a"), &mut outbox);
        outbox.take_local();

        receiver.release_buffered(&mut outbox);
        assert!(outbox.take_local().is_empty());
        assert_eq!(receiver.next_sequence_number(), 1);
    }
}
