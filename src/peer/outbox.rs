//! Output buffer of the state machines
//!
//! Wire messages go to `outgoing`; events for the control loop itself
//! (readiness, aborts, delivered payloads, closure) go to `local`.

use crate::protocol::{Message, Peer};
use crate::transport::Frame;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub destination: Peer,
    pub message: Message,
    pub payload: Vec<Frame>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNotification {
    /// Peer whose state machine raised the notification
    pub peer: Peer,
    pub message: Message,
    pub payload: Vec<Frame>,
}

#[derive(Debug, Default)]
pub struct Outbox {
    outgoing: Vec<OutgoingMessage>,
    local: Vec<LocalNotification>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, destination: &Peer, message: Message) {
        self.send_with_payload(destination, message, Vec::new());
    }

    pub fn send_with_payload(&mut self, destination: &Peer, message: Message, payload: Vec<Frame>) {
        self.outgoing.push(OutgoingMessage {
            destination: destination.clone(),
            message,
            payload,
        });
    }

    pub fn notify(&mut self, peer: &Peer, message: Message) {
        self.notify_with_payload(peer, message, Vec::new());
    }

    pub fn notify_with_payload(&mut self, peer: &Peer, message: Message, payload: Vec<Frame>) {
        self.local.push(LocalNotification {
            peer: peer.clone(),
            message,
            payload,
        });
    }

    pub fn take_outgoing(&mut self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn take_local(&mut self) -> Vec<LocalNotification> {
        std::mem::take(&mut self.local)
    }

    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.local.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::test_support::peer;

    #[test]
    fn test_take_empties_each_queue_independently() {
        let mut outbox = Outbox::new();
        outbox.send(&peer("a"), Message::AcknowledgeConnection);
        outbox.notify(&peer("a"), Message::ConnectionIsReady);

        let sent = outbox.take_outgoing();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, peer("a"));
        assert!(!outbox.is_empty());

        assert_eq!(outbox.take_local().len(), 1);
        assert!(outbox.is_empty());
    }
}
