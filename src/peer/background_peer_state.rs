//! Everything a communicator knows about one remote peer

use tracing::{debug, trace};

use crate::protocol::{Message, Peer};
use crate::timer::TimerFactory;
use crate::transport::Frame;

use super::{
    ConnectionCloser, ConnectionEstablisher, EstablisherState, Outbox, PayloadHandler, PeerTimeouts,
    RegisterPeerForwarder, RegisterPeerForwarderBehaviorConfig,
};

/// Coarse lifecycle of one peer, derived from its state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerLifecycle {
    /// Introduction through the leader not finished yet
    Registering,
    /// Handshake not acknowledged yet
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl std::fmt::Display for PeerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PeerLifecycle::Registering => "registering",
            PeerLifecycle::Connecting => "connecting",
            PeerLifecycle::Connected => "connected",
            PeerLifecycle::Closing => "closing",
            PeerLifecycle::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct BackgroundPeerState {
    peer: Peer,
    establisher: ConnectionEstablisher,
    forwarder: RegisterPeerForwarder,
    payload_handler: PayloadHandler,
    closer: ConnectionCloser,
    stop_requested: bool,
}

impl BackgroundPeerState {
    /// Creating the state starts the handshake
    pub fn new(
        peer: Peer,
        behavior: RegisterPeerForwarderBehaviorConfig,
        timers: &TimerFactory,
        timeouts: &PeerTimeouts,
        outbox: &mut Outbox,
    ) -> Self {
        Self {
            establisher: ConnectionEstablisher::new(peer.clone(), timers, timeouts, outbox),
            forwarder: RegisterPeerForwarder::new(peer.clone(), behavior, timers, timeouts),
            payload_handler: PayloadHandler::new(peer.clone(), timers, timeouts),
            closer: ConnectionCloser::new(peer.clone(), timers, timeouts),
            stop_requested: false,
            peer,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Route one wire message to the state machine that owns it.
    ///
    /// `source` is the endpoint that sent it. For registration forwarding
    /// that is the leader (or a target), not the peer this state is about.
    pub fn received(&mut self, message: Message, source: &Peer, payload: Vec<Frame>, outbox: &mut Outbox) {
        trace!(peer = %self.peer, source = %source, message = %message, "Dispatching");
        match message {
            Message::SynchronizeConnection { attempt } => {
                self.establisher.received_synchronize_connection(attempt, outbox)
            }
            Message::AcknowledgeConnection => self.establisher.received_acknowledge_connection(outbox),
            Message::RegisterPeer { .. } => self.forwarder.received_register_peer(source, outbox),
            Message::AcknowledgeRegisterPeer { .. } => {
                self.forwarder.received_acknowledge_register_peer(source, outbox)
            }
            Message::RegisterPeerComplete { .. } => self.forwarder.received_register_peer_complete(),
            Message::Payload {
                sequence_number,
                first_unacknowledged,
            } => self
                .payload_handler
                .received_payload(sequence_number, first_unacknowledged, payload, outbox),
            Message::AcknowledgePayload { sequence_number } => {
                self.payload_handler.received_acknowledge_payload(sequence_number)
            }
            Message::CloseConnection => {
                self.payload_handler.release_receive_buffer(outbox);
                self.closer.received_close_connection(outbox)
            }
            Message::AcknowledgeCloseConnection => self.closer.received_acknowledge_close_connection(),
            Message::PeerRegisterForwarderIsReady { .. }
            | Message::ConnectionIsReady
            | Message::AbortPayload { .. }
            | Message::ConnectionIsClosed
            | Message::Timeout { .. } => {
                debug!(peer = %self.peer, message = %message, "Local notification arrived on the wire, dropping");
            }
        }
    }

    pub fn send_payload(&mut self, payload: Vec<Frame>, outbox: &mut Outbox) -> u64 {
        self.payload_handler.send_payload(payload, outbox)
    }

    /// Leader only: introduce this peer to `target`
    pub fn add_register_target(&mut self, target: &Peer, outbox: &mut Outbox) {
        self.forwarder.add_target(target, outbox);
    }

    /// Start closing once nothing else is in flight
    pub fn prepare_to_stop(&mut self) {
        if !self.stop_requested {
            debug!(peer = %self.peer, "Preparing to stop");
            self.stop_requested = true;
        }
    }

    pub fn try_send(&mut self, outbox: &mut Outbox) {
        self.establisher.try_send(outbox);
        self.forwarder.try_send(outbox);
        self.payload_handler.try_send(outbox);

        if self.stop_requested
            && (self.closer.is_started()
                || (self.establisher.is_ready_to_stop()
                    && self.forwarder.is_ready_to_stop()
                    && self.payload_handler.is_ready_to_stop()))
        {
            self.closer.try_send(outbox);
        }
    }

    pub fn lifecycle(&self) -> PeerLifecycle {
        if self.closer.is_closed() {
            PeerLifecycle::Closed
        } else if self.stop_requested {
            PeerLifecycle::Closing
        } else if !self.forwarder.is_ready() {
            PeerLifecycle::Registering
        } else if !self.establisher.is_established() {
            PeerLifecycle::Connecting
        } else {
            PeerLifecycle::Connected
        }
    }

    pub fn establisher_state(&self) -> EstablisherState {
        self.establisher.state()
    }

    pub fn behavior(&self) -> RegisterPeerForwarderBehaviorConfig {
        self.forwarder.behavior()
    }

    pub fn payloads_in_flight(&self) -> usize {
        self.payload_handler.sender().in_flight()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }
}
