//! State the control loop publishes to the communicator's callers
//!
//! The control loop is the only writer of peer state machines. What callers
//! need to observe (readiness, delivered payloads, closure) is mirrored here
//! behind one lock.

use std::collections::{BTreeMap, VecDeque};

use crate::peer::PeerLifecycle;
use crate::protocol::Peer;
use crate::transport::Frame;

/// One entry of a peer's application inbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxItem {
    Payload(Vec<Frame>),
    /// One of our payloads to this peer was given up on
    Aborted { sequence_number: u64, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct PeerStatus {
    pub connection_ready: bool,
    pub forwarder_ready: bool,
    pub closed: bool,
    pub lifecycle: Option<PeerLifecycle>,
    pub inbox: VecDeque<InboxItem>,
}

impl PeerStatus {
    pub fn is_ready(&self) -> bool {
        self.connection_ready && self.forwarder_ready
    }
}

#[derive(Debug, Default)]
pub struct FrontendState {
    pub peers: BTreeMap<Peer, PeerStatus>,
    /// The control loop has exited and released the transport
    pub stopped: bool,
}

impl FrontendState {
    pub fn ready_peers(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|(_, status)| status.is_ready())
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub fn status_mut(&mut self, peer: &Peer) -> &mut PeerStatus {
        self.peers.entry(peer.clone()).or_default()
    }
}
