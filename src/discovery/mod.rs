//! Peer discovery
//!
//! Resolves peer addresses before the handshakes start. A discovery leader
//! listens on a well-known UDP address; followers ping it until their peer
//! communicator reports every peer connected.
//!
//! ```text
//! follower ── Ping{source} ────────────▶ leader   (leader registers follower)
//! follower ◀─ Pong{source, peers} ────── leader   (follower registers leader + peers)
//! ```
//!
//! With registration forwarding enabled the leader's `Pong` lists no peers;
//! the leader introduces them over the peer protocol instead.

mod localhost;
mod multi_node;

pub use localhost::LocalhostDiscovery;
pub use multi_node::MultiNodeDiscovery;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::peer_communicator::PeerCommunicator;
use crate::protocol::ConnectionInfo;

/// Largest datagram we expect; a `Pong` lists at most a few hundred peers
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Pings the leader has to miss in a row before it stops answering
const LEADER_LINGER_PINGS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryMessage {
    Ping { source: ConnectionInfo },
    Pong { source: ConnectionInfo, peers: Vec<ConnectionInfo> },
}

impl DiscoveryMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self> {
        serde_json::from_slice(datagram).map_err(|e| Error::malformed(format!("invalid discovery message: {}", e)))
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Where the discovery leader listens
    pub leader_address: SocketAddr,

    pub is_leader: bool,

    /// Registration forwarding is enabled in the peer communicator
    pub forward_register_peer: bool,

    pub ping_interval: Duration,

    pub timeout: Duration,
}

/// One discovery run for one peer communicator
pub struct Discovery {
    config: DiscoveryConfig,
    registered: BTreeSet<ConnectionInfo>,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            registered: BTreeSet::new(),
        }
    }

    /// Run until every expected peer is connected
    pub async fn run(mut self, communicator: &PeerCommunicator) -> Result<()> {
        if communicator.number_of_peers() <= 1 {
            return Ok(());
        }
        let deadline = Instant::now() + self.config.timeout;
        if self.config.is_leader {
            self.run_leader(communicator, deadline).await
        } else {
            self.run_follower(communicator, deadline).await
        }
    }

    async fn register(&mut self, communicator: &PeerCommunicator, info: &ConnectionInfo) {
        if info == communicator.my_connection_info() || self.registered.contains(info) {
            return;
        }
        match communicator.register_peer(info.clone()).await {
            Ok(()) => {
                debug!(peer = %info, "Discovered peer");
                self.registered.insert(info.clone());
            }
            Err(e @ Error::DuplicatePeer { .. }) => {
                trace!(peer = %info, error = %e, "Already registered");
                self.registered.insert(info.clone());
            }
            Err(e) => warn!(peer = %info, error = %e, "Ignoring discovered peer"),
        }
    }

    fn timed_out(&self, communicator: &PeerCommunicator) -> Error {
        let expected = communicator.number_of_peers().saturating_sub(1);
        let found = communicator.ready_peers().len();
        warn!(expected, found, "Discovery timed out");
        Error::DiscoveryTimeout {
            expected,
            found,
            timeout_ms: self.config.timeout.as_millis() as u64,
        }
    }

    async fn run_leader(&mut self, communicator: &PeerCommunicator, deadline: Instant) -> Result<()> {
        let socket = UdpSocket::bind(self.config.leader_address)
            .await
            .map_err(|source| Error::BindFailed {
                address: self.config.leader_address.to_string(),
                source,
            })?;
        info!(address = %self.config.leader_address, "Discovery leader listening");

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut last_ping = Instant::now();
        let linger = self.config.ping_interval * LEADER_LINGER_PINGS;

        loop {
            if communicator.are_all_peers_connected() && last_ping.elapsed() >= linger {
                info!(peers = self.registered.len(), "Discovery finished");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(self.timed_out(communicator));
            }

            let received =
                tokio::time::timeout(self.config.ping_interval, socket.recv_from(&mut buffer)).await;
            let (len, from) = match received {
                Err(_) => continue,
                Ok(Err(e)) => {
                    debug!(error = %e, "Discovery receive failed");
                    continue;
                }
                Ok(Ok(received)) => received,
            };
            let source = match DiscoveryMessage::decode(&buffer[..len]) {
                Ok(DiscoveryMessage::Ping { source }) => source,
                Ok(other) => {
                    debug!(from = %from, message = ?other, "Unexpected discovery message");
                    continue;
                }
                Err(e) => {
                    debug!(from = %from, error = %e, "Dropping discovery datagram");
                    continue;
                }
            };
            if source.group_identifier != communicator.my_connection_info().group_identifier {
                debug!(source = %source, "Ping from another group");
                continue;
            }

            last_ping = Instant::now();
            self.register(communicator, &source).await;

            let peers = if self.config.forward_register_peer {
                Vec::new()
            } else {
                self.registered.iter().cloned().collect()
            };
            let pong = DiscoveryMessage::Pong {
                source: communicator.my_connection_info().clone(),
                peers,
            };
            if let Err(e) = socket.send_to(&pong.encode()?, from).await {
                debug!(to = %from, error = %e, "Failed to send Pong");
            }
        }
    }

    async fn run_follower(&mut self, communicator: &PeerCommunicator, deadline: Instant) -> Result<()> {
        let bind_address = match self.config.leader_address {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let socket = UdpSocket::bind(bind_address).await.map_err(|source| Error::BindFailed {
            address: bind_address.to_string(),
            source,
        })?;
        let ping = DiscoveryMessage::Ping {
            source: communicator.my_connection_info().clone(),
        }
        .encode()?;

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut next_ping = Instant::now();

        loop {
            if communicator.are_all_peers_connected() {
                info!(peers = self.registered.len(), "Discovery finished");
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(communicator));
            }
            if now >= next_ping {
                trace!(leader = %self.config.leader_address, "Ping");
                if let Err(e) = socket.send_to(&ping, self.config.leader_address).await {
                    debug!(leader = %self.config.leader_address, error = %e, "Failed to send Ping");
                }
                next_ping = now + self.config.ping_interval;
            }

            let received = tokio::time::timeout_at(next_ping, socket.recv_from(&mut buffer)).await;
            let Ok(Ok((len, from))) = received else {
                continue;
            };
            match DiscoveryMessage::decode(&buffer[..len]) {
                Ok(DiscoveryMessage::Pong { source, peers }) => {
                    self.register(communicator, &source).await;
                    for peer in &peers {
                        self.register(communicator, peer).await;
                    }
                }
                Ok(other) => debug!(from = %from, message = ?other, "Unexpected discovery message"),
                Err(e) => debug!(from = %from, error = %e, "Dropping discovery datagram"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_messages_are_tagged_json() {
        let ping = DiscoveryMessage::Ping {
            source: ConnectionInfo::new("a", "127.0.0.1", 7000, "g"),
        };
        let json: serde_json::Value = serde_json::from_slice(&ping.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "PING");
        assert_eq!(json["source"]["port"], 7000);
        assert_eq!(DiscoveryMessage::decode(&ping.encode().unwrap()).unwrap(), ping);
    }

    #[test]
    fn test_garbage_datagram_is_malformed() {
        let err = DiscoveryMessage::decode(b"\x00\x01").unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed { .. }));
    }
}
