//! Discovery among the instances of one machine

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::error::Result;
use crate::peer_communicator::PeerCommunicator;

use super::{Discovery, DiscoveryConfig};

/// The instance at local position 0 leads; the others ping
/// `127.0.0.1:<port>`.
#[derive(Debug, Clone)]
pub struct LocalhostDiscovery {
    config: DiscoveryConfig,
}

impl LocalhostDiscovery {
    pub fn new(
        port: u16,
        is_leader: bool,
        forward_register_peer: bool,
        ping_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            config: DiscoveryConfig {
                leader_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)),
                is_leader,
                forward_register_peer,
                ping_interval,
                timeout,
            },
        }
    }

    pub fn leader_address(&self) -> SocketAddr {
        self.config.leader_address
    }

    pub async fn discover(&self, communicator: &PeerCommunicator) -> Result<()> {
        Discovery::new(self.config.clone()).run(communicator).await
    }
}
