//! Discovery among the local leaders of all machines

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::peer_communicator::PeerCommunicator;

use super::{Discovery, DiscoveryConfig};

/// The local leader on the discovery leader node binds the global address;
/// every other local leader pings it.
#[derive(Debug, Clone)]
pub struct MultiNodeDiscovery {
    config: DiscoveryConfig,
}

impl MultiNodeDiscovery {
    pub fn new(
        global_address: &str,
        is_discovery_leader_node: bool,
        forward_register_peer: bool,
        ping_interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let leader_address = resolve(global_address)?;
        debug!(address = %leader_address, "Resolved multi-node discovery address");
        Ok(Self {
            config: DiscoveryConfig {
                leader_address,
                is_leader: is_discovery_leader_node,
                forward_register_peer,
                ping_interval,
                timeout,
            },
        })
    }

    pub fn leader_address(&self) -> SocketAddr {
        self.config.leader_address
    }

    pub async fn discover(&self, communicator: &PeerCommunicator) -> Result<()> {
        Discovery::new(self.config.clone()).run(communicator).await
    }
}

fn resolve(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|e| Error::DiscoveryFailed {
            message: format!("cannot resolve '{}': {}", address, e),
        })?
        .next()
        .ok_or_else(|| Error::DiscoveryFailed {
            message: format!("'{}' resolved to no address", address),
        })
}
