//! Collective operations across all instances of a run
//!
//! Instances are grouped per machine. Every instance joins the localhost
//! group; the local leader of each machine also joins the multi-node group.
//!
//! ```text
//!   node A                         node B
//!  ┌───────────────┐              ┌───────────────┐
//!  │ a0* ◀─ a1, a2 │ ◀─ multi ──▶ │ b0* ◀─ b1, b2 │
//!  └───────────────┘     node     └───────────────┘
//!        * local leader (minimum peer of the node)
//! ```
//!
//! `gather` flows towards the multi-node leader, `broadcast` flows away from it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::discovery::{LocalhostDiscovery, MultiNodeDiscovery};
use crate::error::{Error, Result};
use crate::peer::PeerTimeouts;
use crate::peer_communicator::{PeerCommunicator, PeerCommunicatorConfig};
use crate::protocol::{ConnectionInfo, Peer};
use crate::transport::{FaultInjectionConfig, FaultInjectionSocketFactory, SocketFactory, TcpSocketFactory};

/// Runtime settings of one instance
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    pub instance_name: String,
    pub group_identifier: String,
    pub node_name: String,

    /// Position of this instance on its machine; 0 leads localhost discovery
    pub local_position: usize,
    pub instances_per_node: usize,
    pub number_of_nodes: usize,

    /// This machine hosts the multi-node discovery leader
    pub is_discovery_leader_node: bool,
    pub local_discovery_port: u16,
    /// `host:port` the multi-node discovery leader listens on
    pub global_discovery_address: String,
    /// Address other machines reach this one at
    pub node_ip: String,

    pub forward_register_peer: bool,
    pub ping_interval: Duration,
    pub discovery_timeout: Duration,
    /// Upper bound for each receive inside `gather` and `broadcast`
    pub collective_timeout: Duration,
    pub poll_interval: Duration,
    pub timeouts: PeerTimeouts,
    pub fault_injection: FaultInjectionConfig,
}

impl CommunicatorConfig {
    pub fn localhost_group_identifier(&self) -> String {
        format!("{}/{}", self.group_identifier, self.node_name)
    }

    pub fn multi_node_group_identifier(&self) -> String {
        format!("{}/multi-node", self.group_identifier)
    }

    fn localhost_config(&self) -> PeerCommunicatorConfig {
        let mut config = PeerCommunicatorConfig::new(
            &self.instance_name,
            self.localhost_group_identifier(),
            self.instances_per_node,
        )
        .with_listen_address("127.0.0.1", 0)
        .with_forwarding(self.local_position == 0, self.forward_register_peer)
        .with_timeouts(self.timeouts.clone());
        config.poll_interval = self.poll_interval;
        config
    }

    fn multi_node_config(&self) -> PeerCommunicatorConfig {
        let mut config = PeerCommunicatorConfig::new(
            &self.instance_name,
            self.multi_node_group_identifier(),
            self.number_of_nodes,
        )
        .with_listen_address(&self.node_ip, 0)
        .with_forwarding(self.is_discovery_leader_node, self.forward_register_peer)
        .with_timeouts(self.timeouts.clone());
        config.poll_interval = self.poll_interval;
        config
    }
}

pub struct Communicator {
    config: CommunicatorConfig,
    localhost: PeerCommunicator,
    local_leader: Peer,
    local_peers: Vec<Peer>,
    multi_node: Option<PeerCommunicator>,
    multi_node_leader: Option<Peer>,
    multi_node_peers: Vec<Peer>,
}

impl Communicator {
    /// Discover every instance and connect to it
    pub async fn new(config: CommunicatorConfig) -> Result<Self> {
        let tcp: Arc<dyn SocketFactory> = Arc::new(TcpSocketFactory::default());
        let factory: Arc<dyn SocketFactory> = if config.fault_injection.is_enabled() {
            info!(
                drop_probability = config.fault_injection.drop_probability,
                "Fault injection enabled"
            );
            Arc::new(FaultInjectionSocketFactory::new(tcp, &config.fault_injection))
        } else {
            tcp
        };
        Self::with_factory(config, factory).await
    }

    pub async fn with_factory(config: CommunicatorConfig, factory: Arc<dyn SocketFactory>) -> Result<Self> {
        let localhost = PeerCommunicator::new(config.localhost_config(), Arc::clone(&factory)).await?;

        LocalhostDiscovery::new(
            config.local_discovery_port,
            config.local_position == 0,
            config.forward_register_peer,
            config.ping_interval,
            config.discovery_timeout,
        )
        .discover(&localhost)
        .await?;

        let local_peers = localhost.ready_peers();
        let me = Peer::new(localhost.my_connection_info().clone());
        let local_leader = leader_of(&me, &local_peers);
        let is_local_leader = local_leader == me;
        info!(
            me = %me,
            local_leader = %local_leader,
            local_peers = local_peers.len(),
            "Localhost group connected"
        );

        let mut communicator = Self {
            config,
            localhost,
            local_leader,
            local_peers,
            multi_node: None,
            multi_node_leader: None,
            multi_node_peers: Vec::new(),
        };

        if is_local_leader && communicator.config.number_of_nodes > 1 {
            let multi_node = PeerCommunicator::new(communicator.config.multi_node_config(), factory).await?;
            let discovery = MultiNodeDiscovery::new(
                &communicator.config.global_discovery_address,
                communicator.config.is_discovery_leader_node,
                communicator.config.forward_register_peer,
                communicator.config.ping_interval,
                communicator.config.discovery_timeout,
            );
            let discovered = match discovery {
                Ok(discovery) => discovery.discover(&multi_node).await,
                Err(e) => Err(e),
            };
            if let Err(e) = discovered {
                multi_node.stop().await;
                communicator.localhost.stop().await;
                return Err(e);
            }

            let peers = multi_node.ready_peers();
            let me = Peer::new(multi_node.my_connection_info().clone());
            let leader = leader_of(&me, &peers);
            info!(me = %me, multi_node_leader = %leader, nodes = peers.len() + 1, "Multi-node group connected");
            communicator.multi_node_leader = Some(leader);
            communicator.multi_node_peers = peers;
            communicator.multi_node = Some(multi_node);
        }

        Ok(communicator)
    }

    pub fn my_connection_info(&self) -> &ConnectionInfo {
        self.localhost.my_connection_info()
    }

    fn me(&self) -> Peer {
        Peer::new(self.localhost.my_connection_info().clone())
    }

    pub fn is_local_leader(&self) -> bool {
        self.local_leader == self.me()
    }

    /// Whether this instance collects the result of `gather` and originates
    /// `broadcast`
    pub fn is_multi_node_leader(&self) -> bool {
        if self.config.number_of_nodes <= 1 {
            return self.is_local_leader();
        }
        match (&self.multi_node, &self.multi_node_leader) {
            (Some(multi_node), Some(leader)) => *leader == Peer::new(multi_node.my_connection_info().clone()),
            _ => false,
        }
    }

    pub fn is_discovery_leader_node(&self) -> bool {
        self.config.is_discovery_leader_node
    }

    /// Other instances on this machine, sorted
    pub fn local_peers(&self) -> &[Peer] {
        &self.local_peers
    }

    // ─────────────────────────────────────────────────────────────
    // Collectives
    // ─────────────────────────────────────────────────────────────

    async fn recv_one(&self, communicator: &PeerCommunicator, peer: &Peer) -> Result<Vec<u8>> {
        let frames = communicator
            .recv_timeout(peer, self.config.collective_timeout)
            .await?;
        Ok(frames.into_iter().next().unwrap_or_default())
    }

    /// Collect one value from every instance.
    ///
    /// Returns `Some(values)` on the multi-node leader and `None` everywhere
    /// else. The leader's own value comes first, then the others grouped by
    /// node in peer order.
    pub async fn gather(&self, value: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>> {
        if !self.is_local_leader() {
            debug!(leader = %self.local_leader, "Sending gather value to local leader");
            self.localhost.send(&self.local_leader, vec![value])?;
            return Ok(None);
        }

        let mut values = vec![value];
        for peer in &self.local_peers {
            values.push(self.recv_one(&self.localhost, peer).await?);
        }

        let (Some(multi_node), Some(leader)) = (&self.multi_node, &self.multi_node_leader) else {
            return Ok(Some(values));
        };
        if *leader != Peer::new(multi_node.my_connection_info().clone()) {
            debug!(leader = %leader, values = values.len(), "Sending node values to multi-node leader");
            multi_node.send(leader, values)?;
            return Ok(None);
        }
        for peer in &self.multi_node_peers {
            let frames = multi_node
                .recv_timeout(peer, self.config.collective_timeout)
                .await?;
            values.extend(frames);
        }
        info!(values = values.len(), "Gather complete");
        Ok(Some(values))
    }

    /// Distribute the multi-node leader's value to every instance.
    ///
    /// The leader must pass `Some(value)`; every other instance's argument
    /// is ignored. Every instance returns the leader's value.
    pub async fn broadcast(&self, value: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let value = if self.is_multi_node_leader() {
            let value = value.ok_or_else(|| Error::misuse("the broadcast leader must provide a value"))?;
            if let Some(multi_node) = &self.multi_node {
                for peer in &self.multi_node_peers {
                    multi_node.send(peer, vec![value.clone()])?;
                }
            }
            value
        } else if self.is_local_leader() {
            match (&self.multi_node, &self.multi_node_leader) {
                (Some(multi_node), Some(leader)) => self.recv_one(multi_node, leader).await?,
                _ => return Err(Error::Internal("local leader without multi-node group".to_string())),
            }
        } else {
            return self.recv_one(&self.localhost, &self.local_leader).await;
        };

        for peer in &self.local_peers {
            self.localhost.send(peer, vec![value.clone()])?;
        }
        Ok(value)
    }

    /// Close the multi-node group, then the localhost group
    pub async fn stop(&self) {
        if let Some(multi_node) = &self.multi_node {
            multi_node.stop().await;
        }
        self.localhost.stop().await;
    }
}

/// Minimum of `me` and `peers`
fn leader_of(me: &Peer, peers: &[Peer]) -> Peer {
    peers.iter().chain(std::iter::once(me)).min().unwrap_or(me).clone()
}
