//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use peerwire::communicator::CommunicatorConfig;
use peerwire::peer::PeerTimeouts;
use peerwire::peer_communicator::{PeerCommunicator, PeerCommunicatorConfig};
use peerwire::protocol::Peer;
use peerwire::transport::{FaultInjectionConfig, SocketFactory, TcpSocketFactory};

/// Short retries so lost messages recover within a few milliseconds,
/// generous aborts so slow CI machines never hit them
pub fn fast_timeouts() -> PeerTimeouts {
    PeerTimeouts {
        synchronize_retry: Duration::from_millis(20),
        connection_abort: Duration::from_secs(10),
        register_peer_retry: Duration::from_millis(20),
        register_peer_abort: Duration::from_secs(10),
        register_peer_wait: Duration::from_secs(5),
        payload_retry: Duration::from_millis(20),
        payload_abort: Duration::from_secs(10),
        close_retry: Duration::from_millis(20),
        close_abort: Duration::from_secs(2),
        connection_is_closed_wait: Duration::from_millis(50),
    }
}

pub const WAIT: Duration = Duration::from_secs(15);

pub fn tcp() -> Arc<dyn SocketFactory> {
    Arc::new(TcpSocketFactory::default())
}

/// A UDP port nothing listens on right now
pub fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

pub fn peer_config(name: &str, group: &str, size: usize) -> PeerCommunicatorConfig {
    let mut config = PeerCommunicatorConfig::new(name, group, size).with_timeouts(fast_timeouts());
    config.poll_interval = Duration::from_millis(5);
    config
}

pub fn peer_of(communicator: &PeerCommunicator) -> Peer {
    Peer::new(communicator.my_connection_info().clone())
}

/// Start `size` communicators named `p0..pN` and register them with each
/// other. With forwarding, only `p0` and the followers know each other up
/// front; `p0` introduces the rest.
pub async fn loopback_group(
    group: &str,
    size: usize,
    forwarding: bool,
    factory: Arc<dyn SocketFactory>,
) -> Vec<Arc<PeerCommunicator>> {
    let mut communicators = Vec::with_capacity(size);
    for i in 0..size {
        let config = peer_config(&format!("p{}", i), group, size).with_forwarding(i == 0, forwarding);
        communicators.push(Arc::new(PeerCommunicator::new(config, Arc::clone(&factory)).await.unwrap()));
    }

    for (i, communicator) in communicators.iter().enumerate() {
        for (j, other) in communicators.iter().enumerate() {
            if i == j {
                continue;
            }
            if forwarding && i != 0 && j != 0 {
                continue;
            }
            communicator
                .register_peer(other.my_connection_info().clone())
                .await
                .unwrap();
        }
    }
    communicators
}

/// Stop every communicator concurrently so each close handshake completes
pub async fn stop_all(communicators: &[Arc<PeerCommunicator>]) {
    let handles: Vec<_> = communicators
        .iter()
        .map(|c| {
            let c = Arc::clone(c);
            tokio::spawn(async move { c.stop().await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
}

/// Runtime settings for instance `position` of a single-machine run
pub fn single_node_config(group: &str, position: usize, instances: usize, discovery_port: u16) -> CommunicatorConfig {
    CommunicatorConfig {
        instance_name: format!("instance-{}", position),
        group_identifier: group.to_string(),
        node_name: "test-node".to_string(),
        local_position: position,
        instances_per_node: instances,
        number_of_nodes: 1,
        is_discovery_leader_node: true,
        local_discovery_port: discovery_port,
        global_discovery_address: "127.0.0.1:0".to_string(),
        node_ip: "127.0.0.1".to_string(),
        forward_register_peer: true,
        ping_interval: Duration::from_millis(20),
        discovery_timeout: WAIT,
        collective_timeout: WAIT,
        poll_interval: Duration::from_millis(5),
        timeouts: fast_timeouts(),
        fault_injection: FaultInjectionConfig::default(),
    }
}

/// One instance of a `nodes`-machine run, all simulated on loopback.
///
/// Every node gets its own localhost discovery port from `node_ports`;
/// node 0 hosts the multi-node discovery leader at `global_address`.
pub fn multi_node_config(
    group: &str,
    node: usize,
    position: usize,
    instances: usize,
    node_ports: &[u16],
    global_address: &str,
) -> CommunicatorConfig {
    let mut config = single_node_config(group, position, instances, node_ports[node]);
    config.instance_name = format!("n{}-i{}", node, position);
    config.node_name = format!("node-{}", node);
    config.number_of_nodes = node_ports.len();
    config.is_discovery_leader_node = node == 0;
    config.global_discovery_address = global_address.to_string();
    config
}
