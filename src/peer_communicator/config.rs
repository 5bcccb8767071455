//! Settings of one peer communicator

use std::time::Duration;

use crate::error::{Error, Result};
use crate::peer::PeerTimeouts;
use crate::protocol::ConnectionInfo;

/// Leader-based introduction of peers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardRegisterPeerConfig {
    /// This communicator introduces every peer it learns about to every other
    pub is_leader: bool,

    /// Followers wait for the leader's introduction before reporting a peer
    /// ready; the leader introduces peers
    pub is_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct PeerCommunicatorConfig {
    /// Endpoint name, unique within the group
    pub name: String,

    pub group_identifier: String,

    pub listen_ip: String,

    /// 0 binds an ephemeral port
    pub listen_port: u16,

    /// Size of the whole group, this communicator included
    pub number_of_peers: usize,

    pub forward_register_peer: ForwardRegisterPeerConfig,

    pub timeouts: PeerTimeouts,

    /// Control loop tick; also the polling interval of blocking calls
    pub poll_interval: Duration,

    /// Upper bound for `stop()`; defaults to the worst-case close time
    pub stop_timeout: Option<Duration>,
}

impl PeerCommunicatorConfig {
    pub fn new(name: impl Into<String>, group_identifier: impl Into<String>, number_of_peers: usize) -> Self {
        Self {
            name: name.into(),
            group_identifier: group_identifier.into(),
            listen_ip: "127.0.0.1".to_string(),
            listen_port: 0,
            number_of_peers,
            forward_register_peer: ForwardRegisterPeerConfig::default(),
            timeouts: PeerTimeouts::default(),
            poll_interval: Duration::from_millis(10),
            stop_timeout: None,
        }
    }

    pub fn with_listen_address(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.listen_ip = ip.into();
        self.listen_port = port;
        self
    }

    pub fn with_forwarding(mut self, is_leader: bool, is_enabled: bool) -> Self {
        self.forward_register_peer = ForwardRegisterPeerConfig { is_leader, is_enabled };
        self
    }

    pub fn with_timeouts(mut self, timeouts: PeerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config_field_invalid("name", "must not be empty"));
        }
        if self.group_identifier.is_empty() {
            return Err(Error::config_field_invalid("group_identifier", "must not be empty"));
        }
        if self.number_of_peers == 0 {
            return Err(Error::config_field_invalid(
                "number_of_peers",
                "a group contains at least this communicator",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config_field_invalid("poll_interval", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
            .unwrap_or_else(|| self.timeouts.worst_case_close())
    }

    /// Identity before the listener is bound; the port may still be 0
    pub(crate) fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::new(&self.name, &self.listen_ip, self.listen_port, &self.group_identifier)
    }

    pub(crate) fn listen_address(&self) -> String {
        self.connection_info().address()
    }
}
