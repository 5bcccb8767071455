//! Endpoint identity
//!
//! A [`ConnectionInfo`] names one communicator endpoint within one run.
//! [`Peer`] is the same identity seen from the other side; its total order
//! drives deterministic peer lists and leader election.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Immutable address and identity of one endpoint.
///
/// Field order matters: the derived `Ord` compares `name` first, then the
/// address, then the group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub name: String,
    pub ipaddress: String,
    pub port: u16,
    /// Partitions concurrent runs that share hosts and ports
    pub group_identifier: String,
}

impl ConnectionInfo {
    pub fn new(
        name: impl Into<String>,
        ipaddress: impl Into<String>,
        port: u16,
        group_identifier: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            ipaddress: ipaddress.into(),
            port,
            group_identifier: group_identifier.into(),
        }
    }

    /// `ip:port` in a form `TcpStream::connect` accepts
    pub fn address(&self) -> String {
        match self.ipaddress.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.ipaddress, self.port),
            _ => format!("{}:{}", self.ipaddress, self.port),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.ipaddress.parse().map_err(|_| {
            Error::config_field_invalid("ipaddress", format!("'{}' is not an IP address", self.ipaddress))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Same endpoint with another port, used once a listener is bound to port 0
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address())
    }
}

/// A remote endpoint known to a communicator
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Peer {
    pub connection_info: ConnectionInfo,
}

impl Peer {
    pub fn new(connection_info: ConnectionInfo) -> Self {
        Self { connection_info }
    }

    pub fn name(&self) -> &str {
        &self.connection_info.name
    }
}

impl From<ConnectionInfo> for Peer {
    fn from(connection_info: ConnectionInfo) -> Self {
        Self::new(connection_info)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.connection_info.fmt(f)
    }
}
