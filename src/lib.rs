//! peerwire - reliable peer-to-peer messaging between the instances of a
//! distributed computation
//!
//! [`PeerCommunicator`](peer_communicator::PeerCommunicator) connects one
//! instance to a fixed number of peers and delivers payloads reliably, in
//! order, exactly once. [`Communicator`](communicator::Communicator) layers
//! discovery and the `gather`/`broadcast` collectives on top of two of them.

pub mod communicator;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod peer;
pub mod peer_communicator;
pub mod protocol;
pub mod timer;
pub mod transport;
pub mod version;

pub use communicator::{Communicator, CommunicatorConfig};
pub use error::{Error, ErrorCode, Result};
pub use peer_communicator::{PeerCommunicator, PeerCommunicatorConfig};
pub use protocol::{ConnectionInfo, Peer};
