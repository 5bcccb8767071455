//! Wire protocol between peer communicators
//!
//! Endpoint identity, the closed message set and protocol versioning.

mod connection_info;
mod messages;
mod version;

pub use connection_info::*;
pub use messages::*;
pub use version::*;
