//! Per-peer protocol state machines
//!
//! Each remote peer gets one [`BackgroundPeerState`] composed of four
//! independent machines:
//!
//! - [`ConnectionEstablisher`]: synchronize/acknowledge handshake
//! - [`RegisterPeerForwarder`]: leader-based introduction of peers
//! - [`PayloadHandler`]: reliable, ordered, exactly-once payload delivery
//! - [`ConnectionCloser`]: symmetric close handshake with abort fallback
//!
//! None of them perform I/O. They write wire messages and local
//! notifications into an [`Outbox`] which the control loop flushes.

mod background_peer_state;
mod connection_closer;
mod connection_establisher;
mod outbox;
mod payload_handler;
mod register_peer_forwarder;

pub use background_peer_state::{BackgroundPeerState, PeerLifecycle};
pub use connection_closer::{CloseConnectionSender, ConnectionCloser, ConnectionIsClosedSender};
pub use connection_establisher::{ConnectionEstablisher, EstablisherState};
pub use outbox::{LocalNotification, Outbox, OutgoingMessage};
pub use payload_handler::{PayloadHandler, PayloadReceiver, PayloadSender};
pub use register_peer_forwarder::{
    AcknowledgeRegisterPeerSender, RegisterPeerForwarder, RegisterPeerForwarderBehaviorConfig,
    RegisterPeerForwarderIsReadySender, RegisterPeerProgress, RegisterPeerSender,
};

use std::time::Duration;

/// Retry and deadline settings shared by all peer state machines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTimeouts {
    /// Interval between `SynchronizeConnection` retransmissions
    pub synchronize_retry: Duration,

    /// Give up on a handshake that never got acknowledged
    pub connection_abort: Duration,

    /// Interval between `RegisterPeer` retransmissions
    pub register_peer_retry: Duration,

    /// Give up on targets that never acknowledged an introduction
    pub register_peer_abort: Duration,

    /// How long an introduced peer waits for `RegisterPeerComplete`
    pub register_peer_wait: Duration,

    pub payload_retry: Duration,
    pub payload_abort: Duration,

    pub close_retry: Duration,
    pub close_abort: Duration,

    /// Linger after both close conditions hold, to keep acknowledging
    /// retransmitted `CloseConnection` messages
    pub connection_is_closed_wait: Duration,
}

impl Default for PeerTimeouts {
    fn default() -> Self {
        Self {
            synchronize_retry: Duration::from_millis(100),
            connection_abort: Duration::from_secs(30),
            register_peer_retry: Duration::from_millis(100),
            register_peer_abort: Duration::from_secs(30),
            register_peer_wait: Duration::from_secs(10),
            payload_retry: Duration::from_millis(200),
            payload_abort: Duration::from_secs(30),
            close_retry: Duration::from_millis(100),
            close_abort: Duration::from_secs(10),
            connection_is_closed_wait: Duration::from_millis(500),
        }
    }
}

impl PeerTimeouts {
    /// Longest a peer can take from `prepare_to_stop` to closed, assuming
    /// the handshake never completed
    pub fn worst_case_close(&self) -> Duration {
        self.connection_abort
            .max(self.register_peer_abort)
            .max(self.register_peer_wait)
            .max(self.payload_abort)
            + self.close_abort
            + self.connection_is_closed_wait
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::protocol::{ConnectionInfo, Peer};
    use crate::timer::{ManualClock, TimerFactory};

    use super::PeerTimeouts;

    pub fn peer(name: &str) -> Peer {
        Peer::new(ConnectionInfo::new(name, "127.0.0.1", 5000, "test-group"))
    }

    pub fn manual_timers() -> (Arc<ManualClock>, TimerFactory) {
        let clock = Arc::new(ManualClock::new());
        (clock.clone(), TimerFactory::new(clock))
    }

    /// Round numbers that are easy to step through with a manual clock
    pub fn timeouts() -> PeerTimeouts {
        PeerTimeouts {
            synchronize_retry: Duration::from_millis(10),
            connection_abort: Duration::from_millis(1000),
            register_peer_retry: Duration::from_millis(10),
            register_peer_abort: Duration::from_millis(1000),
            register_peer_wait: Duration::from_millis(500),
            payload_retry: Duration::from_millis(10),
            payload_abort: Duration::from_millis(1000),
            close_retry: Duration::from_millis(10),
            close_abort: Duration::from_millis(1000),
            connection_is_closed_wait: Duration::from_millis(50),
        }
    }

    pub fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }
}
