//! Non-blocking transport primitives
//!
//! The protocol layers only see these traits. Outbound [`Socket`]s are
//! fire-and-forget: a send never blocks the control loop and may be lost,
//! which the retry timers above tolerate. Inbound traffic for a communicator
//! arrives on a single [`Listener`].

mod fault_injection;
mod frame;
mod tcp;

pub use fault_injection::{FaultInjectionConfig, FaultInjectionSocket, FaultInjectionSocketFactory, FaultInjectionStats};
pub use frame::{read_frames, write_frames, MAX_FRAMES_PER_MESSAGE, MAX_FRAME_SIZE};
pub use tcp::{TcpFrameListener, TcpSocket, TcpSocketFactory, TcpTransportConfig};

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;

/// One opaque part of a multipart transmission
pub type Frame = Vec<u8>;

/// Outbound half of a peer connection
pub trait Socket: Send {
    /// Queue a frame set for delivery without blocking.
    ///
    /// `Ok` does not mean delivered; it only means the socket accepted the
    /// frames or deliberately dropped them.
    fn send(&mut self, frames: Vec<Frame>) -> Result<()>;

    /// Release the connection; queued frames are flushed best-effort
    fn close(&mut self);
}

/// Inbound endpoint of a communicator
#[async_trait]
pub trait Listener: Send {
    fn local_addr(&self) -> SocketAddr;

    /// Wait for the next frame set; `None` once the listener is closed
    async fn recv(&mut self) -> Option<Vec<Frame>>;

    /// Take an already received frame set, if any
    fn try_recv(&mut self) -> Option<Vec<Frame>>;

    fn close(&mut self);
}

/// Creates listeners and lazily connecting outbound sockets
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn bind(&self, address: &str) -> Result<Box<dyn Listener>>;

    /// Must be called from within a tokio runtime
    fn connect(&self, address: &str) -> Box<dyn Socket>;
}
