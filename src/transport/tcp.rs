//! TCP transport
//!
//! Outbound: each [`TcpSocket`] owns a bounded queue drained by a writer task
//! that connects on first use and reconnects after a write failure.
//!
//! Inbound: a [`TcpFrameListener`] runs an accept task plus one read task per
//! accepted connection, funnelling complete frame sets into one channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};

use super::frame::{read_frames, write_frames};
use super::{Frame, Listener, Socket, SocketFactory};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Frame sets buffered per outbound socket before sends are dropped
    pub send_queue_size: usize,

    /// Frame sets buffered across all inbound connections
    pub receive_queue_size: usize,

    /// Upper bound for one outbound connect attempt
    pub connect_timeout: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            send_queue_size: 1024,
            receive_queue_size: 4096,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Factory
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TcpSocketFactory {
    config: TcpTransportConfig,
}

impl TcpSocketFactory {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn bind(&self, address: &str) -> Result<Box<dyn Listener>> {
        let listener = TcpFrameListener::bind(address, self.config.receive_queue_size).await?;
        Ok(Box::new(listener))
    }

    fn connect(&self, address: &str) -> Box<dyn Socket> {
        Box::new(TcpSocket::new(address, &self.config))
    }
}

// ─────────────────────────────────────────────────────────────────
// Outbound socket
// ─────────────────────────────────────────────────────────────────

pub struct TcpSocket {
    address: Arc<str>,
    write_tx: Option<mpsc::Sender<Vec<Frame>>>,
}

impl TcpSocket {
    pub fn new(address: &str, config: &TcpTransportConfig) -> Self {
        let address: Arc<str> = Arc::from(address);
        let (write_tx, write_rx) = mpsc::channel(config.send_queue_size.max(1));
        tokio::spawn(write_loop(Arc::clone(&address), write_rx, config.connect_timeout));
        Self {
            address,
            write_tx: Some(write_tx),
        }
    }
}

impl Socket for TcpSocket {
    fn send(&mut self, frames: Vec<Frame>) -> Result<()> {
        let tx = self.write_tx.as_ref().ok_or_else(|| Error::ConnectionFailed {
            address: self.address.to_string(),
            message: "socket is closed".to_string(),
        })?;
        match tx.try_send(frames) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(address = %self.address, "Send queue full, dropping frames");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ConnectionFailed {
                address: self.address.to_string(),
                message: "writer task has exited".to_string(),
            }),
        }
    }

    fn close(&mut self) {
        // Dropping the sender lets the writer drain its queue and exit.
        self.write_tx.take();
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Background task: connects lazily and writes queued frame sets
async fn write_loop(address: Arc<str>, mut write_rx: mpsc::Receiver<Vec<Frame>>, connect_timeout: Duration) {
    let mut stream: Option<TcpStream> = None;

    while let Some(frames) = write_rx.recv().await {
        if stream.is_none() {
            match tokio::time::timeout(connect_timeout, TcpStream::connect(address.as_ref())).await {
                Ok(Ok(s)) => {
                    if let Err(e) = s.set_nodelay(true) {
                        trace!(address = %address, error = %e, "Could not set TCP_NODELAY");
                    }
                    debug!(address = %address, "Outbound connection established");
                    stream = Some(s);
                }
                Ok(Err(e)) => {
                    trace!(address = %address, error = %e, "Connect failed, dropping frames");
                    continue;
                }
                Err(_) => {
                    trace!(address = %address, "Connect timed out, dropping frames");
                    continue;
                }
            }
        }

        if let Some(s) = stream.as_mut() {
            if let Err(e) = write_frames(s, &frames).await {
                debug!(address = %address, error = %e, "Write failed, will reconnect");
                stream = None;
            }
        }
    }

    if let Some(mut s) = stream {
        let _ = s.shutdown().await;
    }
    trace!(address = %address, "Writer task finished");
}

// ─────────────────────────────────────────────────────────────────
// Inbound listener
// ─────────────────────────────────────────────────────────────────

pub struct TcpFrameListener {
    local_addr: SocketAddr,
    inbound_rx: mpsc::Receiver<Vec<Frame>>,
    accept_task: JoinHandle<()>,
}

impl TcpFrameListener {
    pub async fn bind(address: &str, queue_size: usize) -> Result<Self> {
        let listener = TcpListener::bind(address).await.map_err(|source| Error::BindFailed {
            address: address.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_size.max(1));
        let accept_task = tokio::spawn(accept_loop(listener, inbound_tx));

        debug!(addr = %local_addr, "Listener bound");
        Ok(Self {
            local_addr,
            inbound_rx,
            accept_task,
        })
    }
}

#[async_trait]
impl Listener for TcpFrameListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn recv(&mut self) -> Option<Vec<Frame>> {
        self.inbound_rx.recv().await
    }

    fn try_recv(&mut self) -> Option<Vec<Frame>> {
        self.inbound_rx.try_recv().ok()
    }

    fn close(&mut self) {
        // Aborting the accept task drops its JoinSet, which aborts every reader.
        self.accept_task.abort();
        self.inbound_rx.close();
    }
}

impl Drop for TcpFrameListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Accept inbound connections and spawn one reader per connection
async fn accept_loop(listener: TcpListener, inbound_tx: mpsc::Sender<Vec<Frame>>) {
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    trace!(peer_addr = %peer_addr, "Inbound connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(error = %e, "Could not set TCP_NODELAY");
                    }
                    readers.spawn(read_loop(peer_addr, stream, inbound_tx.clone()));
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
}

/// Background task: reads frame sets from one connection
async fn read_loop(peer_addr: SocketAddr, mut stream: TcpStream, inbound_tx: mpsc::Sender<Vec<Frame>>) {
    loop {
        match read_frames(&mut stream).await {
            Ok(frames) => {
                if inbound_tx.send(frames).await.is_err() {
                    break;
                }
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                trace!(peer_addr = %peer_addr, "Inbound connection closed");
                break;
            }
            Err(e) => {
                warn!(peer_addr = %peer_addr, error = %e, "Dropping inbound connection");
                break;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_listener() {
        let factory = TcpSocketFactory::default();
        let mut listener = factory.bind("127.0.0.1:0").await.unwrap();
        let mut socket = factory.connect(&listener.local_addr().to_string());

        socket.send(vec![b"one".to_vec(), b"two".to_vec()]).unwrap();
        socket.send(vec![b"three".to_vec()]).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), listener.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), listener.recv()).await.unwrap();
        assert_eq!(first, Some(vec![b"one".to_vec(), b"two".to_vec()]));
        assert_eq!(second, Some(vec![b"three".to_vec()]));
    }

    #[tokio::test]
    async fn test_send_to_unreachable_address_is_best_effort() {
        // Bind then drop to obtain a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let factory = TcpSocketFactory::default();
        let mut socket = factory.connect(&format!("127.0.0.1:{}", port));
        assert!(socket.send(vec![b"lost".to_vec()]).is_ok());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let factory = TcpSocketFactory::default();
        let mut socket = factory.connect("127.0.0.1:9");
        socket.close();
        assert!(socket.send(vec![b"x".to_vec()]).is_err());
    }

    #[tokio::test]
    async fn test_closed_listener_yields_none() {
        let factory = TcpSocketFactory::default();
        let mut listener = factory.bind("127.0.0.1:0").await.unwrap();
        listener.close();
        assert!(listener.recv().await.is_none());
        assert!(listener.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let factory = TcpSocketFactory::default();
        let first = factory.bind("127.0.0.1:0").await.unwrap();
        let taken = first.local_addr().to_string();
        match factory.bind(&taken).await {
            Err(Error::BindFailed { address, .. }) => assert_eq!(address, taken),
            Err(other) => panic!("expected BindFailed, got {other:?}"),
            Ok(_) => panic!("expected BindFailed, got a listener"),
        }
    }
}
