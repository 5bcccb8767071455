//! Peer communicator
//!
//! Public API over one control loop. Calls from the application are
//! forwarded as commands; blocking calls poll the state the loop publishes.
//!
//! ```text
//! application ── Command ──▶ BackgroundListener ── frames ──▶ peers
//!      ▲                          │
//!      └──── FrontendState ◀──────┘
//! ```

mod background_listener;
mod config;
mod shared_state;

pub use config::{ForwardRegisterPeerConfig, PeerCommunicatorConfig};
pub use shared_state::InboxItem;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::peer::PeerLifecycle;
use crate::protocol::{ConnectionInfo, Peer};
use crate::timer::TimerFactory;
use crate::transport::{Frame, SocketFactory};

use background_listener::{BackgroundListener, Command};
use shared_state::FrontendState;

pub struct PeerCommunicator {
    my_info: ConnectionInfo,
    config: PeerCommunicatorConfig,
    shared: Arc<Mutex<FrontendState>>,
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_requested: AtomicBool,
}

impl PeerCommunicator {
    /// Bind the listener and start the control loop
    pub async fn new(config: PeerCommunicatorConfig, factory: Arc<dyn SocketFactory>) -> Result<Self> {
        Self::with_timers(config, factory, TimerFactory::system()).await
    }

    pub async fn with_timers(
        config: PeerCommunicatorConfig,
        factory: Arc<dyn SocketFactory>,
        timers: TimerFactory,
    ) -> Result<Self> {
        config.validate()?;
        let listener = factory.bind(&config.listen_address()).await?;
        let my_info = config.connection_info().with_port(listener.local_addr().port());

        info!(
            me = %my_info,
            group = %my_info.group_identifier,
            expected_peers = config.number_of_peers.saturating_sub(1),
            leader = config.forward_register_peer.is_leader,
            forwarding = config.forward_register_peer.is_enabled,
            "Peer communicator listening"
        );

        let shared = Arc::new(Mutex::new(FrontendState::default()));
        let (commands, rx) = mpsc::unbounded_channel();
        let control_loop =
            BackgroundListener::new(my_info.clone(), config.clone(), timers, factory, Arc::clone(&shared));
        let task = tokio::spawn(control_loop.run(listener, rx));

        Ok(Self {
            my_info,
            config,
            shared,
            commands,
            task: Mutex::new(Some(task)),
            stop_requested: AtomicBool::new(false),
        })
    }

    pub fn my_connection_info(&self) -> &ConnectionInfo {
        &self.my_info
    }

    /// Size of the group, this communicator included
    pub fn number_of_peers(&self) -> usize {
        self.config.number_of_peers
    }

    fn expected_remote_peers(&self) -> usize {
        self.config.number_of_peers.saturating_sub(1)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stop_requested.load(Ordering::SeqCst) || self.shared.lock().stopped {
            return Err(Error::CommunicatorStopped);
        }
        Ok(())
    }

    /// Start talking to `connection_info`.
    ///
    /// Registering the same peer twice is an error. A peer that already
    /// contacted us on its own may still be registered once.
    pub async fn register_peer(&self, connection_info: ConnectionInfo) -> Result<()> {
        self.ensure_running()?;
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::RegisterPeer { connection_info, reply })
            .map_err(|_| Error::CommunicatorStopped)?;
        response.await.map_err(|_| Error::CommunicatorStopped)?
    }

    /// Peers whose handshake and introduction are complete, sorted
    pub fn ready_peers(&self) -> Vec<Peer> {
        self.shared.lock().ready_peers()
    }

    pub fn are_all_peers_connected(&self) -> bool {
        self.ready_peers().len() >= self.expected_remote_peers()
    }

    /// Wait until every expected peer is ready.
    ///
    /// Returns the sorted peer set, or `None` if `timeout` ran out or the
    /// communicator stopped first. `None` as timeout waits indefinitely.
    pub async fn peers(&self, timeout: Option<Duration>) -> Option<Vec<Peer>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let (ready, stopped) = {
                let shared = self.shared.lock();
                (shared.ready_peers(), shared.stopped)
            };
            if ready.len() >= self.expected_remote_peers() {
                return Some(ready);
            }
            if stopped || deadline.is_some_and(|d| Instant::now() >= d) {
                return None;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Like [`peers`](Self::peers), but returns whatever is ready at the deadline
    pub async fn poll_peers(&self, timeout: Duration) -> Vec<Peer> {
        match self.peers(Some(timeout)).await {
            Some(peers) => peers,
            None => self.ready_peers(),
        }
    }

    pub async fn wait_for_peers(&self, timeout: Option<Duration>) -> bool {
        self.peers(timeout).await.is_some()
    }

    pub fn peer_lifecycle(&self, peer: &Peer) -> Option<PeerLifecycle> {
        self.shared.lock().peers.get(peer).and_then(|status| status.lifecycle)
    }

    /// Queue `payload` for reliable delivery to `peer`; never blocks
    pub fn send(&self, peer: &Peer, payload: Vec<Frame>) -> Result<()> {
        self.ensure_running()?;
        if !self.shared.lock().peers.contains_key(peer) {
            return Err(Error::UnknownPeer { peer: peer.to_string() });
        }
        self.commands
            .send(Command::Send {
                peer: peer.clone(),
                payload,
            })
            .map_err(|_| Error::CommunicatorStopped)
    }

    /// Next payload from `peer`, if one already arrived
    pub fn try_recv(&self, peer: &Peer) -> Result<Option<Vec<Frame>>> {
        let mut shared = self.shared.lock();
        let stopped = shared.stopped;
        let status = shared
            .peers
            .get_mut(peer)
            .ok_or_else(|| Error::UnknownPeer { peer: peer.to_string() })?;
        match status.inbox.pop_front() {
            Some(InboxItem::Payload(frames)) => Ok(Some(frames)),
            Some(InboxItem::Aborted { sequence_number, reason }) => Err(Error::PayloadAborted {
                peer: peer.to_string(),
                sequence_number,
                reason,
            }),
            None if stopped => Err(Error::CommunicatorStopped),
            None => Ok(None),
        }
    }

    /// Wait for the next payload from `peer`.
    ///
    /// Payloads arrive in the order they were sent. A payload of ours that
    /// `peer` never acknowledged shows up here as `PayloadAborted`.
    pub async fn recv(&self, peer: &Peer) -> Result<Vec<Frame>> {
        loop {
            if let Some(frames) = self.try_recv(peer)? {
                return Ok(frames);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    pub async fn recv_timeout(&self, peer: &Peer, timeout: Duration) -> Result<Vec<Frame>> {
        match tokio::time::timeout(timeout, self.recv(peer)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!("recv from {}", peer), timeout)),
        }
    }

    /// Close every peer connection and release the transport.
    ///
    /// Returns once every peer is closed or the stop timeout passed.
    /// Calling it again is harmless.
    pub async fn stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            // The loop already exited if the channel is gone.
            let _ = self.commands.send(Command::Stop);
        }

        let grace = self.config.stop_timeout() + self.config.poll_interval * 10;
        let handle = self.task.lock().take();
        match handle {
            Some(mut handle) => {
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    warn!(me = %self.my_info, "Control loop did not exit in time, aborting it");
                    handle.abort();
                }
            }
            None => {
                // Another caller is already waiting for the loop.
                let deadline = Instant::now() + grace;
                while !self.shared.lock().stopped && Instant::now() < deadline {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        self.shared.lock().stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }
}

impl Drop for PeerCommunicator {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            if !handle.is_finished() {
                warn!(me = %self.my_info, "Peer communicator dropped without stop()");
            }
            handle.abort();
        }
    }
}
