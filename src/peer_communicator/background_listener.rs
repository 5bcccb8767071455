//! The control loop of a peer communicator
//!
//! One task owns every peer state machine and every outbound socket. It
//! wakes up on a command from the frontend, on inbound frames or on the
//! tick, then advances all peers once and flushes what they produced.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::peer::{
    BackgroundPeerState, LocalNotification, Outbox, RegisterPeerForwarderBehaviorConfig,
};
use crate::protocol::{ConnectionInfo, Envelope, Message, Peer, PROTOCOL_VERSION};
use crate::timer::{Timer, TimerFactory};
use crate::transport::{Frame, Listener, Socket, SocketFactory};

use super::config::PeerCommunicatorConfig;
use super::shared_state::{FrontendState, InboxItem};

/// Requests from the frontend to the control loop
#[derive(Debug)]
pub(crate) enum Command {
    RegisterPeer {
        connection_info: ConnectionInfo,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        peer: Peer,
        payload: Vec<Frame>,
    },
    Stop,
}

/// How the control loop learned about a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// `register_peer` called by the application
    Explicit,
    /// The peer started a handshake with us
    Inbound,
    /// The leader introduced the peer with `RegisterPeer`
    IntroducedByLeader,
}

struct PeerEntry {
    state: BackgroundPeerState,
    explicitly_registered: bool,
}

pub(crate) struct BackgroundListener {
    my_info: ConnectionInfo,
    config: PeerCommunicatorConfig,
    timers: TimerFactory,
    factory: Arc<dyn SocketFactory>,
    peers: BTreeMap<Peer, PeerEntry>,
    sockets: BTreeMap<Peer, Box<dyn Socket>>,
    shared: Arc<Mutex<FrontendState>>,
    outbox: Outbox,
    stop_deadline: Option<Timer>,
}

impl BackgroundListener {
    pub(crate) fn new(
        my_info: ConnectionInfo,
        config: PeerCommunicatorConfig,
        timers: TimerFactory,
        factory: Arc<dyn SocketFactory>,
        shared: Arc<Mutex<FrontendState>>,
    ) -> Self {
        Self {
            my_info,
            config,
            timers,
            factory,
            peers: BTreeMap::new(),
            sockets: BTreeMap::new(),
            shared,
            outbox: Outbox::new(),
            stop_deadline: None,
        }
    }

    pub(crate) async fn run(mut self, mut listener: Box<dyn Listener>, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut listener_open = true;
        let mut commands_open = true;

        debug!(me = %self.my_info, "Control loop started");

        loop {
            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        // Frontend dropped without calling stop()
                        commands_open = false;
                        self.begin_stop();
                    }
                },
                frames = listener.recv(), if listener_open => match frames {
                    Some(frames) => {
                        self.handle_frames(frames);
                        while let Some(frames) = listener.try_recv() {
                            self.handle_frames(frames);
                        }
                    }
                    None => {
                        warn!(me = %self.my_info, "Listener closed unexpectedly");
                        listener_open = false;
                    }
                },
                _ = tick.tick() => {}
            }

            self.advance();
            if self.is_finished() {
                break;
            }
        }

        self.shutdown(listener.as_mut());
    }

    // ─────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::RegisterPeer { connection_info, reply } => {
                let result = self.register(connection_info, Origin::Explicit);
                // The caller may have given up waiting.
                let _ = reply.send(result);
            }
            Command::Send { peer, payload } => match self.peers.get_mut(&peer) {
                Some(entry) if self.stop_deadline.is_none() => {
                    let sequence_number = entry.state.send_payload(payload, &mut self.outbox);
                    trace!(peer = %peer, sequence_number, "Payload queued");
                }
                Some(_) => warn!(peer = %peer, "Dropping payload sent while stopping"),
                None => warn!(peer = %peer, "Dropping payload for unknown peer"),
            },
            Command::Stop => self.begin_stop(),
        }
    }

    fn behavior_for(&self, origin: Origin) -> RegisterPeerForwarderBehaviorConfig {
        let forwarding = self.config.forward_register_peer;
        if !forwarding.is_enabled {
            return RegisterPeerForwarderBehaviorConfig::default();
        }
        if forwarding.is_leader {
            RegisterPeerForwarderBehaviorConfig::leader()
        } else if origin == Origin::IntroducedByLeader {
            RegisterPeerForwarderBehaviorConfig::introduced()
        } else {
            RegisterPeerForwarderBehaviorConfig::default()
        }
    }

    fn register(&mut self, connection_info: ConnectionInfo, origin: Origin) -> Result<()> {
        if self.stop_deadline.is_some() {
            return Err(Error::CommunicatorStopped);
        }
        if connection_info == self.my_info {
            return Err(Error::SelfRegistration {
                peer: connection_info.to_string(),
            });
        }
        if connection_info.group_identifier != self.my_info.group_identifier {
            return Err(Error::GroupMismatch {
                peer: connection_info.to_string(),
                expected: self.my_info.group_identifier.clone(),
                actual: connection_info.group_identifier,
            });
        }

        let peer = Peer::new(connection_info);
        if let Some(entry) = self.peers.get_mut(&peer) {
            if origin != Origin::Explicit {
                return Ok(());
            }
            if entry.explicitly_registered {
                return Err(Error::DuplicatePeer { peer: peer.to_string() });
            }
            entry.explicitly_registered = true;
            return Ok(());
        }

        let behavior = self.behavior_for(origin);
        info!(me = %self.my_info.name, peer = %peer, ?origin, "Registering peer");
        let mut state = BackgroundPeerState::new(
            peer.clone(),
            behavior,
            &self.timers,
            &self.config.timeouts,
            &mut self.outbox,
        );

        if behavior.needs_to_send_register_peer {
            for (existing, entry) in self.peers.iter_mut() {
                if entry.state.is_closed() {
                    continue;
                }
                entry.state.add_register_target(&peer, &mut self.outbox);
                state.add_register_target(existing, &mut self.outbox);
            }
        }

        if exceeds_expected_peers(self.peers.len() + 1, self.config.number_of_peers) {
            debug!(
                me = %self.my_info.name,
                known = self.peers.len() + 1,
                expected = self.config.number_of_peers.saturating_sub(1),
                "More peers than expected"
            );
        }

        self.peers.insert(
            peer.clone(),
            PeerEntry {
                state,
                explicitly_registered: origin == Origin::Explicit,
            },
        );
        self.shared.lock().status_mut(&peer);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────

    fn handle_frames(&mut self, frames: Vec<Frame>) {
        let (envelope, payload) = match Envelope::decode(frames) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(me = %self.my_info.name, error = %e, "Dropping malformed message");
                return;
            }
        };
        if let Err(e) = PROTOCOL_VERSION.check_remote(&envelope.version) {
            warn!(source = %envelope.source, error = %e, "Dropping message");
            return;
        }
        if envelope.destination != self.my_info {
            debug!(
                destination = %envelope.destination,
                source = %envelope.source,
                "Dropping message addressed to another endpoint"
            );
            return;
        }
        if envelope.source.group_identifier != self.my_info.group_identifier {
            debug!(
                source = %envelope.source,
                group = %envelope.source.group_identifier,
                "Dropping message from another group"
            );
            return;
        }
        if envelope.message.is_local_notification() {
            warn!(source = %envelope.source, message = %envelope.message, "Local notification on the wire");
            return;
        }

        let source = Peer::new(envelope.source);
        let subject = match envelope.message.subject() {
            Some(info) => Peer::new(info.clone()),
            None => source.clone(),
        };
        if subject.connection_info == self.my_info {
            debug!(source = %source, "Ignoring introduction of ourselves");
            return;
        }

        if !self.peers.contains_key(&subject) {
            let origin = match envelope.message {
                Message::SynchronizeConnection { .. } => Origin::Inbound,
                Message::RegisterPeer { .. } => Origin::IntroducedByLeader,
                _ => {
                    trace!(source = %source, message = %envelope.message, "Message for unknown peer");
                    return;
                }
            };
            if self.stop_deadline.is_some() {
                debug!(peer = %subject, "Not accepting new peers while stopping");
                return;
            }
            if let Err(e) = self.register(subject.connection_info.clone(), origin) {
                warn!(peer = %subject, error = %e, "Rejecting peer");
                return;
            }
        }

        if let Some(entry) = self.peers.get_mut(&subject) {
            entry
                .state
                .received(envelope.message, &source, payload, &mut self.outbox);
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Tick
    // ─────────────────────────────────────────────────────────────

    fn advance(&mut self) {
        for entry in self.peers.values_mut() {
            entry.state.try_send(&mut self.outbox);
        }
        self.publish();
        self.flush();
    }

    /// Mirror local notifications and lifecycles into the frontend state
    fn publish(&mut self) {
        let notifications = self.outbox.take_local();
        let mut shared = self.shared.lock();
        for LocalNotification { peer, message, payload } in notifications {
            let status = shared.status_mut(&peer);
            match message {
                Message::PeerRegisterForwarderIsReady { .. } => {
                    status.forwarder_ready = true;
                    if status.is_ready() {
                        info!(me = %self.my_info.name, peer = %peer, "Peer ready");
                    }
                }
                Message::ConnectionIsReady => {
                    status.connection_ready = true;
                    if status.is_ready() {
                        info!(me = %self.my_info.name, peer = %peer, "Peer ready");
                    }
                }
                Message::Payload { .. } => status.inbox.push_back(InboxItem::Payload(payload)),
                Message::AbortPayload { sequence_number, reason } => {
                    status.inbox.push_back(InboxItem::Aborted { sequence_number, reason })
                }
                Message::ConnectionIsClosed => status.closed = true,
                Message::Timeout { reason } => debug!(peer = %peer, reason = %reason, "Peer timeout"),
                other => debug!(peer = %peer, message = %other, "Unexpected local notification"),
            }
        }
        for (peer, entry) in &self.peers {
            shared.status_mut(peer).lifecycle = Some(entry.state.lifecycle());
        }
    }

    fn flush(&mut self) {
        for outgoing in self.outbox.take_outgoing() {
            let envelope = Envelope::new(
                self.my_info.clone(),
                outgoing.destination.connection_info.clone(),
                outgoing.message,
            );
            let frames = match envelope.encode(outgoing.payload) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(peer = %outgoing.destination, error = %e, "Failed to encode message");
                    continue;
                }
            };
            let factory = &self.factory;
            let socket = self
                .sockets
                .entry(outgoing.destination.clone())
                .or_insert_with(|| factory.connect(&outgoing.destination.connection_info.address()));
            if let Err(e) = socket.send(frames) {
                debug!(peer = %outgoing.destination, error = %e, "Send failed");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Stop
    // ─────────────────────────────────────────────────────────────

    fn begin_stop(&mut self) {
        if self.stop_deadline.is_some() {
            return;
        }
        info!(me = %self.my_info.name, peers = self.peers.len(), "Stopping");
        self.stop_deadline = Some(self.timers.create(self.config.stop_timeout()));
        for entry in self.peers.values_mut() {
            entry.state.prepare_to_stop();
        }
    }

    fn is_finished(&self) -> bool {
        let Some(deadline) = &self.stop_deadline else {
            return false;
        };
        self.peers.values().all(|entry| entry.state.is_closed()) || deadline.is_time()
    }

    fn shutdown(&mut self, listener: &mut dyn Listener) {
        let unclosed: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, entry)| !entry.state.is_closed())
            .map(|(peer, _)| peer.to_string())
            .collect();
        if !unclosed.is_empty() {
            warn!(me = %self.my_info.name, unclosed = ?unclosed, "Stop deadline passed, releasing anyway");
        }

        for socket in self.sockets.values_mut() {
            socket.close();
        }
        self.sockets.clear();
        listener.close();

        self.shared.lock().stopped = true;
        info!(me = %self.my_info.name, "Stopped");
    }
}

/// `number_of_peers` counts this communicator too, so at most
/// `number_of_peers - 1` remote peers are expected
fn exceeds_expected_peers(known: usize, number_of_peers: usize) -> bool {
    known > number_of_peers.saturating_sub(1)
}
