//! Leader-based peer introduction
//!
//! Instead of every instance telling every other instance about every peer,
//! the leader introduces each peer (the *subject*) to all other peers it
//! knows (the *targets*):
//!
//! ```text
//! leader ── RegisterPeer{P} ──────────────▶ target
//! leader ◀─ AcknowledgeRegisterPeer{P} ─── target   (target now connects to P)
//! leader ── RegisterPeerComplete{P} ──────▶ target  (once all targets acked)
//! ```
//!
//! One forwarder exists per (communicator, subject). Its two behavior flags
//! decide which half of the exchange it takes part in.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::protocol::{Message, Peer};
use crate::timer::{Timer, TimerFactory};

use super::{Outbox, PeerTimeouts};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterPeerForwarderBehaviorConfig {
    /// Introduce the subject to every target (leader side)
    pub needs_to_send_register_peer: bool,

    /// Acknowledge the leader's introduction and wait for its completion
    /// (introduced side)
    pub needs_to_send_acknowledge_register_peer: bool,
}

impl RegisterPeerForwarderBehaviorConfig {
    pub fn leader() -> Self {
        Self {
            needs_to_send_register_peer: true,
            needs_to_send_acknowledge_register_peer: false,
        }
    }

    pub fn introduced() -> Self {
        Self {
            needs_to_send_register_peer: false,
            needs_to_send_acknowledge_register_peer: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Leader side
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct TargetState {
    acknowledged: bool,
    complete_sent: bool,
}

/// Introduces one subject to every target until each acknowledges
#[derive(Debug)]
pub struct RegisterPeerSender {
    subject: Peer,
    targets: BTreeMap<Peer, TargetState>,
    retry_timer: Timer,
    abort_timer: Timer,
    aborted: bool,
}

impl RegisterPeerSender {
    pub fn new(subject: Peer, timers: &TimerFactory, timeouts: &PeerTimeouts) -> Self {
        Self {
            subject,
            targets: BTreeMap::new(),
            retry_timer: timers.create(timeouts.register_peer_retry),
            abort_timer: timers.create(timeouts.register_peer_abort),
            aborted: false,
        }
    }

    pub fn add_target(&mut self, target: &Peer, outbox: &mut Outbox) {
        if *target == self.subject || self.targets.contains_key(target) {
            return;
        }
        debug!(subject = %self.subject, target = %target, "Introducing peer");
        self.targets.insert(target.clone(), TargetState::default());
        self.send_register_peer(target, outbox);
        // A late target gets a full window of its own.
        self.abort_timer.reset_timer();
        self.aborted = false;
    }

    fn send_register_peer(&self, target: &Peer, outbox: &mut Outbox) {
        outbox.send(
            target,
            Message::RegisterPeer {
                peer: self.subject.connection_info.clone(),
            },
        );
    }

    fn send_complete(&mut self, outbox: &mut Outbox) {
        let subject = self.subject.connection_info.clone();
        for (target, state) in self.targets.iter_mut() {
            if state.acknowledged && !state.complete_sent {
                outbox.send(target, Message::RegisterPeerComplete { peer: subject.clone() });
                state.complete_sent = true;
            }
        }
    }

    pub fn received_acknowledge_register_peer(&mut self, from: &Peer, outbox: &mut Outbox) {
        let Some(state) = self.targets.get_mut(from) else {
            debug!(subject = %self.subject, from = %from, "Acknowledgement from a non-target");
            return;
        };
        if state.complete_sent {
            // Our completion got lost; the target is still re-acknowledging.
            outbox.send(
                from,
                Message::RegisterPeerComplete {
                    peer: self.subject.connection_info.clone(),
                },
            );
            return;
        }
        state.acknowledged = true;
        if self.all_targets_acknowledged() {
            info!(subject = %self.subject, targets = self.targets.len(), "Peer introduced to all targets");
            self.send_complete(outbox);
        }
    }

    pub fn try_send(&mut self, outbox: &mut Outbox) {
        if self.is_finished() {
            return;
        }
        if self.abort_timer.is_time() {
            let missing: Vec<String> = self
                .targets
                .iter()
                .filter(|(_, s)| !s.acknowledged)
                .map(|(p, _)| p.to_string())
                .collect();
            warn!(subject = %self.subject, missing = ?missing, "Giving up on unacknowledged introductions");
            self.aborted = true;
            self.send_complete(outbox);
            outbox.notify(
                &self.subject,
                Message::Timeout {
                    reason: format!("RegisterPeer not acknowledged by {}", missing.join(", ")),
                },
            );
        } else if self.retry_timer.is_time() {
            let pending: Vec<Peer> = self
                .targets
                .iter()
                .filter(|(_, s)| !s.acknowledged)
                .map(|(p, _)| p.clone())
                .collect();
            for target in &pending {
                self.send_register_peer(target, outbox);
            }
            self.retry_timer.reset_timer();
        }
    }

    pub fn all_targets_acknowledged(&self) -> bool {
        self.targets.values().all(|s| s.acknowledged)
    }

    /// Every target acknowledged, or the abort deadline gave up on the rest
    pub fn is_finished(&self) -> bool {
        self.aborted || self.all_targets_acknowledged()
    }

    pub fn number_of_targets(&self) -> usize {
        self.targets.len()
    }
}

// ─────────────────────────────────────────────────────────────────
// Introduced side
// ─────────────────────────────────────────────────────────────────

/// Answers the leader's introductions of one subject
#[derive(Debug)]
pub struct AcknowledgeRegisterPeerSender {
    subject: Peer,
    leader: Option<Peer>,
    complete_received: bool,
    retry_timer: Timer,
}

impl AcknowledgeRegisterPeerSender {
    pub fn new(subject: Peer, timers: &TimerFactory, timeouts: &PeerTimeouts) -> Self {
        Self {
            subject,
            leader: None,
            complete_received: false,
            retry_timer: timers.create(timeouts.register_peer_retry),
        }
    }

    fn send_acknowledge(&mut self, outbox: &mut Outbox) {
        if let Some(leader) = &self.leader {
            outbox.send(
                leader,
                Message::AcknowledgeRegisterPeer {
                    peer: self.subject.connection_info.clone(),
                },
            );
        }
        self.retry_timer.reset_timer();
    }

    /// Every introduction is acknowledged, duplicates included
    pub fn received_register_peer(&mut self, leader: &Peer, outbox: &mut Outbox) {
        self.leader = Some(leader.clone());
        self.send_acknowledge(outbox);
    }

    pub fn received_register_peer_complete(&mut self) {
        self.complete_received = true;
    }

    /// Re-acknowledge until the completion arrives
    pub fn try_send(&mut self, outbox: &mut Outbox) {
        if self.leader.is_some() && !self.complete_received && self.retry_timer.is_time() {
            self.send_acknowledge(outbox);
        }
    }

    pub fn complete_received(&self) -> bool {
        self.complete_received
    }
}

// ─────────────────────────────────────────────────────────────────
// Readiness
// ─────────────────────────────────────────────────────────────────

/// What the forwarder has seen so far, as input for readiness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterPeerProgress {
    /// All targets acknowledged the subject (or the sender gave up on them)
    pub register_peer_acknowledged: bool,
    pub register_peer_complete_received: bool,
}

/// Emits `PeerRegisterForwarderIsReady` exactly once.
///
/// Ready when every enabled half of the exchange is done. An introduced
/// peer stops waiting for `RegisterPeerComplete` once the wait timer fires.
#[derive(Debug)]
pub struct RegisterPeerForwarderIsReadySender {
    subject: Peer,
    behavior: RegisterPeerForwarderBehaviorConfig,
    wait_timer: Timer,
    finished: bool,
}

impl RegisterPeerForwarderIsReadySender {
    pub fn new(
        subject: Peer,
        behavior: RegisterPeerForwarderBehaviorConfig,
        timers: &TimerFactory,
        timeouts: &PeerTimeouts,
    ) -> Self {
        Self {
            subject,
            behavior,
            wait_timer: timers.create(timeouts.register_peer_wait),
            finished: false,
        }
    }

    pub fn try_send(&mut self, progress: RegisterPeerProgress, outbox: &mut Outbox) {
        if self.finished {
            return;
        }
        let register_done =
            !self.behavior.needs_to_send_register_peer || progress.register_peer_acknowledged;
        let acknowledge_done = !self.behavior.needs_to_send_acknowledge_register_peer
            || progress.register_peer_complete_received
            || self.wait_timer.is_time();

        if register_done && acknowledge_done {
            debug!(subject = %self.subject, "Register peer forwarder is ready");
            outbox.notify(
                &self.subject,
                Message::PeerRegisterForwarderIsReady {
                    peer: self.subject.connection_info.clone(),
                },
            );
            self.finished = true;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

// ─────────────────────────────────────────────────────────────────
// Composite
// ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RegisterPeerForwarder {
    subject: Peer,
    behavior: RegisterPeerForwarderBehaviorConfig,
    register_sender: Option<RegisterPeerSender>,
    acknowledge_sender: AcknowledgeRegisterPeerSender,
    ready_sender: RegisterPeerForwarderIsReadySender,
}

impl RegisterPeerForwarder {
    pub fn new(
        subject: Peer,
        behavior: RegisterPeerForwarderBehaviorConfig,
        timers: &TimerFactory,
        timeouts: &PeerTimeouts,
    ) -> Self {
        let register_sender = behavior
            .needs_to_send_register_peer
            .then(|| RegisterPeerSender::new(subject.clone(), timers, timeouts));
        Self {
            acknowledge_sender: AcknowledgeRegisterPeerSender::new(subject.clone(), timers, timeouts),
            ready_sender: RegisterPeerForwarderIsReadySender::new(subject.clone(), behavior, timers, timeouts),
            register_sender,
            behavior,
            subject,
        }
    }

    /// Introduce the subject to `target`; a no-op unless this side introduces
    pub fn add_target(&mut self, target: &Peer, outbox: &mut Outbox) {
        if let Some(sender) = self.register_sender.as_mut() {
            sender.add_target(target, outbox);
        }
    }

    pub fn received_register_peer(&mut self, leader: &Peer, outbox: &mut Outbox) {
        self.acknowledge_sender.received_register_peer(leader, outbox);
    }

    pub fn received_acknowledge_register_peer(&mut self, from: &Peer, outbox: &mut Outbox) {
        match self.register_sender.as_mut() {
            Some(sender) => sender.received_acknowledge_register_peer(from, outbox),
            None => debug!(subject = %self.subject, from = %from, "Unexpected AcknowledgeRegisterPeer"),
        }
    }

    pub fn received_register_peer_complete(&mut self) {
        self.acknowledge_sender.received_register_peer_complete();
    }

    pub fn try_send(&mut self, outbox: &mut Outbox) {
        if let Some(sender) = self.register_sender.as_mut() {
            sender.try_send(outbox);
        }
        if self.behavior.needs_to_send_acknowledge_register_peer && !self.ready_sender.is_finished() {
            self.acknowledge_sender.try_send(outbox);
        }
        let progress = self.progress();
        self.ready_sender.try_send(progress, outbox);
    }

    fn progress(&self) -> RegisterPeerProgress {
        RegisterPeerProgress {
            register_peer_acknowledged: self
                .register_sender
                .as_ref()
                .map_or(true, RegisterPeerSender::is_finished),
            register_peer_complete_received: self.acknowledge_sender.complete_received(),
        }
    }

    pub fn behavior(&self) -> RegisterPeerForwarderBehaviorConfig {
        self.behavior
    }

    pub fn is_ready(&self) -> bool {
        self.ready_sender.is_finished()
    }

    pub fn is_ready_to_stop(&self) -> bool {
        self.ready_sender.is_finished()
            && self
                .register_sender
                .as_ref()
                .map_or(true, RegisterPeerSender::is_finished)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
