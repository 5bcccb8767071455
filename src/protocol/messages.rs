//! Protocol message definitions
//!
//! A transmission is a multipart frame set. Frame 0 is the JSON envelope
//! naming source, destination and the message; any further frames are the
//! opaque payload of a `PAYLOAD` message.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::Frame;

use super::{ConnectionInfo, ProtocolVersion};

// ─────────────────────────────────────────────────────────────────
// Message Envelope
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: ProtocolVersion,
    pub source: ConnectionInfo,
    pub destination: ConnectionInfo,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(source: ConnectionInfo, destination: ConnectionInfo, message: Message) -> Self {
        Self {
            version: ProtocolVersion::default(),
            source,
            destination,
            message,
        }
    }

    /// Encode into a frame set: the JSON envelope followed by `payload`
    pub fn encode(&self, payload: Vec<Frame>) -> Result<Vec<Frame>> {
        if !payload.is_empty() && !matches!(self.message, Message::Payload { .. }) {
            return Err(Error::malformed(format!(
                "{} cannot carry payload frames",
                self.message.type_name()
            )));
        }
        let mut frames = Vec::with_capacity(payload.len() + 1);
        frames.push(serde_json::to_vec(self)?);
        frames.extend(payload);
        Ok(frames)
    }

    /// Split a received frame set into the envelope and its payload frames
    pub fn decode(mut frames: Vec<Frame>) -> Result<(Self, Vec<Frame>)> {
        if frames.is_empty() {
            return Err(Error::malformed("empty frame set"));
        }
        let payload = frames.split_off(1);
        let envelope: Envelope = serde_json::from_slice(&frames[0])
            .map_err(|e| Error::malformed(format!("invalid envelope: {}", e)))?;
        if !payload.is_empty() && !matches!(envelope.message, Message::Payload { .. }) {
            return Err(Error::malformed(format!(
                "{} arrived with {} payload frames",
                envelope.message.type_name(),
                payload.len()
            )));
        }
        Ok((envelope, payload))
    }
}

// ─────────────────────────────────────────────────────────────────
// Message Types (Discriminated Union)
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // ─── Connection handshake ───────────────────────────────────
    SynchronizeConnection { attempt: u64 },
    AcknowledgeConnection,

    // ─── Registration forwarding ────────────────────────────────
    /// Introduces `peer` to the receiver
    RegisterPeer { peer: ConnectionInfo },
    AcknowledgeRegisterPeer { peer: ConnectionInfo },
    /// Every target of `peer` has acknowledged its introduction
    RegisterPeerComplete { peer: ConnectionInfo },

    // ─── Payload delivery ───────────────────────────────────────
    /// `first_unacknowledged` is the sender's oldest in-flight sequence
    /// number; anything below it was acknowledged or abandoned.
    Payload {
        sequence_number: u64,
        first_unacknowledged: u64,
    },
    AcknowledgePayload { sequence_number: u64 },

    // ─── Close handshake ────────────────────────────────────────
    CloseConnection,
    AcknowledgeCloseConnection,

    // ─── Local notifications (never sent on the wire) ───────────
    PeerRegisterForwarderIsReady { peer: ConnectionInfo },
    ConnectionIsReady,
    AbortPayload { sequence_number: u64, reason: String },
    ConnectionIsClosed,
    Timeout { reason: String },
}

impl Message {
    /// Wire name of the variant, for logs
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::SynchronizeConnection { .. } => "SYNCHRONIZE_CONNECTION",
            Message::AcknowledgeConnection => "ACKNOWLEDGE_CONNECTION",
            Message::RegisterPeer { .. } => "REGISTER_PEER",
            Message::AcknowledgeRegisterPeer { .. } => "ACKNOWLEDGE_REGISTER_PEER",
            Message::RegisterPeerComplete { .. } => "REGISTER_PEER_COMPLETE",
            Message::Payload { .. } => "PAYLOAD",
            Message::AcknowledgePayload { .. } => "ACKNOWLEDGE_PAYLOAD",
            Message::CloseConnection => "CLOSE_CONNECTION",
            Message::AcknowledgeCloseConnection => "ACKNOWLEDGE_CLOSE_CONNECTION",
            Message::PeerRegisterForwarderIsReady { .. } => "PEER_REGISTER_FORWARDER_IS_READY",
            Message::ConnectionIsReady => "CONNECTION_IS_READY",
            Message::AbortPayload { .. } => "ABORT_PAYLOAD",
            Message::ConnectionIsClosed => "CONNECTION_IS_CLOSED",
            Message::Timeout { .. } => "TIMEOUT",
        }
    }

    /// Notifications raised by a peer's state machines for the control loop
    pub fn is_local_notification(&self) -> bool {
        matches!(
            self,
            Message::PeerRegisterForwarderIsReady { .. }
                | Message::ConnectionIsReady
                | Message::AbortPayload { .. }
                | Message::ConnectionIsClosed
                | Message::Timeout { .. }
        )
    }

    /// Registration forwarding messages concern their subject peer rather
    /// than the endpoint that sent them.
    pub fn subject(&self) -> Option<&ConnectionInfo> {
        match self {
            Message::RegisterPeer { peer }
            | Message::AcknowledgeRegisterPeer { peer }
            | Message::RegisterPeerComplete { peer } => Some(peer),
            _ => None,
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> ConnectionInfo {
        ConnectionInfo::new(name, "127.0.0.1", 4000, "g")
    }

    #[test]
    fn test_message_tag_is_screaming_snake_case() {
        let json = serde_json::to_value(Message::SynchronizeConnection { attempt: 3 }).unwrap();
        assert_eq!(json["type"], "SYNCHRONIZE_CONNECTION");
        assert_eq!(json["attempt"], 3);

        let json = serde_json::to_value(Message::CloseConnection).unwrap();
        assert_eq!(json["type"], "CLOSE_CONNECTION");
    }

    #[test]
    fn test_type_name_matches_serde_tag() {
        let messages = vec![
            Message::AcknowledgeConnection,
            Message::RegisterPeer { peer: info("a") },
            Message::AbortPayload { sequence_number: 1, reason: "x".into() },
            Message::Timeout { reason: "y".into() },
        ];
        for message in messages {
            let json = serde_json::to_value(&message).unwrap();
            assert_eq!(json["type"], message.type_name());
        }
    }

    #[test]
    fn test_payload_frames_follow_envelope() {
        let envelope = Envelope::new(info("a"), info("b"), Message::Payload { sequence_number: 9, first_unacknowledged: 7 });
        let frames = envelope
            .encode(vec![b"hello".to_vec(), vec![], vec![0xff; 3]])
            .unwrap();
        assert_eq!(frames.len(), 4);

        let (decoded, payload) = Envelope::decode(frames).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(payload, vec![b"hello".to_vec(), vec![], vec![0xff; 3]]);
    }

    #[test]
    fn test_control_message_rejects_payload_frames() {
        let envelope = Envelope::new(info("a"), info("b"), Message::AcknowledgeConnection);
        assert!(envelope.encode(vec![b"x".to_vec()]).is_err());

        let mut frames = envelope.encode(vec![]).unwrap();
        frames.push(b"smuggled".to_vec());
        assert!(Envelope::decode(frames).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Envelope::decode(vec![]).is_err());
        assert!(Envelope::decode(vec![b"{not json".to_vec()]).is_err());
    }

    #[test]
    fn test_subject_routing() {
        let p = info("subject");
        assert_eq!(Message::RegisterPeerComplete { peer: p.clone() }.subject(), Some(&p));
        assert_eq!(Message::AcknowledgePayload { sequence_number: 1 }.subject(), None);
    }

    #[test]
    fn test_local_notifications() {
        assert!(Message::ConnectionIsClosed.is_local_notification());
        assert!(Message::ConnectionIsReady.is_local_notification());
        assert!(!Message::CloseConnection.is_local_notification());
        assert!(!Message::Payload { sequence_number: 0, first_unacknowledged: 0 }.is_local_notification());
    }
}
