//! Signaling messages spoken between sessions and the signaling / relay server.
//!
//! All messages are JSON objects with a kebab-case `type` tag and camelCase
//! fields, e.g. `{"type":"join-room","roomId":"room_…","role":"viewer","mode":"mesh"}`.
//! The mesh architecture only needs the room and offer/answer/ICE messages;
//! the relay architecture additionally negotiates transports, producers and
//! consumers with the relay.

use serde::{Deserialize, Serialize};

use crate::models::{Architecture, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum SignalMessage {
    // ── Room membership (both architectures) ────────────────────────
    JoinRoom {
        room_id: String,
        role: Role,
        mode: Architecture,
    },
    PeerJoined {
        peer_id: String,
        role: Role,
    },
    PeerLeft {
        peer_id: String,
    },

    // ── Direct peer negotiation (mesh) ──────────────────────────────
    Offer {
        to: String,
        room_id: String,
        sdp: String,
    },
    Answer {
        to: String,
        room_id: String,
        sdp: String,
    },
    IceCandidate {
        to: String,
        room_id: String,
        candidate: serde_json::Value,
    },

    // ── Relay negotiation ───────────────────────────────────────────
    JoinSfuRoom {
        room_id: String,
        role: Role,
    },
    RouterRtpCapabilities {
        rtp_capabilities: serde_json::Value,
    },
    CreateWebrtcTransport {
        room_id: String,
        transport_id: String,
        direction: TransportDirection,
    },
    ConnectWebrtcTransport {
        transport_id: String,
        dtls_parameters: serde_json::Value,
    },
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    },
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: serde_json::Value,
    },
    ResumeConsumer {
        consumer_id: String,
    },
    NewProducer {
        producer_id: String,
        peer_id: String,
    },
}

impl SignalMessage {
    /// The wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::JoinRoom { .. } => "join-room",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::PeerLeft { .. } => "peer-left",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::JoinSfuRoom { .. } => "join-sfu-room",
            SignalMessage::RouterRtpCapabilities { .. } => "router-rtp-capabilities",
            SignalMessage::CreateWebrtcTransport { .. } => "create-webrtc-transport",
            SignalMessage::ConnectWebrtcTransport { .. } => "connect-webrtc-transport",
            SignalMessage::Produce { .. } => "produce",
            SignalMessage::Consume { .. } => "consume",
            SignalMessage::ResumeConsumer { .. } => "resume-consumer",
            SignalMessage::NewProducer { .. } => "new-producer",
        }
    }

    /// Recipient peer for point-to-point messages.
    pub fn addressed_to(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_wire_shape() {
        let msg = SignalMessage::JoinRoom {
            room_id: "room_1".into(),
            role: Role::Viewer,
            mode: Architecture::Mesh,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({"type": "join-room", "roomId": "room_1", "role": "viewer", "mode": "mesh"})
        );
        assert_eq!(msg.kind(), v["type"]);
    }

    #[test]
    fn relay_messages_use_kebab_case_tags() {
        let msg = SignalMessage::CreateWebrtcTransport {
            room_id: "r".into(),
            transport_id: "t1".into(),
            direction: TransportDirection::Send,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "create-webrtc-transport");
        assert_eq!(v["transportId"], "t1");

        let parsed: SignalMessage = serde_json::from_value(json!({
            "type": "resume-consumer",
            "consumerId": "c9"
        }))
        .unwrap();
        assert_eq!(
            parsed,
            SignalMessage::ResumeConsumer {
                consumer_id: "c9".into()
            }
        );
    }

    #[test]
    fn point_to_point_messages_expose_recipient() {
        let offer = SignalMessage::Offer {
            to: "ses_b".into(),
            room_id: "r".into(),
            sdp: "v=0".into(),
        };
        assert_eq!(offer.addressed_to(), Some("ses_b"));
        let left = SignalMessage::PeerLeft {
            peer_id: "ses_b".into(),
        };
        assert_eq!(left.addressed_to(), None);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = serde_json::from_value::<SignalMessage>(json!({"type": "kick", "peerId": "x"}));
        assert!(err.is_err());
    }
}
