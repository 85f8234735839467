//! Signaling envelopes.
//!
//! JSON messages exchanged with browsers and relayed between nodes. The
//! `type` tag and camelCase field names match what WebRTC clients send:
//!
//! ```json
//! {"type":"join","roomId":"r1","role":"viewer"}
//! {"type":"offer","targetId":"<uuid>","offer":{"sdp":"v=0","type":"offer"}}
//! ```

use serde::{Deserialize, Serialize};
use tandem_core::Fault;

/// Substrate keys and channels owned by the signaling service.
pub(crate) mod keys {
    pub const ROOMS_INDEX: &str = "signaling:rooms";
    pub const RELAY_CHANNEL: &str = "signaling:relay";

    pub fn members(room_id: &str) -> String {
        format!("signaling:rooms:{room_id}:members")
    }

    pub fn client(client_id: &str) -> String {
        format!("signaling:clients:{client_id}")
    }

    pub fn server(node_id: &str) -> String {
        format!("signaling:servers:{node_id}")
    }
}

/// Role of a client inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Broadcaster,
    Editor,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Broadcaster => "broadcaster",
            Self::Editor => "editor",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = Fault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Self::Viewer),
            "broadcaster" => Ok(Self::Broadcaster),
            "editor" => Ok(Self::Editor),
            other => Err(Fault::invalid(format!("unknown role: {other:?}"))),
        }
    }
}

/// A room participant as reported in `joined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub role: String,
}

/// Every message on the signaling socket and the relay channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Server greeting carrying the generated client id.
    Welcome {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    /// Client request to enter a room. Fields are optional so a malformed
    /// join surfaces as `InvalidInput` instead of a parse failure.
    Join {
        #[serde(rename = "roomId", default)]
        room_id: Option<String>,
        #[serde(default)]
        role: Option<String>,
    },
    /// Join confirmation with the current participant list.
    Joined {
        #[serde(rename = "roomId")]
        room_id: String,
        participants: Vec<Participant>,
    },
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: String,
        role: String,
    },
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    Offer {
        #[serde(rename = "targetId")]
        target_id: String,
        #[serde(rename = "fromId", default)]
        from_id: Option<String>,
        offer: serde_json::Value,
    },
    Answer {
        #[serde(rename = "targetId")]
        target_id: String,
        #[serde(rename = "fromId", default)]
        from_id: Option<String>,
        answer: serde_json::Value,
    },
    IceCandidate {
        #[serde(rename = "targetId")]
        target_id: String,
        #[serde(rename = "fromId", default)]
        from_id: Option<String>,
        candidate: serde_json::Value,
    },
    Leave,
    Error {
        code: String,
        message: String,
    },
}

impl Envelope {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Routed messages carry a target; everything else is hub-addressed.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::Offer { target_id, .. }
            | Self::Answer { target_id, .. }
            | Self::IceCandidate { target_id, .. } => Some(target_id),
            _ => None,
        }
    }

    /// Whether an undeliverable message is reported back to the sender.
    /// ICE candidates are fire-and-forget; offers and answers are not.
    pub fn reports_missing_target(&self) -> bool {
        matches!(self, Self::Offer { .. } | Self::Answer { .. })
    }

    /// Stamp the sender id onto a routed message.
    pub fn with_from(mut self, sender: &str) -> Self {
        match &mut self {
            Self::Offer { from_id, .. }
            | Self::Answer { from_id, .. }
            | Self::IceCandidate { from_id, .. } => *from_id = Some(sender.to_string()),
            _ => {}
        }
        self
    }
}

/// Cross-node relay frame published on `signaling:relay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayFrame {
    pub origin_node: String,
    pub target_node: String,
    pub target_client_id: String,
    pub envelope: Envelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_wire_shape() {
        let env: Envelope =
            serde_json::from_str(r#"{"type":"join","roomId":"r1","role":"viewer"}"#).unwrap();
        assert_eq!(
            env,
            Envelope::Join {
                room_id: Some("r1".to_string()),
                role: Some("viewer".to_string()),
            }
        );

        // Missing fields still parse; validation happens in the hub.
        let partial: Envelope = serde_json::from_str(r#"{"type":"join"}"#).unwrap();
        assert_eq!(
            partial,
            Envelope::Join {
                room_id: None,
                role: None
            }
        );
    }

    #[test]
    fn test_offer_wire_shape() {
        let env = Envelope::Offer {
            target_id: "t1".to_string(),
            from_id: Some("f1".to_string()),
            offer: serde_json::json!({"sdp": "v=0", "type": "offer"}),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""type":"offer""#));
        assert!(json.contains(r#""targetId":"t1""#));
        assert!(json.contains(r#""fromId":"f1""#));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_ice_candidate_tag_is_kebab_case() {
        let env = Envelope::IceCandidate {
            target_id: "t".to_string(),
            from_id: None,
            candidate: serde_json::json!({}),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""type":"ice-candidate""#));
    }

    #[test]
    fn test_target_and_reporting_classification() {
        let offer = Envelope::Offer {
            target_id: "t".to_string(),
            from_id: None,
            offer: serde_json::json!({}),
        };
        let ice = Envelope::IceCandidate {
            target_id: "t".to_string(),
            from_id: None,
            candidate: serde_json::json!({}),
        };
        assert_eq!(offer.target_id(), Some("t"));
        assert!(offer.reports_missing_target());
        assert!(!ice.reports_missing_target());
        assert_eq!(Envelope::Leave.target_id(), None);
    }

    #[test]
    fn test_with_from_stamps_sender() {
        let stamped = Envelope::Answer {
            target_id: "t".to_string(),
            from_id: None,
            answer: serde_json::json!({}),
        }
        .with_from("me");
        match stamped {
            Envelope::Answer { from_id, .. } => assert_eq!(from_id.as_deref(), Some("me")),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("viewer".parse::<Role>().unwrap(), Role::Viewer);
        assert_eq!("broadcaster".parse::<Role>().unwrap(), Role::Broadcaster);
        assert!("spectator".parse::<Role>().is_err());
    }

    #[test]
    fn test_relay_frame_roundtrip() {
        let frame = RelayFrame {
            origin_node: "a".to_string(),
            target_node: "b".to_string(),
            target_client_id: "c1".to_string(),
            envelope: Envelope::Leave,
        };
        let bytes = serde_json::to_vec(&frame).unwrap();
        let back: RelayFrame = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.target_node, "b");
        assert_eq!(back.envelope, Envelope::Leave);
    }
}
