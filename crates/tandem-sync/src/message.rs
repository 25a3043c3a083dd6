//! Wire frame types for the realtime channel.
//!
//! Every frame is a JSON object with a `type` discriminant and a
//! type-specific `data` payload. The `ping`/`pong` discriminants are reserved
//! control frames and never reach application consumers. Two channel kinds
//! share this vocabulary: the per-event room carries chat and checklist
//! updates, the pairing feed carries partner-level notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::{ChecklistItem, EventMessage};

use crate::error::Result;

/// Reference payload for a deleted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRef {
    pub message_id: String,
}

/// Reference payload for a deleted checklist item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRef {
    pub item_id: String,
}

/// Reference payload for a deleted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRef {
    pub event_id: String,
}

/// Frames pushed by the server.
///
/// Proposal and partner payloads are passed through as raw JSON; the sync
/// layer never inspects them, only the views do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Server-initiated liveness probe; must be answered with a pong.
    Ping,
    /// Answer to a client-initiated ping.
    Pong,
    NewMessage { data: EventMessage },
    DeleteMessage { data: MessageRef },
    NewChecklistItem { data: ChecklistItem },
    UpdateChecklistItem { data: ChecklistItem },
    DeleteChecklistItem { data: ItemRef },
    PartnerConnected { data: Value },
    PartnerDisconnected { data: Value },
    ProposalCreated { data: Value },
    ProposalUpdated { data: Value },
    EventCreated { data: Value },
    EventDeleted { data: EventRef },
    /// Discriminant this client does not know; tolerated and dropped so the
    /// server can grow its vocabulary ahead of deployed clients.
    #[serde(other)]
    Unknown,
}

/// Control frames sent by the client. Application pushes go out as raw JSON
/// via [`crate::ChannelConnection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Pong,
}

impl ServerFrame {
    /// Parse a frame off the wire.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// True for the reserved `ping`/`pong` discriminants.
    pub fn is_control(&self) -> bool {
        matches!(self, ServerFrame::Ping | ServerFrame::Pong)
    }
}

impl ClientFrame {
    /// Serialize for sending.
    pub fn to_json(&self) -> String {
        // Both variants are unit-like; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"ping\"}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_new_message_frame() {
        let json = r#"{
            "type": "new_message",
            "data": {
                "id": "m1",
                "event_id": "e1",
                "sender_id": "u1",
                "content": "see you at 7",
                "created_at": "2025-06-01T10:00:00Z",
                "updated_at": "2025-06-01T10:00:00Z"
            }
        }"#;
        match ServerFrame::from_json(json).unwrap() {
            ServerFrame::NewMessage { data } => {
                assert_eq!(data.id, "m1");
                assert_eq!(data.event_id, "e1");
            }
            other => panic!("expected NewMessage, got {other:?}"),
        }
    }

    #[test]
    fn parse_delete_frames() {
        let frame =
            ServerFrame::from_json(r#"{"type":"delete_message","data":{"message_id":"m9"}}"#)
                .unwrap();
        assert_eq!(
            frame,
            ServerFrame::DeleteMessage {
                data: MessageRef {
                    message_id: "m9".into()
                }
            }
        );

        let frame =
            ServerFrame::from_json(r#"{"type":"event_deleted","data":{"event_id":"e3"}}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::EventDeleted {
                data: EventRef {
                    event_id: "e3".into()
                }
            }
        );
    }

    #[test]
    fn control_frames() {
        assert!(ServerFrame::from_json(r#"{"type":"ping"}"#)
            .unwrap()
            .is_control());
        assert!(ServerFrame::from_json(r#"{"type":"pong"}"#)
            .unwrap()
            .is_control());
        assert!(!ServerFrame::from_json(r#"{"type":"partner_connected","data":{}}"#)
            .unwrap()
            .is_control());
    }

    #[test]
    fn unknown_discriminant_is_tolerated() {
        let frame = ServerFrame::from_json(r#"{"type":"reminders","data":[1,2,3]}"#).unwrap();
        assert_eq!(frame, ServerFrame::Unknown);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(ServerFrame::from_json("not json").is_err());
    }

    #[test]
    fn client_frame_round_trip() {
        assert_eq!(ClientFrame::Ping.to_json(), r#"{"type":"ping"}"#);
        assert_eq!(ClientFrame::Pong.to_json(), r#"{"type":"pong"}"#);
    }
}
