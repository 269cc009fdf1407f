//! Event types flowing through the fan-out router and replay log.
//!
//! An event is an immutable fact: once assigned an id it is never mutated.
//! Ids are monotonic and gapless within one room; nothing is guaranteed
//! across rooms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved stream for global events (`admin_count`, `presence`). Every live
/// connection is implicitly subscribed to it; membership checks do not apply.
pub const SYSTEM_STREAM: &str = "system";

/// Event categories, matching the wire `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Invite,
    Report,
    AdminCount,
    Typing,
    Presence,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Invite => "invite",
            Self::Report => "report",
            Self::AdminCount => "admin_count",
            Self::Typing => "typing",
            Self::Presence => "presence",
        }
    }
}

/// Structured payloads, serialized as `{"body": "...", ...fields}`.
///
/// Only `MessagePosted` is durable; everything else lives in the in-memory
/// replay ring and is gone after a restart (clients refetch over REST).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "body", rename_all = "snake_case")]
pub enum EventBody {
    /// A new chat message. `client_token` echoes the sender's idempotency
    /// token so their optimistic entry can be replaced exactly once.
    MessagePosted {
        message_id: String,
        sender_id: String,
        sender_name: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_token: Option<String>,
    },
    /// A message was removed by its author or a moderator. `target_event_id`
    /// is the id the original `MessagePosted` event carried.
    MessageDeleted {
        message_id: String,
        target_event_id: u64,
        deleted_by: String,
    },
    /// Someone was invited into the room.
    InviteCreated {
        invitation_id: String,
        inviter_id: String,
        invitee_id: String,
    },
    /// A pending invitation became a membership.
    InviteAccepted {
        invitation_id: String,
        invitee_id: String,
    },
    /// A pending invitation was declined or cancelled without side effects.
    InviteRevoked {
        invitation_id: String,
        revoked_by: String,
    },
    /// A member filed a report. Fanned out only to level >= 2 connections.
    ReportFiled {
        report_id: String,
        reporter_id: String,
        target_kind: String,
        target_id: String,
        reason: String,
    },
    /// Number of platform admins currently online. System stream only.
    AdminOnline { online: i64 },
    /// Transient typing indicator.
    Typing { user_id: String, username: String },
    /// A user came online or went fully offline. System stream only.
    PresenceChanged {
        user_id: String,
        username: String,
        online: bool,
    },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessagePosted { .. } | Self::MessageDeleted { .. } => EventKind::Message,
            Self::InviteCreated { .. }
            | Self::InviteAccepted { .. }
            | Self::InviteRevoked { .. } => EventKind::Invite,
            Self::ReportFiled { .. } => EventKind::Report,
            Self::AdminOnline { .. } => EventKind::AdminCount,
            Self::Typing { .. } => EventKind::Typing,
            Self::PresenceChanged { .. } => EventKind::Presence,
        }
    }

    /// Whether this payload is persisted to the message log.
    pub fn is_durable(&self) -> bool {
        matches!(self, Self::MessagePosted { .. })
    }
}

/// One sequenced event in a room's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    pub room_id: String,
    pub kind: EventKind,
    #[serde(flatten)]
    pub payload: EventBody,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_id: u64, room_id: &str, payload: EventBody) -> Self {
        Self {
            event_id,
            room_id: room_id.to_string(),
            kind: payload.kind(),
            payload,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_maps_to_kind() {
        let body = EventBody::Typing {
            user_id: "u1".into(),
            username: "ada".into(),
        };
        assert_eq!(body.kind(), EventKind::Typing);
        assert!(!body.is_durable());

        let msg = EventBody::MessagePosted {
            message_id: "m1".into(),
            sender_id: "u1".into(),
            sender_name: "ada".into(),
            content: "hi".into(),
            client_token: Some("t-1".into()),
        };
        assert_eq!(msg.kind(), EventKind::Message);
        assert!(msg.is_durable());
    }

    #[test]
    fn event_wire_shape() {
        let event = Event::new(
            7,
            "room-1",
            EventBody::AdminOnline { online: 2 },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_id"], 7);
        assert_eq!(json["room_id"], "room-1");
        assert_eq!(json["kind"], "admin_count");
        assert_eq!(json["body"], "admin_online");
        assert_eq!(json["online"], 2);
    }
}
