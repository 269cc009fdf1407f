//! JSON frame protocol for the push channel.
//!
//! Frames are tagged with a `type` field in both directions. The client
//! speaks the same ids as the REST surface, so a pushed event and a fetched
//! record referring to the same entity carry byte-identical ids.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::api::ApiError;
use crate::moderation::actions::active_timeout;
use crate::moderation::gate::{self, Action};
use crate::realtime::event::{Event, EventBody, SYSTEM_STREAM};
use crate::realtime::registry::ConnectionHandle;
use crate::state::AppState;

const MAX_CONTENT_LENGTH: usize = 4000;

/// Client -> server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame after connect; `resume` maps room_id to the last event id
    /// the client observed there.
    Hello {
        #[serde(default)]
        resume: HashMap<String, u64>,
    },
    Heartbeat,
    SendMessage {
        room_id: String,
        content: String,
        /// Idempotency token; echoed on the authoritative event so the
        /// sender can replace its optimistic entry.
        #[serde(default)]
        client_token: Option<String>,
    },
    Typing {
        room_id: String,
    },
    GetAdminCount,
    Replay {
        room_id: String,
        last_seen_event_id: u64,
    },
}

/// Server -> client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Reply to `hello`: the connection id plus, per resumed room, whether
    /// gap-free replay was possible. Rooms that resumed cleanly get their
    /// events in `replay_batch` frames right after.
    Ready {
        connection_id: String,
        resumed: Vec<ResumeResult>,
    },
    /// A fanned-out event. `silent` means the user muted the room: count it
    /// as unread, skip the alert.
    Event {
        #[serde(flatten)]
        event: Event,
        silent: bool,
    },
    ReplayBatch {
        room_id: String,
        events: Vec<Event>,
    },
    /// Replay cannot be served gap-free (retention expired or this
    /// connection overflowed): refetch full state over REST.
    ResyncRequired {
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        reason: String,
    },
    /// Reply to `get_admin_count`; the same counter feeds the pushed
    /// `admin_count` events, so push and pull never disagree.
    AdminCount {
        online: i64,
    },
    /// A support ticket the user owns (or, for admins, any ticket) changed.
    TicketUpdate {
        ticket_id: String,
        status: String,
    },
    Error {
        code: String,
        message: String,
    },
    Pong,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeResult {
    pub room_id: String,
    pub resync_required: bool,
}

fn send_error(conn: &ConnectionHandle, err: &ApiError) {
    conn.try_reply(ServerFrame::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    });
}

/// Handle one decoded client frame. Replies and errors go back through the
/// connection's own queue; fan-out to other connections goes through the
/// event router.
pub async fn handle_client_frame(state: &AppState, conn: &ConnectionHandle, frame: ClientFrame) {
    match frame {
        ClientFrame::Hello { resume } => handle_hello(state, conn, resume).await,

        ClientFrame::Heartbeat => {
            conn.try_reply(ServerFrame::Pong);
            // A connection that overflowed learns it here rather than after
            // silently missing events until reconnect.
            if conn.needs_resync() {
                conn.try_reply(ServerFrame::ResyncRequired {
                    room_id: None,
                    reason: "outbound queue overflowed".to_string(),
                });
            }
        }

        ClientFrame::SendMessage {
            room_id,
            content,
            client_token,
        } => {
            if let Err(err) = handle_send_message(state, conn, &room_id, &content, client_token).await
            {
                send_error(conn, &err);
            }
        }

        ClientFrame::Typing { room_id } => {
            if let Err(err) = handle_typing(state, conn, &room_id).await {
                send_error(conn, &err);
            }
        }

        ClientFrame::GetAdminCount => {
            conn.try_reply(ServerFrame::AdminCount {
                online: state.presence.online_admin_count(),
            });
        }

        ClientFrame::Replay {
            room_id,
            last_seen_event_id,
        } => {
            if let Err(err) = handle_replay(state, conn, &room_id, last_seen_event_id).await {
                send_error(conn, &err);
            }
        }
    }
}

async fn handle_hello(state: &AppState, conn: &ConnectionHandle, resume: HashMap<String, u64>) {
    let mut resumed = Vec::new();
    let mut batches = Vec::new();

    for (room_id, last_seen) in resume {
        // Resume only rooms the user still belongs to; the system stream is
        // implicit for everyone.
        if room_id != SYSTEM_STREAM && !state.memberships.is_member(&room_id, &conn.user_id) {
            continue;
        }
        match state.router.replay_since(&room_id, last_seen).await {
            Ok(Ok(events)) => {
                resumed.push(ResumeResult {
                    room_id: room_id.clone(),
                    resync_required: false,
                });
                if !events.is_empty() {
                    batches.push(ServerFrame::ReplayBatch { room_id, events });
                }
            }
            Ok(Err(_gap)) => {
                resumed.push(ResumeResult {
                    room_id,
                    resync_required: true,
                });
            }
            Err(err) => {
                send_error(conn, &err);
                return;
            }
        }
    }

    conn.try_reply(ServerFrame::Ready {
        connection_id: conn.connection_id.clone(),
        resumed,
    });
    for batch in batches {
        conn.try_reply(batch);
    }
}

async fn handle_send_message(
    state: &AppState,
    conn: &ConnectionHandle,
    room_id: &str,
    content: &str,
    client_token: Option<String>,
) -> Result<(), ApiError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ApiError::Validation("message content is empty".to_string()));
    }
    if content.len() > MAX_CONTENT_LENGTH {
        return Err(ApiError::Validation(format!(
            "message content exceeds {} characters",
            MAX_CONTENT_LENGTH
        )));
    }

    gate::authorize(&state.memberships, &conn.user_id, room_id, Action::PostMessage)
        .map_err(ApiError::PermissionDenied)?;

    if let Some(until) = active_timeout(&state.db, room_id, &conn.user_id).await? {
        tracing::debug!(
            user_id = %conn.user_id,
            room_id = %room_id,
            until = %until,
            "message rejected, user timed out"
        );
        return Err(ApiError::PermissionDenied(
            gate::DenyReason::InsufficientPermission,
        ));
    }

    let sender_name = lookup_username(state, &conn.user_id).await?;
    state
        .router
        .post_message(
            room_id,
            &conn.user_id,
            &sender_name,
            content,
            client_token.as_deref(),
        )
        .await?;
    Ok(())
}

async fn handle_typing(
    state: &AppState,
    conn: &ConnectionHandle,
    room_id: &str,
) -> Result<(), ApiError> {
    gate::authorize(&state.memberships, &conn.user_id, room_id, Action::PostMessage)
        .map_err(ApiError::PermissionDenied)?;

    let username = lookup_username(state, &conn.user_id).await?;
    state
        .router
        .publish(
            room_id,
            EventBody::Typing {
                user_id: conn.user_id.clone(),
                username,
            },
        )
        .await?;
    Ok(())
}

async fn handle_replay(
    state: &AppState,
    conn: &ConnectionHandle,
    room_id: &str,
    last_seen: u64,
) -> Result<(), ApiError> {
    if room_id != SYSTEM_STREAM && !state.memberships.is_member(room_id, &conn.user_id) {
        return Err(ApiError::NotFound("room".to_string()));
    }

    match state.router.replay_since(room_id, last_seen).await? {
        Ok(events) => {
            conn.try_reply(ServerFrame::ReplayBatch {
                room_id: room_id.to_string(),
                events,
            });
        }
        Err(_gap) => {
            conn.try_reply(ServerFrame::ResyncRequired {
                room_id: Some(room_id.to_string()),
                reason: "retention expired for the requested range".to_string(),
            });
        }
    }
    Ok(())
}

async fn lookup_username(state: &AppState, user_id: &str) -> Result<String, ApiError> {
    let db = state.db.clone();
    let uid = user_id.to_string();
    crate::api::blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.query_row("SELECT username FROM users WHERE id = ?1", [&uid], |row| {
            row.get(0)
        })
        .map_err(|_| ApiError::NotFound("user".to_string()))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_decode_from_tagged_json() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"send_message","room_id":"general","content":"hi","client_token":"t-1"}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::SendMessage {
                room_id,
                content,
                client_token,
            } => {
                assert_eq!(room_id, "general");
                assert_eq!(content, "hi");
                assert_eq!(client_token.as_deref(), Some("t-1"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        let hello: ClientFrame = serde_json::from_str(r#"{"type":"hello"}"#).unwrap();
        assert!(matches!(hello, ClientFrame::Hello { resume } if resume.is_empty()));
    }

    #[test]
    fn event_frame_flattens_event_fields() {
        let frame = ServerFrame::Event {
            event: Event::new(3, "general", EventBody::AdminOnline { online: 1 }),
            silent: true,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event_id"], 3);
        assert_eq!(json["room_id"], "general");
        assert_eq!(json["silent"], true);
    }
}
