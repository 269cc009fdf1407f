//! Room CRUD and membership REST surface.
//!
//! Rooms cover topics (public, joinable by anyone), group chats (invite
//! only), and direct conversations (created by the friends flow, never
//! directly). All handlers answer the `{success, data, errors}` envelope and
//! mirror membership writes into the in-memory index before returning.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{blocking, ok_empty, ApiError, ApiResponse, Empty};
use crate::auth::middleware::Claims;
use crate::moderation::gate::DenyReason;
use crate::rooms::membership::{LEVEL_MEMBER, LEVEL_MODERATOR, LEVEL_OWNER};
use crate::state::AppState;

pub const KIND_TOPIC: &str = "topic";
pub const KIND_GROUP_CHAT: &str = "group_chat";
pub const KIND_DIRECT_CHAT: &str = "direct_chat";

const MAX_NAME_LENGTH: usize = 80;

// --- Response types ---

#[derive(Debug, Serialize)]
pub struct RoomResponse {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub state: String,
    /// Requester's level in the room, absent for non-members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub my_level: Option<i64>,
    pub member_count: i64,
    pub online_count: i64,
    /// Highest event id assigned in this room; clients derive unread counts
    /// from it against their own last-seen id.
    pub latest_event_id: u64,
}

#[derive(Debug, Serialize)]
pub struct RoomListResponse {
    pub rooms: Vec<RoomResponse>,
}

#[derive(Debug, Serialize)]
pub struct MemberResponse {
    pub user_id: String,
    pub username: String,
    pub level: i64,
    pub is_online: bool,
}

#[derive(Debug, Serialize)]
pub struct MemberListResponse {
    pub members: Vec<MemberResponse>,
}

#[derive(Debug, Serialize)]
pub struct RoomPresenceResponse {
    pub room_id: String,
    pub online_count: i64,
}

// --- Request types ---

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct SetLevelRequest {
    pub level: i64,
}

// --- Shared row helpers ---

/// Room row fields handlers keep reaching for.
pub struct RoomRow {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub state: String,
}

/// Look up a non-purged room. Must run while holding the DB lock.
pub fn load_room(conn: &rusqlite::Connection, room_id: &str) -> Result<RoomRow, ApiError> {
    conn.query_row(
        "SELECT id, kind, name, state FROM rooms WHERE id = ?1 AND state != 'deleted'",
        [room_id],
        |row| {
            Ok(RoomRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                name: row.get(2)?,
                state: row.get(3)?,
            })
        },
    )
    .map_err(|_| ApiError::NotFound("room".to_string()))
}

// --- Handlers ---

/// GET /api/rooms — public topics plus every room the requester belongs to.
pub async fn list_rooms(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<ApiResponse<RoomListResponse>>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub.clone();

    let rows = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT r.id, r.kind, r.name, r.state,
                        (SELECT COUNT(*) FROM room_members mc WHERE mc.room_id = r.id),
                        (SELECT next_event_id FROM room_sequences s WHERE s.room_id = r.id)
                 FROM rooms r
                 LEFT JOIN room_members m ON m.room_id = r.id AND m.user_id = ?1
                 WHERE r.state != 'deleted' AND (r.kind = 'topic' OR m.user_id IS NOT NULL)
                 ORDER BY r.created_at",
            )
            .map_err(|_| ApiError::Internal)?;
        let rows: Vec<(String, String, String, String, i64, Option<i64>)> = stmt
            .query_map([&user_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })
            .map_err(|_| ApiError::Internal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    })
    .await?;

    let rooms = rows
        .into_iter()
        .map(|(id, kind, name, room_state, member_count, next_id)| RoomResponse {
            my_level: state.memberships.level_of(&id, &claims.sub),
            online_count: state.presence.online_count_in(&id),
            latest_event_id: next_id.map(|n| (n as u64).saturating_sub(1)).unwrap_or(0),
            id,
            kind,
            name,
            state: room_state,
            member_count,
        })
        .collect();

    Ok(ApiResponse::ok(RoomListResponse { rooms }))
}

/// POST /api/rooms — create a topic or group chat; the creator becomes the
/// owner (level 3).
pub async fn create_room(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<CreateRoomRequest>,
) -> Result<Json<ApiResponse<RoomResponse>>, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(ApiError::Validation(format!(
            "room name must be 1-{} characters",
            MAX_NAME_LENGTH
        )));
    }
    if req.kind != KIND_TOPIC && req.kind != KIND_GROUP_CHAT {
        return Err(ApiError::Validation(
            "kind must be 'topic' or 'group_chat'".to_string(),
        ));
    }

    let db = state.db.clone();
    let user_id = claims.sub.clone();
    let kind = req.kind.clone();
    let room_name = name.clone();
    let room_id = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let room_id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO rooms (id, kind, name, state, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?5)",
            rusqlite::params![room_id, kind, room_name, user_id, now],
        )
        .map_err(|_| ApiError::Internal)?;
        conn.execute(
            "INSERT INTO room_members (room_id, user_id, level, joined_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![room_id, user_id, LEVEL_OWNER, now],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(room_id)
    })
    .await?;

    state.memberships.add_member(&room_id, &claims.sub, LEVEL_OWNER);
    state.presence.member_joined(&room_id, &claims.sub);
    state.registry.subscribe_user(&claims.sub, &room_id);

    tracing::info!(room_id = %room_id, kind = %req.kind, user_id = %claims.sub, "room created");

    Ok(ApiResponse::ok(RoomResponse {
        id: room_id.clone(),
        kind: req.kind,
        name,
        state: "active".to_string(),
        my_level: Some(LEVEL_OWNER),
        member_count: 1,
        online_count: state.presence.online_count_in(&room_id),
        latest_event_id: 0,
    }))
}

/// POST /api/rooms/{room_id}/join — join a public topic. Group and direct
/// chats are invite-only.
pub async fn join_room(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    if state.memberships.is_member(&room_id, &claims.sub) {
        // Joining a room you are already in is a no-op.
        return Ok(ok_empty());
    }

    let db = state.db.clone();
    let user_id = claims.sub.clone();
    let rid = room_id.clone();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let room = load_room(&conn, &rid)?;
        if room.kind != KIND_TOPIC {
            return Err(ApiError::PermissionDenied(
                DenyReason::InsufficientPermission,
            ));
        }
        let banned: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM room_bans WHERE room_id = ?1 AND user_id = ?2",
                rusqlite::params![rid, user_id],
                |row| row.get::<_, i64>(0).map(|c| c > 0),
            )
            .unwrap_or(false);
        if banned {
            return Err(ApiError::PermissionDenied(
                DenyReason::InsufficientPermission,
            ));
        }
        conn.execute(
            "INSERT OR IGNORE INTO room_members (room_id, user_id, level, joined_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![rid, user_id, LEVEL_MEMBER, Utc::now().to_rfc3339()],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    state.memberships.add_member(&room_id, &claims.sub, LEVEL_MEMBER);
    state.presence.member_joined(&room_id, &claims.sub);
    state.registry.subscribe_user(&claims.sub, &room_id);

    Ok(ok_empty())
}

/// POST /api/rooms/{room_id}/leave
pub async fn leave_room(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    if !state.memberships.is_member(&room_id, &claims.sub) {
        return Err(ApiError::NotFound("membership".to_string()));
    }

    let db = state.db.clone();
    let user_id = claims.sub.clone();
    let rid = room_id.clone();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.execute(
            "DELETE FROM room_members WHERE room_id = ?1 AND user_id = ?2",
            rusqlite::params![rid, user_id],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    state.presence.member_left(&room_id, &claims.sub);
    state.memberships.remove_member(&room_id, &claims.sub);
    state.registry.unsubscribe_user(&claims.sub, &room_id);

    Ok(ok_empty())
}

/// GET /api/rooms/{room_id}/members — members only.
pub async fn list_members(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<ApiResponse<MemberListResponse>>, ApiError> {
    if !state.memberships.is_member(&room_id, &claims.sub) {
        return Err(ApiError::NotFound("room".to_string()));
    }

    let db = state.db.clone();
    let rid = room_id.clone();
    let rows = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let mut stmt = conn
            .prepare(
                "SELECT m.user_id, u.username, m.level FROM room_members m
                 JOIN users u ON u.id = m.user_id
                 WHERE m.room_id = ?1 ORDER BY m.level DESC, u.username",
            )
            .map_err(|_| ApiError::Internal)?;
        let rows: Vec<(String, String, i64)> = stmt
            .query_map([&rid], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(|_| ApiError::Internal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    })
    .await?;

    let members = rows
        .into_iter()
        .map(|(user_id, username, level)| MemberResponse {
            is_online: state.presence.is_online(&user_id),
            user_id,
            username,
            level,
        })
        .collect();

    Ok(ApiResponse::ok(MemberListResponse { members }))
}

/// PUT /api/rooms/{room_id}/members/{user_id}/level — owner only. Levels
/// move only via explicit action by a higher-level user; other owners are
/// out of reach.
pub async fn set_member_level(
    State(state): State<AppState>,
    claims: Claims,
    Path((room_id, target_id)): Path<(String, String)>,
    Json(req): Json<SetLevelRequest>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    if !(LEVEL_MEMBER..=LEVEL_MODERATOR).contains(&req.level) {
        return Err(ApiError::Validation(
            "level must be 1 (member) or 2 (moderator)".to_string(),
        ));
    }
    let actor_level = state
        .memberships
        .level_of(&room_id, &claims.sub)
        .unwrap_or(0);
    if actor_level < LEVEL_OWNER {
        return Err(ApiError::PermissionDenied(
            DenyReason::InsufficientPermission,
        ));
    }
    if target_id == claims.sub {
        return Err(ApiError::PermissionDenied(DenyReason::SelfActionNotAllowed));
    }
    let target_level = state
        .memberships
        .level_of(&room_id, &target_id)
        .ok_or_else(|| ApiError::NotFound("membership".to_string()))?;
    if target_level >= actor_level {
        return Err(ApiError::PermissionDenied(DenyReason::TargetOutranksActor));
    }

    let db = state.db.clone();
    let rid = room_id.clone();
    let tid = target_id.clone();
    let level = req.level;
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.execute(
            "UPDATE room_members SET level = ?1 WHERE room_id = ?2 AND user_id = ?3",
            rusqlite::params![level, rid, tid],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    state.memberships.add_member(&room_id, &target_id, req.level);
    tracing::info!(
        room_id = %room_id,
        target = %target_id,
        level = req.level,
        by = %claims.sub,
        "member level changed"
    );

    Ok(ok_empty())
}

/// GET /api/rooms/{room_id}/presence — live online count for one room.
pub async fn room_presence(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<ApiResponse<RoomPresenceResponse>>, ApiError> {
    if !state.memberships.is_member(&room_id, &claims.sub) {
        return Err(ApiError::NotFound("room".to_string()));
    }
    Ok(ApiResponse::ok(RoomPresenceResponse {
        online_count: state.presence.online_count_in(&room_id),
        room_id,
    }))
}
