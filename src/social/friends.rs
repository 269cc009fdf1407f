//! Friend requests and the direct chats they produce.
//!
//! A friendship is not its own table: accepting a request creates a
//! `direct_chat` room with both users at level 1, and "friends" is derived
//! from shared direct rooms. Accepting twice cannot produce a second room
//! for the same pair.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{blocking, ok_empty, ApiError, ApiResponse, Empty};
use crate::auth::middleware::Claims;
use crate::rooms::crud::KIND_DIRECT_CHAT;
use crate::rooms::membership::LEVEL_MEMBER;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct FriendRequestBody {
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct FriendRequestRecord {
    pub id: String,
    pub from_username: String,
    pub to_username: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct FriendRequestListResponse {
    pub incoming: Vec<FriendRequestRecord>,
    pub outgoing: Vec<FriendRequestRecord>,
}

#[derive(Debug, Serialize)]
pub struct FriendEntry {
    pub user_id: String,
    pub username: String,
    /// The shared direct chat room.
    pub room_id: String,
    pub is_online: bool,
}

#[derive(Debug, Serialize)]
pub struct FriendListResponse {
    pub friends: Vec<FriendEntry>,
}

#[derive(Debug, Serialize)]
pub struct AcceptResponse {
    pub room_id: String,
}

/// Existing direct room shared by exactly this pair, if any. Must run while
/// holding the DB lock.
fn direct_room_between(
    conn: &rusqlite::Connection,
    a: &str,
    b: &str,
) -> Result<Option<String>, ApiError> {
    conn.query_row(
        "SELECT r.id FROM rooms r
         JOIN room_members ma ON ma.room_id = r.id AND ma.user_id = ?1
         JOIN room_members mb ON mb.room_id = r.id AND mb.user_id = ?2
         WHERE r.kind = 'direct_chat' AND r.state != 'deleted'",
        rusqlite::params![a, b],
        |row| row.get(0),
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        _ => Err(ApiError::Internal),
    })
}

/// POST /api/friends/requests — request friendship by username.
pub async fn send_request(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<FriendRequestBody>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    let username = req.username.trim().to_string();
    if username == claims.username {
        return Err(ApiError::Validation(
            "cannot send a friend request to yourself".to_string(),
        ));
    }

    let db = state.db.clone();
    let from = claims.sub.clone();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let to: String = conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1",
                [&username],
                |row| row.get(0),
            )
            .map_err(|_| ApiError::NotFound("user".to_string()))?;

        if direct_room_between(&conn, &from, &to)?.is_some() {
            return Err(ApiError::Conflict("already friends".to_string()));
        }
        let pending: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM friend_requests
                 WHERE (from_user = ?1 AND to_user = ?2) OR (from_user = ?2 AND to_user = ?1)",
                rusqlite::params![from, to],
                |row| row.get::<_, i64>(0).map(|c| c > 0),
            )
            .unwrap_or(false);
        if pending {
            return Err(ApiError::Conflict("request already pending".to_string()));
        }

        conn.execute(
            "INSERT INTO friend_requests (id, from_user, to_user, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                Uuid::now_v7().to_string(),
                from,
                to,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    Ok(ok_empty())
}

/// GET /api/friends/requests — pending requests in both directions.
pub async fn list_requests(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<ApiResponse<FriendRequestListResponse>>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub.clone();
    let (incoming, outgoing) = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let fetch = |sql: &str| -> Result<Vec<FriendRequestRecord>, ApiError> {
            let mut stmt = conn.prepare(sql).map_err(|_| ApiError::Internal)?;
            let rows = stmt
                .query_map([&user_id], |row| {
                    Ok(FriendRequestRecord {
                        id: row.get(0)?,
                        from_username: row.get(1)?,
                        to_username: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })
                .map_err(|_| ApiError::Internal)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        };
        let incoming = fetch(
            "SELECT fr.id, uf.username, ut.username, fr.created_at FROM friend_requests fr
             JOIN users uf ON uf.id = fr.from_user JOIN users ut ON ut.id = fr.to_user
             WHERE fr.to_user = ?1 ORDER BY fr.created_at DESC",
        )?;
        let outgoing = fetch(
            "SELECT fr.id, uf.username, ut.username, fr.created_at FROM friend_requests fr
             JOIN users uf ON uf.id = fr.from_user JOIN users ut ON ut.id = fr.to_user
             WHERE fr.from_user = ?1 ORDER BY fr.created_at DESC",
        )?;
        Ok((incoming, outgoing))
    })
    .await?;

    Ok(ApiResponse::ok(FriendRequestListResponse {
        incoming,
        outgoing,
    }))
}

/// POST /api/friends/requests/{request_id}/accept — recipient only. Creates
/// (or reuses) the pair's direct chat.
pub async fn accept_request(
    State(state): State<AppState>,
    claims: Claims,
    Path(request_id): Path<String>,
) -> Result<Json<ApiResponse<AcceptResponse>>, ApiError> {
    let db = state.db.clone();
    let rid = request_id.clone();
    let me = claims.sub.clone();
    let (room_id, other, created) = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let (from, to): (String, String) = conn
            .query_row(
                "SELECT from_user, to_user FROM friend_requests WHERE id = ?1",
                [&rid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|_| ApiError::NotFound("friend request".to_string()))?;
        if to != me {
            return Err(ApiError::NotFound("friend request".to_string()));
        }
        conn.execute("DELETE FROM friend_requests WHERE id = ?1", [&rid])
            .map_err(|_| ApiError::Internal)?;

        if let Some(existing) = direct_room_between(&conn, &from, &to)? {
            return Ok((existing, from, false));
        }

        let other_name: String = conn
            .query_row("SELECT username FROM users WHERE id = ?1", [&from], |row| {
                row.get(0)
            })
            .map_err(|_| ApiError::Internal)?;
        let my_name: String = conn
            .query_row("SELECT username FROM users WHERE id = ?1", [&to], |row| {
                row.get(0)
            })
            .map_err(|_| ApiError::Internal)?;

        let room_id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO rooms (id, kind, name, state, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?5)",
            rusqlite::params![
                room_id,
                KIND_DIRECT_CHAT,
                format!("{} & {}", other_name, my_name),
                to,
                now
            ],
        )
        .map_err(|_| ApiError::Internal)?;
        for user in [&from, &to] {
            conn.execute(
                "INSERT INTO room_members (room_id, user_id, level, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![room_id, user, LEVEL_MEMBER, now],
            )
            .map_err(|_| ApiError::Internal)?;
        }
        Ok((room_id, from, true))
    })
    .await?;

    if created {
        for user in [&other, &claims.sub] {
            state.memberships.add_member(&room_id, user, LEVEL_MEMBER);
            state.presence.member_joined(&room_id, user);
            state.registry.subscribe_user(user, &room_id);
        }
        tracing::info!(room_id = %room_id, a = %other, b = %claims.sub, "direct chat created");
    }

    Ok(ApiResponse::ok(AcceptResponse { room_id }))
}

/// POST /api/friends/requests/{request_id}/decline — recipient only.
pub async fn decline_request(
    State(state): State<AppState>,
    claims: Claims,
    Path(request_id): Path<String>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    remove_request(state, claims, request_id, Direction::Incoming).await
}

/// DELETE /api/friends/requests/{request_id} — sender withdraws.
pub async fn cancel_request(
    State(state): State<AppState>,
    claims: Claims,
    Path(request_id): Path<String>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    remove_request(state, claims, request_id, Direction::Outgoing).await
}

enum Direction {
    Incoming,
    Outgoing,
}

async fn remove_request(
    state: AppState,
    claims: Claims,
    request_id: String,
    direction: Direction,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    let db = state.db.clone();
    let me = claims.sub.clone();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let column = match direction {
            Direction::Incoming => "to_user",
            Direction::Outgoing => "from_user",
        };
        let removed = conn
            .execute(
                &format!("DELETE FROM friend_requests WHERE id = ?1 AND {} = ?2", column),
                rusqlite::params![request_id, me],
            )
            .map_err(|_| ApiError::Internal)?;
        if removed == 0 {
            return Err(ApiError::NotFound("friend request".to_string()));
        }
        Ok(())
    })
    .await?;

    Ok(ok_empty())
}

/// GET /api/friends — everyone sharing a direct chat with the requester.
pub async fn list_friends(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<ApiResponse<FriendListResponse>>, ApiError> {
    let db = state.db.clone();
    let me = claims.sub.clone();
    let rows = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let mut stmt = conn
            .prepare(
                "SELECT u.id, u.username, r.id FROM rooms r
                 JOIN room_members mine ON mine.room_id = r.id AND mine.user_id = ?1
                 JOIN room_members theirs ON theirs.room_id = r.id AND theirs.user_id != ?1
                 JOIN users u ON u.id = theirs.user_id
                 WHERE r.kind = 'direct_chat' AND r.state != 'deleted'
                 ORDER BY u.username",
            )
            .map_err(|_| ApiError::Internal)?;
        let rows: Vec<(String, String, String)> = stmt
            .query_map([&me], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(|_| ApiError::Internal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    })
    .await?;

    let friends = rows
        .into_iter()
        .map(|(user_id, username, room_id)| FriendEntry {
            is_online: state.presence.is_online(&user_id),
            user_id,
            username,
            room_id,
        })
        .collect();

    Ok(ApiResponse::ok(FriendListResponse { friends }))
}
