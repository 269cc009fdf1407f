//! Invitations into group chats and topics.
//!
//! An invitation is a pending record until the invitee acts on it. Accepting
//! converts it into a level-1 membership; declining or cancelling removes it
//! with no other side effect. The invitee hears about it immediately via a
//! direct push even though they are not subscribed to the room yet.

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
use crate::realtime::event::EventBody;
use crate::rooms::membership::{LEVEL_MEMBER, LEVEL_MODERATOR};
use crate::state::AppState;
use crate::ws::protocol::ServerFrame;

#[derive(Debug, Deserialize)]
pub struct CreateInviteRequest {
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct InviteResponse {
    pub invitation_id: String,
}

#[derive(Debug, Serialize)]
pub struct PendingInvite {
    pub id: String,
    pub room_id: String,
    pub room_name: String,
    pub inviter_username: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct InviteListResponse {
    pub invitations: Vec<PendingInvite>,
}

struct InviteRow {
    room_id: String,
    inviter_id: String,
    invitee_id: String,
}

fn load_invite(conn: &rusqlite::Connection, invite_id: &str) -> Result<InviteRow, ApiError> {
    conn.query_row(
        "SELECT room_id, inviter_id, invitee_id FROM invitations WHERE id = ?1",
        [invite_id],
        |row| {
            Ok(InviteRow {
                room_id: row.get(0)?,
                inviter_id: row.get(1)?,
                invitee_id: row.get(2)?,
            })
        },
    )
    .map_err(|_| ApiError::NotFound("invitation".to_string()))
}

/// POST /api/rooms/{room_id}/invites — level >= 2 invites a user by name.
/// A second invite for the same user is a conflict, not a duplicate record.
pub async fn create_invite(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
    Json(req): Json<CreateInviteRequest>,
) -> Result<Json<ApiResponse<InviteResponse>>, ApiError> {
    let level = state
        .memberships
        .level_of(&room_id, &claims.sub)
        .unwrap_or(0);
    if level < LEVEL_MODERATOR {
        return Err(ApiError::PermissionDenied(
            DenyReason::InsufficientPermission,
        ));
    }

    let db = state.db.clone();
    let rid = room_id.clone();
    let inviter = claims.sub.clone();
    let username = req.username.trim().to_string();
    let invitation_id = Uuid::now_v7().to_string();
    let iid = invitation_id.clone();
    let invitee_id = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        crate::rooms::crud::load_room(&conn, &rid)?;
        let invitee_id: String = conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1",
                [&username],
                |row| row.get(0),
            )
            .map_err(|_| ApiError::NotFound("user".to_string()))?;
        let already_member: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                rusqlite::params![rid, invitee_id],
                |row| row.get::<_, i64>(0).map(|c| c > 0),
            )
            .unwrap_or(false);
        if already_member {
            return Err(ApiError::Conflict("user is already a member".to_string()));
        }
        conn.execute(
            "INSERT INTO invitations (id, room_id, inviter_id, invitee_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![iid, rid, inviter, invitee_id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ApiError::Conflict("invitation already pending".to_string())
            }
            _ => ApiError::Internal,
        })?;
        Ok(invitee_id)
    })
    .await?;

    let (event, _) = state
        .router
        .publish(
            &room_id,
            EventBody::InviteCreated {
                invitation_id: invitation_id.clone(),
                inviter_id: claims.sub.clone(),
                invitee_id: invitee_id.clone(),
            },
        )
        .await?;
    // The invitee is not subscribed to the room yet, so push the event to
    // their connections directly.
    state.router.notify_user(
        &invitee_id,
        ServerFrame::Event {
            event,
            silent: false,
        },
    );

    Ok(ApiResponse::ok(InviteResponse { invitation_id }))
}

/// GET /api/invites — the requester's pending invitations.
pub async fn list_invites(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<ApiResponse<InviteListResponse>>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub.clone();
    let invitations = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let mut stmt = conn
            .prepare(
                "SELECT i.id, i.room_id, r.name, u.username, i.created_at
                 FROM invitations i
                 JOIN rooms r ON r.id = i.room_id
                 JOIN users u ON u.id = i.inviter_id
                 WHERE i.invitee_id = ?1 AND r.state != 'deleted'
                 ORDER BY i.created_at DESC",
            )
            .map_err(|_| ApiError::Internal)?;
        let invitations = stmt
            .query_map([&user_id], |row| {
                Ok(PendingInvite {
                    id: row.get(0)?,
                    room_id: row.get(1)?,
                    room_name: row.get(2)?,
                    inviter_username: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .map_err(|_| ApiError::Internal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(invitations)
    })
    .await?;

    Ok(ApiResponse::ok(InviteListResponse { invitations }))
}

/// POST /api/invites/{invite_id}/accept — invitee only; becomes a level-1
/// membership. A ban recorded after the invite still wins.
pub async fn accept_invite(
    State(state): State<AppState>,
    claims: Claims,
    Path(invite_id): Path<String>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    let db = state.db.clone();
    let iid = invite_id.clone();
    let user_id = claims.sub.clone();
    let (room_id, inserted) = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let invite = load_invite(&conn, &iid)?;
        if invite.invitee_id != user_id {
            return Err(ApiError::NotFound("invitation".to_string()));
        }
        let banned: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM room_bans WHERE room_id = ?1 AND user_id = ?2",
                rusqlite::params![invite.room_id, user_id],
                |row| row.get::<_, i64>(0).map(|c| c > 0),
            )
            .unwrap_or(false);
        if banned {
            return Err(ApiError::PermissionDenied(
                DenyReason::InsufficientPermission,
            ));
        }
        conn.execute("DELETE FROM invitations WHERE id = ?1", [&iid])
            .map_err(|_| ApiError::Internal)?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO room_members (room_id, user_id, level, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![invite.room_id, user_id, LEVEL_MEMBER, Utc::now().to_rfc3339()],
            )
            .map_err(|_| ApiError::Internal)?;
        Ok((invite.room_id, inserted == 1))
    })
    .await?;

    // A stale invite accepted by someone who joined (and maybe got promoted)
    // in the meantime must not touch their existing membership.
    if inserted {
        state.memberships.add_member(&room_id, &claims.sub, LEVEL_MEMBER);
        state.presence.member_joined(&room_id, &claims.sub);
        state.registry.subscribe_user(&claims.sub, &room_id);
    }

    state
        .router
        .publish(
            &room_id,
            EventBody::InviteAccepted {
                invitation_id: invite_id,
                invitee_id: claims.sub.clone(),
            },
        )
        .await?;

    Ok(ok_empty())
}

/// POST /api/invites/{invite_id}/decline — invitee only. No side effects
/// beyond removing the pending record.
pub async fn decline_invite(
    State(state): State<AppState>,
    claims: Claims,
    Path(invite_id): Path<String>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    revoke(state, claims, invite_id, Role::Invitee).await
}

/// DELETE /api/invites/{invite_id} — inviter or a room moderator withdraws
/// a pending invitation.
pub async fn cancel_invite(
    State(state): State<AppState>,
    claims: Claims,
    Path(invite_id): Path<String>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    revoke(state, claims, invite_id, Role::Inviter).await
}

enum Role {
    Invitee,
    Inviter,
}

async fn revoke(
    state: AppState,
    claims: Claims,
    invite_id: String,
    role: Role,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    let db = state.db.clone();
    let iid = invite_id.clone();
    let invite = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        load_invite(&conn, &iid)
    })
    .await?;

    let allowed = match role {
        Role::Invitee => invite.invitee_id == claims.sub,
        Role::Inviter => {
            invite.inviter_id == claims.sub
                || state
                    .memberships
                    .level_of(&invite.room_id, &claims.sub)
                    .unwrap_or(0)
                    >= LEVEL_MODERATOR
        }
    };
    if !allowed {
        return Err(ApiError::NotFound("invitation".to_string()));
    }

    let db = state.db.clone();
    let iid = invite_id.clone();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.execute("DELETE FROM invitations WHERE id = ?1", [&iid])
            .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    state
        .router
        .publish(
            &invite.room_id,
            EventBody::InviteRevoked {
                invitation_id: invite_id,
                revoked_by: claims.sub.clone(),
            },
        )
        .await?;

    Ok(ok_empty())
}
