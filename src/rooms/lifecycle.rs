//! Room deletion state machine: active -> deletion_requested -> deleted.
//!
//! An owner's deletion request opens a grace window. A platform admin either
//! approves it (the room stops serving immediately and is purged later) or
//! rejects it (back to active). Requests nobody acted on revert to active
//! when the window lapses; the sweeper also hard-deletes rooms that have
//! sat in `deleted` past the window.

use std::time::Duration;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;

use crate::api::{blocking, ok_empty, ApiError, ApiResponse, Empty};
use crate::auth::middleware::Claims;
use crate::moderation::gate::DenyReason;
use crate::rooms::membership::LEVEL_OWNER;
use crate::state::AppState;

pub const STATE_ACTIVE: &str = "active";
pub const STATE_DELETION_REQUESTED: &str = "deletion_requested";
pub const STATE_DELETED: &str = "deleted";

/// POST /api/rooms/{room_id}/delete — an owner opens the grace window.
pub async fn request_deletion(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    let level = state
        .memberships
        .level_of(&room_id, &claims.sub)
        .unwrap_or(0);
    if level < LEVEL_OWNER {
        return Err(ApiError::PermissionDenied(
            DenyReason::InsufficientPermission,
        ));
    }

    transition(
        &state,
        &room_id,
        STATE_ACTIVE,
        STATE_DELETION_REQUESTED,
        Some(&claims.sub),
    )
    .await?;
    tracing::info!(room_id = %room_id, by = %claims.sub, "room deletion requested");
    Ok(ok_empty())
}

/// POST /api/rooms/{room_id}/delete/approve — platform admin only. The room
/// stops serving immediately; the rows are purged once the window lapses.
pub async fn approve_deletion(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    if !claims.is_admin {
        return Err(ApiError::PermissionDenied(
            DenyReason::InsufficientPermission,
        ));
    }

    transition(&state, &room_id, STATE_DELETION_REQUESTED, STATE_DELETED, None).await?;
    forget_everywhere(&state, &room_id);
    tracing::info!(room_id = %room_id, by = %claims.sub, "room deletion approved");
    Ok(ok_empty())
}

/// POST /api/rooms/{room_id}/delete/reject — platform admin only.
pub async fn reject_deletion(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    if !claims.is_admin {
        return Err(ApiError::PermissionDenied(
            DenyReason::InsufficientPermission,
        ));
    }

    transition(&state, &room_id, STATE_DELETION_REQUESTED, STATE_ACTIVE, None).await?;
    tracing::info!(room_id = %room_id, by = %claims.sub, "room deletion rejected");
    Ok(ok_empty())
}

/// Guarded state transition. Conflicts rather than silently overwriting a
/// state somebody else already moved.
async fn transition(
    state: &AppState,
    room_id: &str,
    from: &'static str,
    to: &'static str,
    requested_by: Option<&str>,
) -> Result<(), ApiError> {
    let db = state.db.clone();
    let rid = room_id.to_string();
    let by = requested_by.map(str::to_string);
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let now = Utc::now().to_rfc3339();
        let changed = match to {
            STATE_DELETION_REQUESTED => conn.execute(
                "UPDATE rooms SET state = ?1, deletion_requested_at = ?2,
                        deletion_requested_by = ?3, updated_at = ?2
                 WHERE id = ?4 AND state = ?5",
                rusqlite::params![to, now, by, rid, from],
            ),
            STATE_DELETED => conn.execute(
                "UPDATE rooms SET state = ?1, deleted_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND state = ?4",
                rusqlite::params![to, now, rid, from],
            ),
            _ => conn.execute(
                "UPDATE rooms SET state = ?1, deletion_requested_at = NULL,
                        deletion_requested_by = NULL, updated_at = ?2
                 WHERE id = ?3 AND state = ?4",
                rusqlite::params![to, now, rid, from],
            ),
        }
        .map_err(|_| ApiError::Internal)?;

        if changed == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM rooms WHERE id = ?1",
                    [&rid],
                    |row| row.get::<_, i64>(0).map(|c| c > 0),
                )
                .unwrap_or(false);
            return Err(if exists {
                ApiError::Conflict(format!("room is not in state '{}'", from))
            } else {
                ApiError::NotFound("room".to_string())
            });
        }
        Ok(())
    })
    .await
}

/// Drop a room from every in-memory mirror. DB rows are the sweeper's job.
fn forget_everywhere(state: &AppState, room_id: &str) {
    state.presence.forget_room(room_id);
    state.memberships.forget_room(room_id);
    state.registry.forget_room(room_id);
    state.visibility.forget_room(room_id);
}

/// One sweep: revert stale deletion requests, purge rooms deleted past the
/// grace window. Runs on a timer; also callable directly in tests.
pub async fn sweep(state: &AppState) -> Result<(), ApiError> {
    let grace_days = state.realtime.deletion_grace_days as i64;
    let cutoff = (Utc::now() - chrono::Duration::days(grace_days)).to_rfc3339();

    let db = state.db.clone();
    let cutoff_rows = cutoff.clone();
    let (reverted, purged) = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let now = Utc::now().to_rfc3339();
        let reverted = conn
            .execute(
                "UPDATE rooms SET state = 'active', deletion_requested_at = NULL,
                        deletion_requested_by = NULL, updated_at = ?1
                 WHERE state = 'deletion_requested' AND deletion_requested_at < ?2",
                rusqlite::params![now, cutoff_rows],
            )
            .map_err(|_| ApiError::Internal)?;

        let mut stmt = conn
            .prepare("SELECT id FROM rooms WHERE state = 'deleted' AND deleted_at < ?1")
            .map_err(|_| ApiError::Internal)?;
        let purged: Vec<String> = stmt
            .query_map([&cutoff_rows], |row| row.get(0))
            .map_err(|_| ApiError::Internal)?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        for room_id in &purged {
            // Membership, messages, invitations, reports, bans, timeouts and
            // mutes all cascade off the rooms row; the sequence allocator has
            // no FK and is cleared by hand.
            conn.execute("DELETE FROM rooms WHERE id = ?1", [room_id])
                .map_err(|_| ApiError::Internal)?;
            conn.execute("DELETE FROM room_sequences WHERE room_id = ?1", [room_id])
                .map_err(|_| ApiError::Internal)?;
        }
        Ok((reverted, purged))
    })
    .await?;

    for room_id in &purged {
        forget_everywhere(state, room_id);
    }
    if reverted > 0 || !purged.is_empty() {
        tracing::info!(
            reverted = reverted,
            purged = purged.len(),
            "lifecycle sweep applied"
        );
    }
    Ok(())
}

/// Spawn the periodic lifecycle sweeper.
pub fn spawn_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(state.realtime.sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep(&state).await {
                tracing::error!(error = %e, "lifecycle sweep failed");
            }
        }
    })
}
