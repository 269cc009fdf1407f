//! Moderation actions with side effects: bans, timeouts, reports, and
//! message deletion.
//!
//! Every handler runs the pure permission gate first, then applies the DB
//! write and mirrors the result into the in-memory structures. Timeouts
//! expire lazily: nothing fires at the deadline, the next posting attempt
//! just stops being blocked.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{blocking, ok_empty, ApiError, ApiResponse, Empty};
use crate::auth::middleware::Claims;
use crate::db::DbPool;
use crate::moderation::gate::{self, Action};
use crate::realtime::event::EventBody;
use crate::state::AppState;

const MAX_REASON_LENGTH: usize = 500;
const MAX_TIMEOUT_MINUTES: i64 = 60 * 24 * 7;

/// Active timeout for a user in a room, if any. Expired rows are deleted on
/// the way out, so the table never needs a sweeper.
pub async fn active_timeout(
    db: &DbPool,
    room_id: &str,
    user_id: &str,
) -> Result<Option<String>, ApiError> {
    let db = db.clone();
    let rid = room_id.to_string();
    let uid = user_id.to_string();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let until: Option<String> = conn
            .query_row(
                "SELECT until FROM room_timeouts WHERE room_id = ?1 AND user_id = ?2",
                rusqlite::params![rid, uid],
                |row| row.get(0),
            )
            .ok();
        let Some(until) = until else {
            return Ok(None);
        };
        let expired = DateTime::parse_from_rfc3339(&until)
            .map(|t| t.with_timezone(&Utc) <= Utc::now())
            .unwrap_or(true);
        if expired {
            conn.execute(
                "DELETE FROM room_timeouts WHERE room_id = ?1 AND user_id = ?2",
                rusqlite::params![rid, uid],
            )
            .map_err(|_| ApiError::Internal)?;
            return Ok(None);
        }
        Ok(Some(until))
    })
    .await
}

// --- Requests and responses ---

#[derive(Debug, Deserialize)]
pub struct BanRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct TimeoutRequest {
    pub minutes: i64,
}

#[derive(Debug, Serialize)]
pub struct TimeoutResponse {
    pub until: String,
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub target_kind: String,
    pub target_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub report_id: String,
}

#[derive(Debug, Serialize)]
pub struct ReportRecord {
    pub id: String,
    pub reporter_id: String,
    pub target_kind: String,
    pub target_id: String,
    pub reason: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct ReportListResponse {
    pub reports: Vec<ReportRecord>,
}

// --- Handlers ---

/// POST /api/rooms/{room_id}/ban/{user_id} — remove the target's membership
/// and record a ban that denies rejoining. The target's existing messages
/// stay in history.
pub async fn ban_user(
    State(state): State<AppState>,
    claims: Claims,
    Path((room_id, target_id)): Path<(String, String)>,
    Json(req): Json<BanRequest>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    gate::authorize(
        &state.memberships,
        &claims.sub,
        &room_id,
        Action::Ban {
            target_user_id: &target_id,
        },
    )
    .map_err(ApiError::PermissionDenied)?;

    let db = state.db.clone();
    let rid = room_id.clone();
    let tid = target_id.clone();
    let by = claims.sub.clone();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.execute(
            "DELETE FROM room_members WHERE room_id = ?1 AND user_id = ?2",
            rusqlite::params![rid, tid],
        )
        .map_err(|_| ApiError::Internal)?;
        conn.execute(
            "INSERT OR REPLACE INTO room_bans (room_id, user_id, banned_by, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![rid, tid, by, req.reason, Utc::now().to_rfc3339()],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    // Mirror order matters: presence reads the index to decide whether the
    // user still counts toward the room, so drop presence first.
    state.presence.member_left(&room_id, &target_id);
    state.memberships.remove_member(&room_id, &target_id);
    state.registry.unsubscribe_user(&target_id, &room_id);

    tracing::info!(room_id = %room_id, target = %target_id, by = %claims.sub, "user banned");
    Ok(ok_empty())
}

/// POST /api/rooms/{room_id}/timeout/{user_id} — block the target from
/// posting until the deadline. Membership and delivery are unaffected.
pub async fn timeout_user(
    State(state): State<AppState>,
    claims: Claims,
    Path((room_id, target_id)): Path<(String, String)>,
    Json(req): Json<TimeoutRequest>,
) -> Result<Json<ApiResponse<TimeoutResponse>>, ApiError> {
    if !(1..=MAX_TIMEOUT_MINUTES).contains(&req.minutes) {
        return Err(ApiError::Validation(format!(
            "minutes must be 1-{}",
            MAX_TIMEOUT_MINUTES
        )));
    }
    gate::authorize(
        &state.memberships,
        &claims.sub,
        &room_id,
        Action::Timeout {
            target_user_id: &target_id,
        },
    )
    .map_err(ApiError::PermissionDenied)?;

    let until = (Utc::now() + Duration::minutes(req.minutes)).to_rfc3339();
    let db = state.db.clone();
    let rid = room_id.clone();
    let tid = target_id.clone();
    let until_row = until.clone();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.execute(
            "INSERT OR REPLACE INTO room_timeouts (room_id, user_id, until, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![rid, tid, until_row, Utc::now().to_rfc3339()],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    tracing::info!(
        room_id = %room_id,
        target = %target_id,
        until = %until,
        by = %claims.sub,
        "user timed out"
    );
    Ok(ApiResponse::ok(TimeoutResponse { until }))
}

/// POST /api/rooms/{room_id}/reports — file a report. The stored record is
/// the source of truth; the published event reaches only the room's
/// moderators.
pub async fn file_report(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
    Json(req): Json<ReportRequest>,
) -> Result<Json<ApiResponse<ReportResponse>>, ApiError> {
    if req.target_kind.trim().is_empty() || req.target_id.trim().is_empty() {
        return Err(ApiError::Validation(
            "target_kind and target_id are required".to_string(),
        ));
    }
    if req.reason.len() > MAX_REASON_LENGTH {
        return Err(ApiError::Validation(format!(
            "reason exceeds {} characters",
            MAX_REASON_LENGTH
        )));
    }
    gate::authorize(&state.memberships, &claims.sub, &room_id, Action::Report)
        .map_err(ApiError::PermissionDenied)?;

    let report_id = Uuid::now_v7().to_string();
    let db = state.db.clone();
    let rid = room_id.clone();
    let reporter = claims.sub.clone();
    let record = (
        report_id.clone(),
        req.target_kind.clone(),
        req.target_id.clone(),
        req.reason.clone(),
    );
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.execute(
            "INSERT INTO reports (id, room_id, reporter_id, target_kind, target_id, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.0,
                rid,
                reporter,
                record.1,
                record.2,
                record.3,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    state
        .router
        .publish(
            &room_id,
            EventBody::ReportFiled {
                report_id: report_id.clone(),
                reporter_id: claims.sub.clone(),
                target_kind: req.target_kind,
                target_id: req.target_id,
                reason: req.reason,
            },
        )
        .await?;

    Ok(ApiResponse::ok(ReportResponse { report_id }))
}

/// GET /api/rooms/{room_id}/reports — moderators and owners only.
pub async fn list_reports(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<ApiResponse<ReportListResponse>>, ApiError> {
    let level = state
        .memberships
        .level_of(&room_id, &claims.sub)
        .unwrap_or(0);
    if level < crate::rooms::membership::LEVEL_MODERATOR {
        return Err(ApiError::PermissionDenied(
            gate::DenyReason::InsufficientPermission,
        ));
    }

    let db = state.db.clone();
    let rid = room_id.clone();
    let reports = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, reporter_id, target_kind, target_id, reason, created_at
                 FROM reports WHERE room_id = ?1 ORDER BY created_at DESC",
            )
            .map_err(|_| ApiError::Internal)?;
        let reports = stmt
            .query_map([&rid], |row| {
                Ok(ReportRecord {
                    id: row.get(0)?,
                    reporter_id: row.get(1)?,
                    target_kind: row.get(2)?,
                    target_id: row.get(3)?,
                    reason: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .map_err(|_| ApiError::Internal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(reports)
    })
    .await?;

    Ok(ApiResponse::ok(ReportListResponse { reports }))
}

/// DELETE /api/rooms/{room_id}/messages/{message_id} — soft-delete a message
/// (author or level >= 2). The row stays for the gapless log; history skips
/// it, and a deletion event tells live clients to drop it.
pub async fn delete_message(
    State(state): State<AppState>,
    claims: Claims,
    Path((room_id, message_id)): Path<(String, String)>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    let db = state.db.clone();
    let rid = room_id.clone();
    let mid = message_id.clone();
    let (sender_id, target_event_id) = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.query_row(
            "SELECT sender_id, event_id FROM messages
             WHERE id = ?1 AND room_id = ?2 AND deleted = 0",
            rusqlite::params![mid, rid],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .map_err(|_| ApiError::NotFound("message".to_string()))
    })
    .await?;

    gate::authorize(
        &state.memberships,
        &claims.sub,
        &room_id,
        Action::DeleteMessage {
            target_owner_id: &sender_id,
        },
    )
    .map_err(ApiError::PermissionDenied)?;

    let db = state.db.clone();
    let rid = room_id.clone();
    let mid = message_id.clone();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.execute(
            "UPDATE messages SET deleted = 1 WHERE id = ?1 AND room_id = ?2",
            rusqlite::params![mid, rid],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    state
        .router
        .publish(
            &room_id,
            EventBody::MessageDeleted {
                message_id,
                target_event_id: target_event_id as u64,
                deleted_by: claims.sub.clone(),
            },
        )
        .await?;

    Ok(ok_empty())
}
