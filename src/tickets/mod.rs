//! Support tickets: users file them, platform admins answer them.
//!
//! Status walks open -> in_progress -> closed, forward only. Changes are
//! pushed to the ticket owner's live connections and to online admins; the
//! stored row stays the source of truth for everyone else.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{blocking, ApiError, ApiResponse};
use crate::auth::middleware::Claims;
use crate::moderation::gate::DenyReason;
use crate::state::AppState;
use crate::ws::protocol::ServerFrame;

pub const STATUS_OPEN: &str = "open";
pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_CLOSED: &str = "closed";

const MAX_SUBJECT_LENGTH: usize = 120;
const MAX_BODY_LENGTH: usize = 4000;

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    #[serde(default)]
    pub response: Option<String>,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct TicketRecord {
    pub id: String,
    pub owner_id: String,
    pub owner_username: String,
    pub subject: String,
    pub body: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct TicketListResponse {
    pub tickets: Vec<TicketRecord>,
}

fn status_rank(status: &str) -> Option<u8> {
    match status {
        STATUS_OPEN => Some(0),
        STATUS_IN_PROGRESS => Some(1),
        STATUS_CLOSED => Some(2),
        _ => None,
    }
}

/// Push a ticket change to its owner and to every online admin.
fn notify(state: &AppState, owner_id: &str, ticket_id: &str, status: &str) {
    let frame = ServerFrame::TicketUpdate {
        ticket_id: ticket_id.to_string(),
        status: status.to_string(),
    };
    state.router.notify_user(owner_id, frame.clone());
    for conn in state.registry.all() {
        if conn.is_admin && conn.user_id != owner_id {
            conn.try_deliver(frame.clone());
        }
    }
}

/// POST /api/tickets
pub async fn create_ticket(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<CreateTicketRequest>,
) -> Result<Json<ApiResponse<TicketRecord>>, ApiError> {
    let subject = req.subject.trim().to_string();
    let body = req.body.trim().to_string();
    if subject.is_empty() || subject.len() > MAX_SUBJECT_LENGTH {
        return Err(ApiError::Validation(format!(
            "subject must be 1-{} characters",
            MAX_SUBJECT_LENGTH
        )));
    }
    if body.is_empty() || body.len() > MAX_BODY_LENGTH {
        return Err(ApiError::Validation(format!(
            "body must be 1-{} characters",
            MAX_BODY_LENGTH
        )));
    }

    let ticket_id = Uuid::now_v7().to_string();
    let now = Utc::now().to_rfc3339();
    let db = state.db.clone();
    let owner = claims.sub.clone();
    let row = (ticket_id.clone(), subject.clone(), body.clone(), now.clone());
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.execute(
            "INSERT INTO tickets (id, owner_id, subject, body, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'open', ?5, ?5)",
            rusqlite::params![row.0, owner, row.1, row.2, row.3],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    notify(&state, &claims.sub, &ticket_id, STATUS_OPEN);
    tracing::info!(ticket_id = %ticket_id, owner = %claims.sub, "ticket created");

    Ok(ApiResponse::ok(TicketRecord {
        id: ticket_id,
        owner_id: claims.sub.clone(),
        owner_username: claims.username.clone(),
        subject,
        body,
        status: STATUS_OPEN.to_string(),
        response: None,
        created_at: now.clone(),
        updated_at: now,
    }))
}

/// GET /api/tickets — own tickets; platform admins see all of them.
pub async fn list_tickets(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<ApiResponse<TicketListResponse>>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub.clone();
    let is_admin = claims.is_admin;
    let tickets = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let sql = if is_admin {
            "SELECT t.id, t.owner_id, u.username, t.subject, t.body, t.status, t.response,
                    t.created_at, t.updated_at
             FROM tickets t JOIN users u ON u.id = t.owner_id
             ORDER BY t.created_at DESC"
        } else {
            "SELECT t.id, t.owner_id, u.username, t.subject, t.body, t.status, t.response,
                    t.created_at, t.updated_at
             FROM tickets t JOIN users u ON u.id = t.owner_id
             WHERE t.owner_id = ?1 ORDER BY t.created_at DESC"
        };
        let mut stmt = conn.prepare(sql).map_err(|_| ApiError::Internal)?;
        let map = |row: &rusqlite::Row<'_>| {
            Ok(TicketRecord {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                owner_username: row.get(2)?,
                subject: row.get(3)?,
                body: row.get(4)?,
                status: row.get(5)?,
                response: row.get(6)?,
                created_at: row.get(7)?,
                updated_at: row.get(8)?,
            })
        };
        let tickets: Vec<TicketRecord> = if is_admin {
            stmt.query_map([], map)
                .map_err(|_| ApiError::Internal)?
                .filter_map(|r| r.ok())
                .collect()
        } else {
            stmt.query_map([&user_id], map)
                .map_err(|_| ApiError::Internal)?
                .filter_map(|r| r.ok())
                .collect()
        };
        Ok(tickets)
    })
    .await?;

    Ok(ApiResponse::ok(TicketListResponse { tickets }))
}

/// PUT /api/tickets/{ticket_id} — platform admin responds and/or advances
/// the status. Moving backwards (reopening a closed ticket) is a conflict.
pub async fn respond_ticket(
    State(state): State<AppState>,
    claims: Claims,
    Path(ticket_id): Path<String>,
    Json(req): Json<RespondRequest>,
) -> Result<Json<ApiResponse<TicketRecord>>, ApiError> {
    if !claims.is_admin {
        return Err(ApiError::PermissionDenied(
            DenyReason::InsufficientPermission,
        ));
    }
    let new_rank = status_rank(&req.status).ok_or_else(|| {
        ApiError::Validation("status must be open, in_progress, or closed".to_string())
    })?;

    let db = state.db.clone();
    let tid = ticket_id.clone();
    let new_status = req.status.clone();
    let response = req.response.clone();
    let ticket = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let current: String = conn
            .query_row("SELECT status FROM tickets WHERE id = ?1", [&tid], |row| {
                row.get(0)
            })
            .map_err(|_| ApiError::NotFound("ticket".to_string()))?;
        // Rank is total over known statuses; an unknown stored value cannot
        // happen short of manual DB edits.
        if status_rank(&current).unwrap_or(0) > new_rank {
            return Err(ApiError::Conflict(format!(
                "ticket is already '{}'",
                current
            )));
        }

        let now = Utc::now().to_rfc3339();
        if let Some(response) = &response {
            conn.execute(
                "UPDATE tickets SET status = ?1, response = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![new_status, response, now, tid],
            )
        } else {
            conn.execute(
                "UPDATE tickets SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![new_status, now, tid],
            )
        }
        .map_err(|_| ApiError::Internal)?;

        conn.query_row(
            "SELECT t.id, t.owner_id, u.username, t.subject, t.body, t.status, t.response,
                    t.created_at, t.updated_at
             FROM tickets t JOIN users u ON u.id = t.owner_id WHERE t.id = ?1",
            [&tid],
            |row| {
                Ok(TicketRecord {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    owner_username: row.get(2)?,
                    subject: row.get(3)?,
                    body: row.get(4)?,
                    status: row.get(5)?,
                    response: row.get(6)?,
                    created_at: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            },
        )
        .map_err(|_| ApiError::Internal)
    })
    .await?;

    notify(&state, &ticket.owner_id, &ticket.id, &ticket.status);
    tracing::info!(
        ticket_id = %ticket.id,
        status = %ticket.status,
        by = %claims.sub,
        "ticket updated"
    );

    Ok(ApiResponse::ok(ticket))
}
