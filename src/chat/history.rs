//! Durable message history over REST.
//!
//! This is the pull side of the push channel: after a replay gap the client
//! refetches from here and the ids line up with what fan-out delivered,
//! because both come from the same per-room sequence. Soft-deleted messages
//! and the requester's hidden messages are filtered out; other readers are
//! unaffected by someone else's hidden set.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::{blocking, ApiError, ApiResponse};
use crate::auth::middleware::Claims;
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Return messages with event ids strictly below this cursor.
    pub before_event_id: Option<u64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub event_id: u64,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    /// Newest first.
    pub messages: Vec<MessageRecord>,
    /// Cursor for the next older page, absent when this page reached the
    /// start of history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_before_event_id: Option<u64>,
}

/// GET /api/rooms/{room_id}/messages — paginated history, members only.
pub async fn room_history(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<HistoryResponse>>, ApiError> {
    if !state.memberships.is_member(&room_id, &claims.sub) {
        return Err(ApiError::NotFound("room".to_string()));
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE) as i64;
    let before = query.before_event_id.map(|b| b as i64).unwrap_or(i64::MAX);

    let db = state.db.clone();
    let rid = room_id.clone();
    let user_id = claims.sub.clone();
    let messages = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let mut stmt = conn
            .prepare(
                "SELECT m.id, m.event_id, m.sender_id, u.username, m.content, m.created_at
                 FROM messages m
                 JOIN users u ON u.id = m.sender_id
                 WHERE m.room_id = ?1 AND m.event_id < ?2 AND m.deleted = 0
                   AND NOT EXISTS (
                       SELECT 1 FROM hidden_items h
                       WHERE h.user_id = ?3 AND h.item_kind = 'message' AND h.item_id = m.id
                   )
                 ORDER BY m.event_id DESC LIMIT ?4",
            )
            .map_err(|_| ApiError::Internal)?;
        let messages: Vec<MessageRecord> = stmt
            .query_map(
                rusqlite::params![rid, before, user_id, limit],
                |row| {
                    Ok(MessageRecord {
                        id: row.get(0)?,
                        event_id: row.get::<_, i64>(1)? as u64,
                        sender_id: row.get(2)?,
                        sender_name: row.get(3)?,
                        content: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .map_err(|_| ApiError::Internal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(messages)
    })
    .await?;

    let next_before_event_id = if messages.len() == limit as usize {
        messages.last().map(|m| m.event_id)
    } else {
        None
    };

    Ok(ApiResponse::ok(HistoryResponse {
        messages,
        next_before_event_id,
    }))
}
