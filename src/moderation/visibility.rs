//! Per-user visibility: hidden items and muted rooms.
//!
//! Hiding affects only the hiding user (history queries filter their hidden
//! set; nothing changes for anyone else). Muting affects presentation, not
//! delivery: events from muted rooms still arrive — so unread counts stay
//! correct — but carry a `silent` flag. The muted set is mirrored in memory
//! because fan-out consults it on every delivery.

use std::collections::HashSet;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::api::{blocking, ok_empty, ApiError, ApiResponse, Empty};
use crate::auth::middleware::Claims;
use crate::db::DbPool;
use crate::state::AppState;

/// Item kinds a user can hide. One canonical shape for all of them.
pub const HIDEABLE_KINDS: [&str; 3] = ["message", "post", "topic"];

/// In-memory mirror of `muted_rooms`, read by the fan-out path.
pub struct VisibilitySets {
    /// user_id -> muted room_ids
    muted: DashMap<String, HashSet<String>>,
}

impl VisibilitySets {
    pub fn load_from_db(db: &DbPool) -> Result<Self, Box<dyn std::error::Error>> {
        let sets = Self {
            muted: DashMap::new(),
        };
        let conn = db.lock().map_err(|e| format!("DB lock error: {}", e))?;
        let mut stmt = conn.prepare("SELECT user_id, room_id FROM muted_rooms")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (user_id, room_id) = row?;
            sets.muted.entry(user_id).or_default().insert(room_id);
        }
        Ok(sets)
    }

    #[cfg(test)]
    pub fn empty() -> Self {
        Self {
            muted: DashMap::new(),
        }
    }

    pub fn is_muted(&self, user_id: &str, room_id: &str) -> bool {
        self.muted
            .get(user_id)
            .map(|rooms| rooms.contains(room_id))
            .unwrap_or(false)
    }

    pub fn set_muted(&self, user_id: &str, room_id: &str, muted: bool) {
        if muted {
            self.muted
                .entry(user_id.to_string())
                .or_default()
                .insert(room_id.to_string());
        } else if let Some(mut rooms) = self.muted.get_mut(user_id) {
            rooms.remove(room_id);
        }
    }

    pub fn forget_room(&self, room_id: &str) {
        for mut entry in self.muted.iter_mut() {
            entry.value_mut().remove(room_id);
        }
    }
}

// --- Hidden items ---

#[derive(Debug, Deserialize)]
pub struct HideRequest {
    pub item_kind: String,
    pub item_id: String,
}

#[derive(Debug, Serialize)]
pub struct HiddenItem {
    pub item_kind: String,
    pub item_id: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct HiddenListResponse {
    pub items: Vec<HiddenItem>,
}

fn validate_kind(kind: &str) -> Result<(), ApiError> {
    if HIDEABLE_KINDS.contains(&kind) {
        Ok(())
    } else {
        Err(ApiError::Validation(format!(
            "item_kind must be one of {:?}",
            HIDEABLE_KINDS
        )))
    }
}

/// POST /api/hidden — hide an item for the requesting user only.
/// Always allowed; re-hiding is a no-op.
pub async fn hide_item(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<HideRequest>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    validate_kind(&req.item_kind)?;

    let db = state.db.clone();
    let user_id = claims.sub.clone();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.execute(
            "INSERT OR IGNORE INTO hidden_items (user_id, item_kind, item_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![user_id, req.item_kind, req.item_id, Utc::now().to_rfc3339()],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    Ok(ok_empty())
}

/// DELETE /api/hidden — unhide an item. Unknown entries are a no-op.
pub async fn unhide_item(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<HideRequest>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    validate_kind(&req.item_kind)?;

    let db = state.db.clone();
    let user_id = claims.sub.clone();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.execute(
            "DELETE FROM hidden_items WHERE user_id = ?1 AND item_kind = ?2 AND item_id = ?3",
            rusqlite::params![user_id, req.item_kind, req.item_id],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    Ok(ok_empty())
}

/// GET /api/hidden — list the requesting user's hidden items, newest first.
pub async fn list_hidden(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<ApiResponse<HiddenListResponse>>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub.clone();
    let items = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let mut stmt = conn
            .prepare(
                "SELECT item_kind, item_id, created_at FROM hidden_items
                 WHERE user_id = ?1 ORDER BY created_at DESC",
            )
            .map_err(|_| ApiError::Internal)?;
        let items = stmt
            .query_map([&user_id], |row| {
                Ok(HiddenItem {
                    item_kind: row.get(0)?,
                    item_id: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })
            .map_err(|_| ApiError::Internal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(items)
    })
    .await?;

    Ok(ApiResponse::ok(HiddenListResponse { items }))
}

// --- Muted rooms ---

#[derive(Debug, Serialize)]
pub struct MutedListResponse {
    pub room_ids: Vec<String>,
}

/// POST /api/rooms/{room_id}/mute
pub async fn mute_room(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    if !state.memberships.is_member(&room_id, &claims.sub) {
        return Err(ApiError::NotFound("room".to_string()));
    }

    let db = state.db.clone();
    let user_id = claims.sub.clone();
    let rid = room_id.clone();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.execute(
            "INSERT OR IGNORE INTO muted_rooms (user_id, room_id, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![user_id, rid, Utc::now().to_rfc3339()],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    state.visibility.set_muted(&claims.sub, &room_id, true);
    Ok(ok_empty())
}

/// POST /api/rooms/{room_id}/unmute
pub async fn unmute_room(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub.clone();
    let rid = room_id.clone();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.execute(
            "DELETE FROM muted_rooms WHERE user_id = ?1 AND room_id = ?2",
            rusqlite::params![user_id, rid],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    state.visibility.set_muted(&claims.sub, &room_id, false);
    Ok(ok_empty())
}

/// GET /api/muted — rooms the requesting user has muted.
pub async fn list_muted(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<ApiResponse<MutedListResponse>>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub.clone();
    let room_ids = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let mut stmt = conn
            .prepare("SELECT room_id FROM muted_rooms WHERE user_id = ?1 ORDER BY created_at")
            .map_err(|_| ApiError::Internal)?;
        let ids = stmt
            .query_map([&user_id], |row| row.get(0))
            .map_err(|_| ApiError::Internal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    })
    .await?;

    Ok(ApiResponse::ok(MutedListResponse { room_ids }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mute_mirror_tracks_set_and_clear() {
        let sets = VisibilitySets::empty();
        assert!(!sets.is_muted("alice", "general"));
        sets.set_muted("alice", "general", true);
        assert!(sets.is_muted("alice", "general"));
        assert!(!sets.is_muted("bob", "general"));
        sets.set_muted("alice", "general", false);
        assert!(!sets.is_muted("alice", "general"));
    }
}
