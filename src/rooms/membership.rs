//! In-memory room membership index.
//!
//! Two-sided map (room -> members, user -> rooms) kept in lockstep with the
//! `room_members` table: handlers write the DB row first, then mirror the
//! change here. Fan-out targeting, subscription checks, and presence deltas
//! all read this index instead of the DB.
//!
//! Levels: 1 = member, 2 = moderator, 3 = owner.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;

use crate::db::DbPool;

pub const LEVEL_MEMBER: i64 = 1;
pub const LEVEL_MODERATOR: i64 = 2;
pub const LEVEL_OWNER: i64 = 3;

pub struct MembershipIndex {
    /// room_id -> (user_id -> level)
    rooms: DashMap<String, HashMap<String, i64>>,
    /// user_id -> room_ids
    users: DashMap<String, HashSet<String>>,
}

impl Default for MembershipIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipIndex {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            users: DashMap::new(),
        }
    }

    /// Rebuild the index from the room_members table. Called once at boot.
    pub fn load_from_db(db: &DbPool) -> Result<Self, Box<dyn std::error::Error>> {
        let index = Self::new();
        let conn = db.lock().map_err(|e| format!("DB lock error: {}", e))?;
        let mut stmt = conn.prepare(
            "SELECT m.room_id, m.user_id, m.level FROM room_members m
             JOIN rooms r ON r.id = m.room_id
             WHERE r.state != 'deleted'",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut count = 0usize;
        for row in rows {
            let (room_id, user_id, level) = row?;
            index.add_member(&room_id, &user_id, level);
            count += 1;
        }
        tracing::info!(memberships = count, "membership index loaded");
        Ok(index)
    }

    pub fn add_member(&self, room_id: &str, user_id: &str, level: i64) {
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string(), level);
        self.users
            .entry(user_id.to_string())
            .or_default()
            .insert(room_id.to_string());
    }

    pub fn remove_member(&self, room_id: &str, user_id: &str) {
        if let Some(mut members) = self.rooms.get_mut(room_id) {
            members.remove(user_id);
        }
        if let Some(mut rooms) = self.users.get_mut(user_id) {
            rooms.remove(room_id);
        }
    }

    pub fn members_of(&self, room_id: &str) -> HashSet<String> {
        self.rooms
            .get(room_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn level_of(&self, room_id: &str, user_id: &str) -> Option<i64> {
        self.rooms
            .get(room_id)
            .and_then(|m| m.get(user_id).copied())
    }

    pub fn is_member(&self, room_id: &str, user_id: &str) -> bool {
        self.level_of(room_id, user_id).is_some()
    }

    /// Rooms the user belongs to, as a snapshot.
    pub fn rooms_of(&self, user_id: &str) -> Vec<String> {
        self.users
            .get(user_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every trace of a purged room.
    pub fn forget_room(&self, room_id: &str) {
        if let Some((_, members)) = self.rooms.remove(room_id) {
            for user_id in members.keys() {
                if let Some(mut rooms) = self.users.get_mut(user_id) {
                    rooms.remove(room_id);
                }
            }
        }
    }
}
