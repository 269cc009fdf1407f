//! Per-room ordered event log: the delivery guarantee layer.
//!
//! Every publish to a room goes through that room's async mutex, so event ids
//! are assigned strictly monotonically with no gaps. The id allocator lives
//! in the `room_sequences` table and is advanced on every append, which keeps
//! ids monotonic across restarts; message payloads are additionally written
//! to the `messages` table, other kinds only to the in-memory replay ring.
//!
//! `replay_since` serves reconnecting clients from the ring. A client further
//! behind than the ring retains gets a typed gap signal and must refetch over
//! REST. The ring is empty after a restart, so resuming across one always
//! takes the gap path.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::api::{blocking, ApiError};
use crate::db::DbPool;
use crate::realtime::event::{Event, EventBody};

/// Typed "gap — full resync required" signal from `replay_since`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayGap;

/// Outcome of a message append: the sequenced event plus whether it was a
/// dedup hit for a retried idempotency token.
#[derive(Debug)]
pub struct MessageAppend {
    pub event: Event,
    pub deduplicated: bool,
}

struct RoomLog {
    /// Next id to assign; mirrors room_sequences. 0 = not yet loaded.
    next_id: u64,
    ring: VecDeque<Event>,
}

pub struct ReplayLog {
    db: DbPool,
    retention: usize,
    rooms: DashMap<String, Arc<Mutex<RoomLog>>>,
}

fn content_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

impl ReplayLog {
    pub fn new(db: DbPool, retention: usize) -> Self {
        Self {
            db,
            retention: retention.max(1),
            rooms: DashMap::new(),
        }
    }

    fn room_entry(&self, room_id: &str) -> Arc<Mutex<RoomLog>> {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(RoomLog {
                    next_id: 0,
                    ring: VecDeque::new(),
                }))
            })
            .clone()
    }

    /// Load the durable allocator for a room if this log has not touched it
    /// yet. Must run under the room lock.
    async fn ensure_loaded(&self, room_id: &str, log: &mut RoomLog) -> Result<(), ApiError> {
        if log.next_id != 0 {
            return Ok(());
        }
        let db = self.db.clone();
        let room_id = room_id.to_string();
        log.next_id = blocking(move || {
            let conn = db.lock().map_err(|_| ApiError::Internal)?;
            Ok(conn
                .query_row(
                    "SELECT next_event_id FROM room_sequences WHERE room_id = ?1",
                    [&room_id],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n as u64)
                .unwrap_or(1))
        })
        .await?;
        Ok(())
    }

    async fn persist_allocator(&self, room_id: &str, next_id: u64) -> Result<(), ApiError> {
        let db = self.db.clone();
        let room_id = room_id.to_string();
        blocking(move || {
            let conn = db.lock().map_err(|_| ApiError::Internal)?;
            conn.execute(
                "INSERT INTO room_sequences (room_id, next_event_id) VALUES (?1, ?2)
                 ON CONFLICT(room_id) DO UPDATE SET next_event_id = ?2",
                rusqlite::params![room_id, next_id as i64],
            )
            .map_err(|_| ApiError::Internal)?;
            Ok(())
        })
        .await
    }

    fn push_ring(&self, log: &mut RoomLog, event: Event) {
        log.ring.push_back(event);
        while log.ring.len() > self.retention {
            log.ring.pop_front();
        }
    }

    /// Peek the id the next event in this room will get.
    pub async fn next_event_id(&self, room_id: &str) -> Result<u64, ApiError> {
        let entry = self.room_entry(room_id);
        let mut log = entry.lock().await;
        self.ensure_loaded(room_id, &mut log).await?;
        Ok(log.next_id)
    }

    /// Append a non-message event: assign the next id, advance the durable
    /// allocator, retain in the ring only.
    pub async fn append(&self, room_id: &str, body: EventBody) -> Result<Event, ApiError> {
        let entry = self.room_entry(room_id);
        let mut log = entry.lock().await;
        self.ensure_loaded(room_id, &mut log).await?;

        let event = Event::new(log.next_id, room_id, body);
        self.persist_allocator(room_id, event.event_id + 1).await?;
        log.next_id = event.event_id + 1;
        self.push_ring(&mut log, event.clone());
        Ok(event)
    }

    /// Append a chat message durably, deduplicating on the client-supplied
    /// idempotency token. A retry with the same token and content returns the
    /// original event; the same token with different content is a conflict.
    /// The returned event echoes the token so the sender can replace its
    /// optimistic entry exactly once.
    pub async fn append_message(
        &self,
        room_id: &str,
        sender_id: &str,
        sender_name: &str,
        content: &str,
        client_token: Option<&str>,
    ) -> Result<MessageAppend, ApiError> {
        let entry = self.room_entry(room_id);
        let mut log = entry.lock().await;
        self.ensure_loaded(room_id, &mut log).await?;

        // Dedup check under the room lock: publishes to one room are
        // serialized here, so two retries cannot race past each other.
        if let Some(token) = client_token {
            let existing = {
                let db = self.db.clone();
                let rid = room_id.to_string();
                let sid = sender_id.to_string();
                let tok = token.to_string();
                blocking(move || {
                    let conn = db.lock().map_err(|_| ApiError::Internal)?;
                    Ok(conn
                        .query_row(
                            "SELECT id, event_id, content, created_at FROM messages
                             WHERE room_id = ?1 AND sender_id = ?2 AND client_token = ?3",
                            rusqlite::params![rid, sid, tok],
                            |row| {
                                Ok((
                                    row.get::<_, String>(0)?,
                                    row.get::<_, i64>(1)?,
                                    row.get::<_, String>(2)?,
                                    row.get::<_, String>(3)?,
                                ))
                            },
                        )
                        .ok())
                })
                .await?
            };

            if let Some((message_id, event_id, stored_content, created_at)) = existing {
                if content_digest(&stored_content) != content_digest(content) {
                    return Err(ApiError::Conflict(
                        "idempotency token reused with different content".to_string(),
                    ));
                }
                let mut event = Event::new(
                    event_id as u64,
                    room_id,
                    EventBody::MessagePosted {
                        message_id,
                        sender_id: sender_id.to_string(),
                        sender_name: sender_name.to_string(),
                        content: stored_content,
                        client_token: Some(token.to_string()),
                    },
                );
                if let Ok(ts) = created_at.parse() {
                    event.created_at = ts;
                }
                return Ok(MessageAppend {
                    event,
                    deduplicated: true,
                });
            }
        }

        let message_id = Uuid::now_v7().to_string();
        let event = Event::new(
            log.next_id,
            room_id,
            EventBody::MessagePosted {
                message_id: message_id.clone(),
                sender_id: sender_id.to_string(),
                sender_name: sender_name.to_string(),
                content: content.to_string(),
                client_token: client_token.map(str::to_string),
            },
        );

        {
            let db = self.db.clone();
            let rid = room_id.to_string();
            let sid = sender_id.to_string();
            let mid = message_id.clone();
            let body = content.to_string();
            let tok = client_token.map(str::to_string);
            let event_id = event.event_id;
            let created_at = event.created_at.to_rfc3339();
            blocking(move || {
                let conn = db.lock().map_err(|_| ApiError::Internal)?;
                conn.execute(
                    "INSERT INTO messages (id, room_id, event_id, sender_id, content, client_token, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![mid, rid, event_id as i64, sid, body, tok, created_at],
                )
                .map_err(|_| ApiError::Internal)?;
                conn.execute(
                    "INSERT INTO room_sequences (room_id, next_event_id) VALUES (?1, ?2)
                     ON CONFLICT(room_id) DO UPDATE SET next_event_id = ?2",
                    rusqlite::params![rid, (event_id + 1) as i64],
                )
                .map_err(|_| ApiError::Internal)?;
                Ok(())
            })
            .await?;
        }

        log.next_id = event.event_id + 1;
        self.push_ring(&mut log, event.clone());
        Ok(MessageAppend {
            event,
            deduplicated: false,
        })
    }

    /// Events strictly after `last_seen`, in increasing id order, no gaps and
    /// no duplicates. Restartable: a client may call it repeatedly. Returns
    /// the gap signal when retention no longer covers the requested range.
    pub async fn replay_since(
        &self,
        room_id: &str,
        last_seen: u64,
    ) -> Result<Result<Vec<Event>, ReplayGap>, ApiError> {
        let entry = self.room_entry(room_id);
        let mut log = entry.lock().await;
        self.ensure_loaded(room_id, &mut log).await?;

        let head = log.next_id - 1; // highest assigned id, 0 when none
        if last_seen >= head {
            // Caught up (or claims to be ahead, which resolves to empty).
            return Ok(Ok(Vec::new()));
        }

        match log.ring.front() {
            Some(oldest) if oldest.event_id <= last_seen + 1 => {
                let events = log
                    .ring
                    .iter()
                    .filter(|e| e.event_id > last_seen)
                    .cloned()
                    .collect();
                Ok(Ok(events))
            }
            // Ring empty or trimmed past the requested range.
            _ => Ok(Err(ReplayGap)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::realtime::event::EventKind;
    use chrono::Utc;

    fn seeded_db() -> DbPool {
        let pool = db::init_test_db();
        {
            let conn = pool.lock().unwrap();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO users (id, username, password_hash, is_admin, created_at, updated_at)
                 VALUES ('u-ada', 'ada', 'x', 1, ?1, ?1)",
                [&now],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO rooms (id, kind, name, created_by, created_at, updated_at)
                 VALUES ('general', 'topic', 'General', 'u-ada', ?1, ?1)",
                [&now],
            )
            .unwrap();
        }
        pool
    }

    fn typing() -> EventBody {
        EventBody::Typing {
            user_id: "u-ada".into(),
            username: "ada".into(),
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_gapless() {
        let log = ReplayLog::new(seeded_db(), 64);
        for expected in 1..=5u64 {
            let event = log.append("general", typing()).await.unwrap();
            assert_eq!(event.event_id, expected);
        }
        assert_eq!(log.next_event_id("general").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn replay_is_strictly_increasing_with_no_gaps() {
        let log = ReplayLog::new(seeded_db(), 64);
        for _ in 0..8 {
            log.append("general", typing()).await.unwrap();
        }
        let events = log.replay_since("general", 3).await.unwrap().unwrap();
        let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![4, 5, 6, 7, 8]);

        // Restartable: the same call again returns the same sequence.
        let again = log.replay_since("general", 3).await.unwrap().unwrap();
        assert_eq!(again.len(), 5);

        // Caught up means empty, not an error.
        assert!(log
            .replay_since("general", 8)
            .await
            .unwrap()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn expired_retention_signals_gap() {
        let log = ReplayLog::new(seeded_db(), 3);
        for _ in 0..10 {
            log.append("general", typing()).await.unwrap();
        }
        // Ring holds ids 8..=10; asking since 2 cannot be served gap-free.
        assert_eq!(
            log.replay_since("general", 2).await.unwrap(),
            Err(ReplayGap)
        );
        // Since 7 is exactly covered.
        let events = log.replay_since("general", 7).await.unwrap().unwrap();
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn allocator_survives_restart() {
        let pool = seeded_db();
        {
            let log = ReplayLog::new(pool.clone(), 64);
            for _ in 0..4 {
                log.append("general", typing()).await.unwrap();
            }
        }
        // New log instance over the same DB: ids continue, ring is empty so
        // resuming replays signal a gap.
        let log = ReplayLog::new(pool, 64);
        assert_eq!(log.next_event_id("general").await.unwrap(), 5);
        assert_eq!(
            log.replay_since("general", 2).await.unwrap(),
            Err(ReplayGap)
        );
        let event = log.append("general", typing()).await.unwrap();
        assert_eq!(event.event_id, 5);
    }

    #[tokio::test]
    async fn idempotency_token_dedups_retries() {
        let log = ReplayLog::new(seeded_db(), 64);
        let first = log
            .append_message("general", "u-ada", "ada", "hello", Some("tok-1"))
            .await
            .unwrap();
        assert!(!first.deduplicated);

        let retry = log
            .append_message("general", "u-ada", "ada", "hello", Some("tok-1"))
            .await
            .unwrap();
        assert!(retry.deduplicated);
        assert_eq!(retry.event.event_id, first.event.event_id);

        // Exactly one durable row.
        let count: i64 = {
            let conn = log.db.lock().unwrap();
            conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(count, 1);

        // Same token, different content: conflict.
        let err = log
            .append_message("general", "u-ada", "ada", "other text", Some("tok-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn messages_and_transient_events_share_one_sequence() {
        let log = ReplayLog::new(seeded_db(), 64);
        let m1 = log
            .append_message("general", "u-ada", "ada", "one", None)
            .await
            .unwrap();
        let t = log.append("general", typing()).await.unwrap();
        let m2 = log
            .append_message("general", "u-ada", "ada", "two", None)
            .await
            .unwrap();
        assert_eq!(
            (m1.event.event_id, t.event_id, m2.event.event_id),
            (1, 2, 3)
        );
        assert_eq!(m2.event.kind, EventKind::Message);
    }
}
