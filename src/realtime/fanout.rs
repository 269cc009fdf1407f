//! Event fan-out: sequence through the replay log, then deliver.
//!
//! Delivery targets the room's subscribed connections (or every connection
//! for the system stream). Each target is offered the frame without blocking;
//! overflow isolation lives in the connection handle. Muting downgrades the
//! frame to silent, it never suppresses delivery. Report events are visible
//! only to connections whose user moderates the room.

use std::sync::Arc;

use crate::api::ApiError;
use crate::moderation::visibility::VisibilitySets;
use crate::realtime::event::{Event, EventBody, EventKind, SYSTEM_STREAM};
use crate::realtime::registry::ConnectionRegistry;
use crate::realtime::replay::{MessageAppend, ReplayGap, ReplayLog};
use crate::rooms::membership::{MembershipIndex, LEVEL_MODERATOR};
use crate::ws::protocol::ServerFrame;

pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    memberships: Arc<MembershipIndex>,
    visibility: Arc<VisibilitySets>,
    log: ReplayLog,
}

impl EventRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        memberships: Arc<MembershipIndex>,
        visibility: Arc<VisibilitySets>,
        log: ReplayLog,
    ) -> Self {
        Self {
            registry,
            memberships,
            visibility,
            log,
        }
    }

    /// Publish an event to a room: assign its id, retain it for replay, and
    /// deliver to subscribers. Returns the sequenced event and the ids of
    /// connections that accepted it. Durability does not depend on listeners:
    /// with no subscribers the id still advances and the event still replays.
    pub async fn publish(
        &self,
        room_id: &str,
        body: EventBody,
    ) -> Result<(Event, Vec<String>), ApiError> {
        let event = self.log.append(room_id, body).await?;
        let delivered = self.deliver(&event);
        Ok((event, delivered))
    }

    /// Publish on the reserved system stream (admin count, presence), which
    /// every connection is implicitly subscribed to.
    pub async fn publish_system(&self, body: EventBody) -> Result<(Event, Vec<String>), ApiError> {
        self.publish(SYSTEM_STREAM, body).await
    }

    /// Sequence and deliver a chat message, deduplicating on the client's
    /// idempotency token. A deduplicated retry is not re-fanned-out; the
    /// original event already went to subscribers exactly once.
    pub async fn post_message(
        &self,
        room_id: &str,
        sender_id: &str,
        sender_name: &str,
        content: &str,
        client_token: Option<&str>,
    ) -> Result<(MessageAppend, Vec<String>), ApiError> {
        let append = self
            .log
            .append_message(room_id, sender_id, sender_name, content, client_token)
            .await?;
        let delivered = if append.deduplicated {
            Vec::new()
        } else {
            self.deliver(&append.event)
        };
        Ok((append, delivered))
    }

    pub async fn replay_since(
        &self,
        room_id: &str,
        last_seen: u64,
    ) -> Result<Result<Vec<Event>, ReplayGap>, ApiError> {
        self.log.replay_since(room_id, last_seen).await
    }

    pub async fn next_event_id(&self, room_id: &str) -> Result<u64, ApiError> {
        self.log.next_event_id(room_id).await
    }

    /// Push a frame to every live connection of one user, outside any room
    /// stream. Used for invitation and ticket notifications where the target
    /// is not (yet) subscribed to the room the event lives in.
    pub fn notify_user(&self, user_id: &str, frame: ServerFrame) -> usize {
        let mut delivered = 0;
        for conn in self.registry.connections_of(user_id) {
            if conn.try_deliver(frame.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    fn deliver(&self, event: &Event) -> Vec<String> {
        let targets = if event.room_id == SYSTEM_STREAM {
            self.registry.all()
        } else {
            self.registry.subscribers_of(&event.room_id)
        };

        let mut delivered = Vec::new();
        for conn in targets {
            // Reports are moderator-facing.
            if event.kind == EventKind::Report {
                let level = self
                    .memberships
                    .level_of(&event.room_id, &conn.user_id)
                    .unwrap_or(0);
                if level < LEVEL_MODERATOR {
                    continue;
                }
            }

            let silent = self.visibility.is_muted(&conn.user_id, &event.room_id);
            let frame = ServerFrame::Event {
                event: event.clone(),
                silent,
            };
            if conn.try_deliver(frame) {
                delivered.push(conn.connection_id.clone());
            }
        }

        tracing::trace!(
            room_id = %event.room_id,
            event_id = event.event_id,
            kind = event.kind.as_str(),
            delivered = delivered.len(),
            "event fanned out"
        );
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::realtime::presence::PresenceTracker;
    use crate::rooms::membership::{LEVEL_MEMBER, LEVEL_OWNER};
    use chrono::Utc;
    use tokio::sync::mpsc;

    struct Fixture {
        router: EventRouter,
        registry: Arc<ConnectionRegistry>,
        visibility: Arc<VisibilitySets>,
    }

    fn fixture() -> Fixture {
        let pool = db::init_test_db();
        {
            let conn = pool.lock().unwrap();
            let now = Utc::now().to_rfc3339();
            for user in ["u-owner", "u-bob", "u-carol"] {
                conn.execute(
                    "INSERT INTO users (id, username, password_hash, created_at, updated_at)
                     VALUES (?1, ?2, 'x', ?3, ?3)",
                    rusqlite::params![user, user.trim_start_matches("u-"), now],
                )
                .unwrap();
            }
            conn.execute(
                "INSERT INTO rooms (id, kind, name, created_by, created_at, updated_at)
                 VALUES ('general', 'topic', 'General', 'u-owner', ?1, ?1)",
                [&now],
            )
            .unwrap();
        }

        let memberships = Arc::new(MembershipIndex::new());
        memberships.add_member("general", "u-owner", LEVEL_OWNER);
        memberships.add_member("general", "u-bob", LEVEL_MEMBER);
        let presence = Arc::new(PresenceTracker::new(memberships.clone()));
        let registry = Arc::new(ConnectionRegistry::new(presence, 16));
        let visibility = Arc::new(VisibilitySets::empty());
        let router = EventRouter::new(
            registry.clone(),
            memberships.clone(),
            visibility.clone(),
            ReplayLog::new(pool, 64),
        );
        Fixture {
            router,
            registry,
            visibility,
        }
    }

    fn connect(
        f: &Fixture,
        user: &str,
        conn_id: &str,
        rooms: &[&str],
    ) -> mpsc::Receiver<ServerFrame> {
        let (_outcome, rx) = f.registry.register(user, conn_id, false);
        for room in rooms {
            f.registry.subscribe(conn_id, room);
        }
        rx.unwrap()
    }

    fn typing(user: &str) -> EventBody {
        EventBody::Typing {
            user_id: user.into(),
            username: user.trim_start_matches("u-").into(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscribed_connections_only() {
        let f = fixture();
        let mut bob = connect(&f, "u-bob", "c-bob", &["general"]);
        let mut carol = connect(&f, "u-carol", "c-carol", &[]);

        let (event, delivered) = f.router.publish("general", typing("u-owner")).await.unwrap();
        assert_eq!(event.event_id, 1);
        assert_eq!(delivered, vec!["c-bob".to_string()]);

        match bob.try_recv().unwrap() {
            ServerFrame::Event { event, silent } => {
                assert_eq!(event.event_id, 1);
                assert!(!silent);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(carol.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_still_advances_and_replays() {
        let f = fixture();
        let (event, delivered) = f.router.publish("general", typing("u-owner")).await.unwrap();
        assert!(delivered.is_empty());
        assert_eq!(event.event_id, 1);
        assert_eq!(f.router.next_event_id("general").await.unwrap(), 2);

        // A late subscriber replays the event it missed.
        let events = f.router.replay_since("general", 0).await.unwrap().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, 1);
    }

    #[tokio::test]
    async fn muted_rooms_deliver_silently() {
        let f = fixture();
        let mut bob = connect(&f, "u-bob", "c-bob", &["general"]);
        f.visibility.set_muted("u-bob", "general", true);

        f.router.publish("general", typing("u-owner")).await.unwrap();
        match bob.try_recv().unwrap() {
            ServerFrame::Event { silent, .. } => assert!(silent),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn reports_fan_out_to_moderators_only() {
        let f = fixture();
        let mut owner = connect(&f, "u-owner", "c-owner", &["general"]);
        let mut bob = connect(&f, "u-bob", "c-bob", &["general"]);

        let report = EventBody::ReportFiled {
            report_id: "r-1".into(),
            reporter_id: "u-bob".into(),
            target_kind: "message".into(),
            target_id: "m-1".into(),
            reason: "spam".into(),
        };
        let (_, delivered) = f.router.publish("general", report).await.unwrap();
        assert_eq!(delivered, vec!["c-owner".to_string()]);
        assert!(owner.try_recv().is_ok());
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn system_stream_reaches_every_connection() {
        let f = fixture();
        let mut bob = connect(&f, "u-bob", "c-bob", &["general"]);
        let mut carol = connect(&f, "u-carol", "c-carol", &[]);

        let (event, delivered) = f
            .router
            .publish_system(EventBody::AdminOnline { online: 1 })
            .await
            .unwrap();
        assert_eq!(event.room_id, SYSTEM_STREAM);
        assert_eq!(delivered.len(), 2);
        assert!(bob.try_recv().is_ok());
        assert!(carol.try_recv().is_ok());
    }

    #[tokio::test]
    async fn deduplicated_retry_is_not_fanned_out_twice() {
        let f = fixture();
        let mut bob = connect(&f, "u-bob", "c-bob", &["general"]);

        let (first, delivered) = f
            .router
            .post_message("general", "u-owner", "owner", "hi", Some("tok"))
            .await
            .unwrap();
        assert!(!first.deduplicated);
        assert_eq!(delivered.len(), 1);

        let (retry, delivered) = f
            .router
            .post_message("general", "u-owner", "owner", "hi", Some("tok"))
            .await
            .unwrap();
        assert!(retry.deduplicated);
        assert!(delivered.is_empty());
        assert_eq!(retry.event.event_id, first.event.event_id);

        assert!(bob.try_recv().is_ok());
        assert!(bob.try_recv().is_err());
    }
}
