//! Connection registry: one entry per live transport session.
//!
//! A user can hold several connections at once (tabs, devices). Each handle
//! owns a bounded outbound queue; a consumer that falls behind is marked
//! resync-required and skipped, never waited on. Registering a connection id
//! twice returns the existing handle, and unregistering an unknown id is a
//! no-op — disconnect notifications are at-least-once.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::realtime::presence::{PresenceShift, PresenceTracker};
use crate::ws::protocol::ServerFrame;

/// One live connection. Cloned senders are not handed out; everything goes
/// through `try_deliver` so the overflow policy is applied in one place.
pub struct ConnectionHandle {
    pub connection_id: String,
    pub user_id: String,
    pub is_admin: bool,
    tx: mpsc::Sender<ServerFrame>,
    resync_required: AtomicBool,
}

impl ConnectionHandle {
    /// Queue a frame without blocking. On a full queue the connection is
    /// marked resync-required and the frame is dropped; delivery to it stops
    /// until the client reconnects and refetches. Returns whether the frame
    /// was queued.
    pub fn try_deliver(&self, frame: ServerFrame) -> bool {
        if self.resync_required.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.resync_required.store(true, Ordering::Release);
                tracing::warn!(
                    connection_id = %self.connection_id,
                    user_id = %self.user_id,
                    "outbound queue overflow, connection marked resync-required"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a frame even when the connection is resync-flagged. Used for the
    /// resync notice itself and for replies to client requests.
    pub fn try_reply(&self, frame: ServerFrame) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    pub fn needs_resync(&self) -> bool {
        self.resync_required.load(Ordering::Acquire)
    }
}

/// Outcome of a register call: the handle, whether it already existed, and
/// the presence transition the registration caused (empty when idempotent).
pub struct RegisterOutcome {
    pub handle: Arc<ConnectionHandle>,
    pub existing: bool,
    pub shift: PresenceShift,
}

pub struct ConnectionRegistry {
    presence: Arc<PresenceTracker>,
    queue_capacity: usize,
    /// connection_id -> handle
    by_id: DashMap<String, Arc<ConnectionHandle>>,
    /// user_id -> connection_ids
    by_user: DashMap<String, HashSet<String>>,
    /// room_id -> subscribed connection_ids
    room_subs: DashMap<String, HashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new(presence: Arc<PresenceTracker>, queue_capacity: usize) -> Self {
        Self {
            presence,
            queue_capacity,
            by_id: DashMap::new(),
            by_user: DashMap::new(),
            room_subs: DashMap::new(),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Register a connection and trigger the presence recompute for its user.
    /// Idempotent per connection_id: a repeat returns the existing handle, an
    /// unchanged presence shift, and no new receiver.
    pub fn register(
        &self,
        user_id: &str,
        connection_id: &str,
        is_admin: bool,
    ) -> (RegisterOutcome, Option<mpsc::Receiver<ServerFrame>>) {
        // The entry guard makes the check-and-insert atomic: two racing
        // registrations for one id cannot both mint a queue.
        let (handle, rx) = match self.by_id.entry(connection_id.to_string()) {
            Entry::Occupied(entry) => {
                return (
                    RegisterOutcome {
                        handle: entry.get().clone(),
                        existing: true,
                        shift: PresenceShift::default(),
                    },
                    None,
                );
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel(self.queue_capacity);
                let handle = Arc::new(ConnectionHandle {
                    connection_id: connection_id.to_string(),
                    user_id: user_id.to_string(),
                    is_admin,
                    tx,
                    resync_required: AtomicBool::new(false),
                });
                entry.insert(handle.clone());
                (handle, rx)
            }
        };

        self.by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());

        let shift = self.presence.connection_opened(user_id, is_admin);

        tracing::debug!(
            connection_id = %connection_id,
            user_id = %user_id,
            connections = self.by_user.get(user_id).map(|v| v.len()).unwrap_or(0),
            "connection registered"
        );

        (
            RegisterOutcome {
                handle,
                existing: false,
                shift,
            },
            Some(rx),
        )
    }

    /// Unregister a connection and trigger the presence recompute. Unknown
    /// ids are a no-op, not an error.
    pub fn unregister(&self, connection_id: &str) -> Option<(Arc<ConnectionHandle>, PresenceShift)> {
        let (_, handle) = self.by_id.remove(connection_id)?;

        let mut drop_user = false;
        if let Some(mut conns) = self.by_user.get_mut(&handle.user_id) {
            conns.remove(connection_id);
            drop_user = conns.is_empty();
        }
        if drop_user {
            self.by_user.remove(&handle.user_id);
        }

        for mut entry in self.room_subs.iter_mut() {
            entry.value_mut().remove(connection_id);
        }

        let shift = self
            .presence
            .connection_closed(&handle.user_id, handle.is_admin);

        tracing::debug!(
            connection_id = %connection_id,
            user_id = %handle.user_id,
            "connection unregistered"
        );

        Some((handle, shift))
    }

    pub fn connections_of(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let Some(ids) = self.by_user.get(user_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.by_id.get(id).map(|h| h.clone()))
            .collect()
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.by_id.get(connection_id).map(|h| h.clone())
    }

    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }

    /// Subscribe a connection to a room's fan-out. The membership invariant
    /// is enforced by callers (ws actor and membership handlers) before this.
    pub fn subscribe(&self, connection_id: &str, room_id: &str) {
        self.room_subs
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    pub fn unsubscribe(&self, connection_id: &str, room_id: &str) {
        if let Some(mut subs) = self.room_subs.get_mut(room_id) {
            subs.remove(connection_id);
        }
    }

    pub fn subscribers_of(&self, room_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let Some(subs) = self.room_subs.get(room_id) else {
            return Vec::new();
        };
        subs.iter()
            .filter_map(|id| self.by_id.get(id).map(|h| h.clone()))
            .collect()
    }

    /// Subscribe all of a user's live connections to a room (join/accept).
    pub fn subscribe_user(&self, user_id: &str, room_id: &str) {
        for handle in self.connections_of(user_id) {
            self.subscribe(&handle.connection_id, room_id);
        }
    }

    /// Drop all of a user's subscriptions to a room (leave/ban/kick).
    pub fn unsubscribe_user(&self, user_id: &str, room_id: &str) {
        for handle in self.connections_of(user_id) {
            self.unsubscribe(&handle.connection_id, room_id);
        }
    }

    /// Drop every subscription to a purged room.
    pub fn forget_room(&self, room_id: &str) {
        self.room_subs.remove(room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::membership::MembershipIndex;

    fn registry() -> ConnectionRegistry {
        let memberships = Arc::new(MembershipIndex::new());
        let presence = Arc::new(PresenceTracker::new(memberships));
        ConnectionRegistry::new(presence, 4)
    }

    #[tokio::test]
    async fn register_is_idempotent_per_connection_id() {
        let registry = registry();
        let (first, _rx1) = registry.register("alice", "c-1", false);
        assert!(!first.existing);
        assert_eq!(first.shift.user_online, Some(true));

        let (second, rx2) = registry.register("alice", "c-1", false);
        assert!(second.existing);
        assert!(rx2.is_none());
        assert!(second.shift.unchanged());
        assert_eq!(registry.connections_of("alice").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_registers_mint_exactly_one_queue() {
        let registry = Arc::new(registry());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.register("alice", "c-1", false)
            }));
        }
        let mut receivers = 0;
        for task in tasks {
            let (_, rx) = task.await.unwrap();
            if rx.is_some() {
                receivers += 1;
            }
        }
        assert_eq!(receivers, 1);
        assert_eq!(registry.connections_of("alice").len(), 1);
    }

    #[tokio::test]
    async fn unregister_unknown_id_is_a_no_op() {
        let registry = registry();
        assert!(registry.unregister("ghost").is_none());
    }

    #[tokio::test]
    async fn register_then_unregister_restores_presence() {
        let registry = registry();
        let presence = registry.presence.clone();
        assert!(!presence.is_online("alice"));

        let (outcome, _rx) = registry.register("alice", "c-1", false);
        assert!(presence.is_online("alice"));

        let (_, shift) = registry.unregister(&outcome.handle.connection_id).unwrap();
        assert_eq!(shift.user_online, Some(false));
        assert!(!presence.is_online("alice"));
    }

    #[tokio::test]
    async fn overflow_marks_resync_and_stops_delivery() {
        let registry = registry();
        let (outcome, rx) = registry.register("alice", "c-1", false);
        let mut rx = rx.unwrap();
        let handle = outcome.handle;

        // Fill the queue (capacity 4), then one more to overflow.
        for _ in 0..4 {
            assert!(handle.try_deliver(ServerFrame::Pong));
        }
        assert!(!handle.try_deliver(ServerFrame::Pong));
        assert!(handle.needs_resync());

        // Once flagged, further deliveries are skipped even after draining.
        while rx.try_recv().is_ok() {}
        assert!(!handle.try_deliver(ServerFrame::Pong));
        // Replies still go through for the resync notice itself.
        assert!(handle.try_reply(ServerFrame::Pong));
    }

    #[tokio::test]
    async fn subscriptions_follow_user_connections() {
        let registry = registry();
        let (a1, _rx1) = registry.register("alice", "c-1", false);
        let (a2, _rx2) = registry.register("alice", "c-2", false);
        let (_b, _rx3) = registry.register("bob", "c-3", false);

        registry.subscribe_user("alice", "general");
        assert_eq!(registry.subscribers_of("general").len(), 2);

        registry.unregister(&a1.handle.connection_id);
        assert_eq!(registry.subscribers_of("general").len(), 1);

        registry.unsubscribe_user("alice", "general");
        assert!(registry.subscribers_of("general").is_empty());
        drop(a2);
    }
}
