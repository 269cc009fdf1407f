//! Presence derived from live connections.
//!
//! Nothing here is stored durably: a user is online iff they hold at least
//! one registered connection. Counts are maintained by connection-count
//! deltas — opening the fifth tab or closing the fourth never rescans
//! anything. The admin counter is a single atomic shared by the push path
//! (`admin_count` events) and the pull path (`get_admin_count`), so both
//! always answer the same value for a given instant.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::rooms::membership::MembershipIndex;

/// Online-state transition produced by a connection opening or closing.
/// `None` fields mean the respective aggregate did not change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceShift {
    /// `Some(true)` when the user just came online, `Some(false)` when the
    /// last connection closed.
    pub user_online: Option<bool>,
    /// New global admin-online count, when it changed.
    pub admin_online: Option<i64>,
}

impl PresenceShift {
    pub fn unchanged(&self) -> bool {
        self.user_online.is_none() && self.admin_online.is_none()
    }
}

/// Aggregates per-user online state, per-room online member counts, and the
/// global admin-online count.
pub struct PresenceTracker {
    memberships: Arc<MembershipIndex>,
    /// user_id -> live connection count
    conn_counts: DashMap<String, u32>,
    /// room_id -> online member count
    room_online: DashMap<String, i64>,
    online_admins: AtomicI64,
}

impl PresenceTracker {
    pub fn new(memberships: Arc<MembershipIndex>) -> Self {
        Self {
            memberships,
            conn_counts: DashMap::new(),
            room_online: DashMap::new(),
            online_admins: AtomicI64::new(0),
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.conn_counts
            .get(user_id)
            .map(|c| *c > 0)
            .unwrap_or(false)
    }

    pub fn online_count_in(&self, room_id: &str) -> i64 {
        self.room_online
            .get(room_id)
            .map(|c| (*c).max(0))
            .unwrap_or(0)
    }

    pub fn online_admin_count(&self) -> i64 {
        self.online_admins.load(Ordering::SeqCst).max(0)
    }

    /// Account for a newly registered connection. O(1) except on the
    /// offline->online edge, where each of the user's rooms gets a +1.
    pub fn connection_opened(&self, user_id: &str, is_admin: bool) -> PresenceShift {
        let mut entry = self.conn_counts.entry(user_id.to_string()).or_insert(0);
        *entry += 1;
        let came_online = *entry == 1;
        drop(entry);

        if !came_online {
            return PresenceShift::default();
        }

        for room_id in self.memberships.rooms_of(user_id) {
            *self.room_online.entry(room_id).or_insert(0) += 1;
        }

        let admin_online = if is_admin {
            Some(self.online_admins.fetch_add(1, Ordering::SeqCst) + 1)
        } else {
            None
        };

        PresenceShift {
            user_online: Some(true),
            admin_online,
        }
    }

    /// Account for a closed connection. The mirror of `connection_opened`.
    pub fn connection_closed(&self, user_id: &str, is_admin: bool) -> PresenceShift {
        let went_offline = match self.conn_counts.get_mut(user_id) {
            Some(mut entry) => {
                *entry = entry.saturating_sub(1);
                *entry == 0
            }
            // Close without a matching open — disconnect notifications are
            // at-least-once, so this must stay a no-op.
            None => false,
        };

        if !went_offline {
            return PresenceShift::default();
        }
        // A connection opened between the count check and here has already
        // resurrected the entry; removing it would strand that user offline.
        self.conn_counts.remove_if(user_id, |_, count| *count == 0);

        for room_id in self.memberships.rooms_of(user_id) {
            if let Some(mut count) = self.room_online.get_mut(&room_id) {
                *count = (*count - 1).max(0);
            }
        }

        let admin_online = if is_admin {
            Some(self.online_admins.fetch_sub(1, Ordering::SeqCst) - 1)
        } else {
            None
        };

        PresenceShift {
            user_online: Some(false),
            admin_online,
        }
    }

    /// A user joined a room: bump the room count if they are online now.
    pub fn member_joined(&self, room_id: &str, user_id: &str) {
        if self.is_online(user_id) {
            *self.room_online.entry(room_id.to_string()).or_insert(0) += 1;
        }
    }

    /// A user left a room (or was removed): drop their online contribution.
    pub fn member_left(&self, room_id: &str, user_id: &str) {
        if self.is_online(user_id) {
            if let Some(mut count) = self.room_online.get_mut(room_id) {
                *count = (*count - 1).max(0);
            }
        }
    }

    /// Drop all counters for a purged room.
    pub fn forget_room(&self, room_id: &str) {
        self.room_online.remove(room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with_room() -> (Arc<MembershipIndex>, PresenceTracker) {
        let memberships = Arc::new(MembershipIndex::new());
        memberships.add_member("general", "alice", 3);
        memberships.add_member("general", "bob", 1);
        memberships.add_member("general", "carol", 1);
        let tracker = PresenceTracker::new(memberships.clone());
        (memberships, tracker)
    }

    #[test]
    fn online_tracks_connection_count_deltas() {
        let (_m, tracker) = tracker_with_room();

        assert!(!tracker.is_online("alice"));
        let shift = tracker.connection_opened("alice", false);
        assert_eq!(shift.user_online, Some(true));
        assert!(tracker.is_online("alice"));
        assert_eq!(tracker.online_count_in("general"), 1);

        // Second tab: no transition, count unchanged.
        let shift = tracker.connection_opened("alice", false);
        assert!(shift.unchanged());
        assert_eq!(tracker.online_count_in("general"), 1);

        // Closing one of two tabs keeps the user online.
        let shift = tracker.connection_closed("alice", false);
        assert!(shift.unchanged());
        assert!(tracker.is_online("alice"));

        // Closing the last tab takes the room count down without a rescan.
        let shift = tracker.connection_closed("alice", false);
        assert_eq!(shift.user_online, Some(false));
        assert!(!tracker.is_online("alice"));
        assert_eq!(tracker.online_count_in("general"), 0);
    }

    #[test]
    fn room_count_follows_all_members() {
        let (_m, tracker) = tracker_with_room();
        tracker.connection_opened("alice", false);
        tracker.connection_opened("bob", false);
        tracker.connection_opened("carol", false);
        assert_eq!(tracker.online_count_in("general"), 3);

        // One member closes all tabs: count drops to 2 with no recount call.
        tracker.connection_closed("carol", false);
        assert_eq!(tracker.online_count_in("general"), 2);
    }

    #[test]
    fn admin_count_moves_only_on_admin_transitions() {
        let (_m, tracker) = tracker_with_room();
        assert_eq!(tracker.online_admin_count(), 0);

        let shift = tracker.connection_opened("alice", true);
        assert_eq!(shift.admin_online, Some(1));
        assert_eq!(tracker.online_admin_count(), 1);

        // A second admin tab changes nothing.
        let shift = tracker.connection_opened("alice", true);
        assert_eq!(shift.admin_online, None);
        assert_eq!(tracker.online_admin_count(), 1);

        tracker.connection_opened("bob", false);
        assert_eq!(tracker.online_admin_count(), 1);

        tracker.connection_closed("alice", true);
        let shift = tracker.connection_closed("alice", true);
        assert_eq!(shift.admin_online, Some(0));
        assert_eq!(tracker.online_admin_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn churned_connections_leave_no_stranded_counts() {
        let (_m, tracker) = tracker_with_room();
        let tracker = Arc::new(tracker);
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let tracker = tracker.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                for _ in 0..250 {
                    tracker.connection_opened("alice", false);
                    tracker.connection_closed("alice", false);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Every open was matched by a close, so nothing lingers...
        assert!(!tracker.is_online("alice"));
        assert_eq!(tracker.online_count_in("general"), 0);

        // ...and a fresh connection is visible again.
        let shift = tracker.connection_opened("alice", false);
        assert_eq!(shift.user_online, Some(true));
        assert_eq!(tracker.online_count_in("general"), 1);
    }

    #[test]
    fn close_without_open_is_a_no_op() {
        let (_m, tracker) = tracker_with_room();
        let shift = tracker.connection_closed("ghost", false);
        assert!(shift.unchanged());
        assert!(!tracker.is_online("ghost"));
    }

    #[test]
    fn membership_changes_adjust_online_counts() {
        let (memberships, tracker) = tracker_with_room();
        tracker.connection_opened("dave", false);
        assert_eq!(tracker.online_count_in("general"), 0);

        memberships.add_member("general", "dave", 1);
        tracker.member_joined("general", "dave");
        assert_eq!(tracker.online_count_in("general"), 1);

        memberships.remove_member("general", "dave");
        tracker.member_left("general", "dave");
        assert_eq!(tracker.online_count_in("general"), 0);
    }
}
