use std::sync::Arc;

use crate::config::RealtimeConfig;
use crate::db::DbPool;
use crate::moderation::visibility::VisibilitySets;
use crate::realtime::fanout::EventRouter;
use crate::realtime::presence::PresenceTracker;
use crate::realtime::registry::ConnectionRegistry;
use crate::realtime::replay::ReplayLog;
use crate::rooms::membership::MembershipIndex;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// AES-256-GCM encryption key for TOTP secrets (256-bit random key)
    pub encryption_key: Vec<u8>,
    /// Room membership index, mirrored from the DB
    pub memberships: Arc<MembershipIndex>,
    /// Presence derived from live connections
    pub presence: Arc<PresenceTracker>,
    /// Live WebSocket connections and their room subscriptions
    pub registry: Arc<ConnectionRegistry>,
    /// Event sequencing, replay, and fan-out
    pub router: Arc<EventRouter>,
    /// Per-user muted-room mirror consulted by fan-out
    pub visibility: Arc<VisibilitySets>,
    /// Realtime tuning knobs
    pub realtime: RealtimeConfig,
}

impl AppState {
    /// Wire up the realtime core over an initialized database. Loads the
    /// membership and muted-room mirrors, then assembles the component graph
    /// in dependency order.
    pub fn build(
        db: DbPool,
        jwt_secret: Vec<u8>,
        encryption_key: Vec<u8>,
        realtime: RealtimeConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let memberships = Arc::new(MembershipIndex::load_from_db(&db)?);
        let visibility = Arc::new(VisibilitySets::load_from_db(&db)?);
        let presence = Arc::new(PresenceTracker::new(memberships.clone()));
        let registry = Arc::new(ConnectionRegistry::new(
            presence.clone(),
            realtime.outbound_queue_capacity,
        ));
        let router = Arc::new(EventRouter::new(
            registry.clone(),
            memberships.clone(),
            visibility.clone(),
            ReplayLog::new(db.clone(), realtime.replay_retention),
        ));

        Ok(Self {
            db,
            jwt_secret,
            encryption_key,
            memberships,
            presence,
            registry,
            router,
            visibility,
            realtime,
        })
    }
}
