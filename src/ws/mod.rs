//! WebSocket transport: upgrade/auth, actor-per-connection, JSON frames.

pub mod actor;
pub mod handler;
pub mod protocol;
