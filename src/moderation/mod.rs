//! Moderation: the permission gate, actions with side effects, and per-user
//! visibility (hidden items, muted rooms).

pub mod actions;
pub mod gate;
pub mod visibility;
