//! Rooms: the membership index, CRUD and membership REST surface,
//! invitations, and the deletion lifecycle.

pub mod crud;
pub mod invites;
pub mod lifecycle;
pub mod membership;
