//! The realtime core: connection registry, presence tracking, event
//! sequencing/replay, and fan-out.

pub mod event;
pub mod fanout;
pub mod presence;
pub mod registry;
pub mod replay;
