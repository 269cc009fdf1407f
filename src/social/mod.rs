//! Social graph: friend requests and the direct chats they open.

pub mod friends;
