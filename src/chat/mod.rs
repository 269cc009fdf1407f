//! Chat: the durable history surface. Posting happens over the WebSocket.

pub mod history;
