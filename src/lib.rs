//! Agora realtime messaging server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod moderation;
pub mod realtime;
pub mod rooms;
pub mod routes;
pub mod social;
pub mod state;
pub mod tickets;
pub mod ws;
