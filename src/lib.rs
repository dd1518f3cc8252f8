#![forbid(unsafe_code)]

// Echosphere relay library - chat hub and voice signaling relay over WebSocket

pub mod auth;
pub mod config;
pub mod db;
pub mod hub;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod store;
pub mod turn;
