//! devroom-server: collaborative project rooms with an AI teammate.
//!
//! - [`gate`]: session tokens and the revocation denylist
//! - [`bus`]: one realtime channel per project
//! - [`coordinator`]: chat → AI directive → file tree → sandbox glue
//! - [`store`]: SQLite backing store for file trees
//! - [`web`]: WebSocket and REST transport
//! - [`server`]: wiring from [`config::ServerConfig`]

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod gate;
pub mod msgid;
pub mod server;
pub mod store;
pub mod web;
