//! Database access layer
//!
//! SQLite-backed implementation of the engine's storage contract:
//! guild snapshots, play history, and per-user likes.

pub mod init;
pub mod store;

pub use init::{connect_database, connect_in_memory};
pub use store::SqliteStateStore;
