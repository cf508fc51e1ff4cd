//! `SQLite` storage for the `Nestbox` daemon.
//!
//! Provides persistence for chats, message history, registered groups,
//! per-group cursors and scheduled tasks.

mod db;
mod groups;
mod models;
mod queries;
mod tasks;

pub use db::{Database, DatabaseError};
pub use models::*;
