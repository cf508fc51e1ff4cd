//! `Nestbox` Core Library
//!
//! Shared functionality for the Nestbox host and its sandboxed agents:
//! - Execution protocol: input document, delimited output parser
//! - Command Bus wire types and atomic file publishing
//! - Schedule expressions for recurring tasks
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod ipc;
pub mod protocol;
pub mod schedule;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
