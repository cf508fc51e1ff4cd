//! Database connection and initialization.

pub use nestbox_core::db::DatabaseError;

nestbox_core::define_database!(Database, "Database migrations complete");
