//! Per-group cursor table.
//!
//! Each group's cursor sits behind its own async mutex. Whoever holds the
//! guard owns every decision that depends on the cursor: fetching new
//! messages, piping them into a live execution, advancing, rolling back.
//! Writes hit the store before memory, so a store failure leaves both at the
//! old value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::storage::{Database, DatabaseError};

pub struct CursorTable {
    db: Database,
    cells: Mutex<HashMap<String, Arc<AsyncMutex<i64>>>>,
}

impl CursorTable {
    /// Load every persisted cursor.
    pub async fn load(db: Database) -> Result<Self, DatabaseError> {
        let cells = db
            .all_cursors()
            .await?
            .into_iter()
            .map(|(folder, ts)| (folder, Arc::new(AsyncMutex::new(ts))))
            .collect();
        Ok(Self {
            db,
            cells: Mutex::new(cells),
        })
    }

    fn cell(&self, folder: &str) -> Arc<AsyncMutex<i64>> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            cells
                .entry(folder.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(0))),
        )
    }

    /// Take exclusive ownership of `folder`'s cursor.
    pub async fn lock(&self, folder: &str) -> CursorGuard {
        CursorGuard {
            db: self.db.clone(),
            folder: folder.to_string(),
            value: self.cell(folder).lock_owned().await,
        }
    }

    /// Current value; waits for any holder to finish.
    pub async fn get(&self, folder: &str) -> i64 {
        *self.cell(folder).lock().await
    }
}

/// Exclusive access to one group's cursor.
pub struct CursorGuard {
    db: Database,
    folder: String,
    value: OwnedMutexGuard<i64>,
}

impl CursorGuard {
    pub fn value(&self) -> i64 {
        *self.value
    }

    /// Move forward to `timestamp`; never moves backwards.
    pub async fn advance(&mut self, timestamp: i64) -> Result<(), DatabaseError> {
        if timestamp > *self.value {
            self.set(timestamp).await?;
        }
        Ok(())
    }

    /// Set unconditionally, used to roll back.
    pub async fn set(&mut self, timestamp: i64) -> Result<(), DatabaseError> {
        self.db.set_cursor(&self.folder, timestamp).await?;
        *self.value = timestamp;
        Ok(())
    }
}
