//! Registered group queries.

use super::db::{Database, DatabaseError};
use super::models::{GroupRow, RegisteredGroup};

impl Database {
    /// Insert or replace a group registration, keyed by folder.
    ///
    /// Re-registering a folder keeps its original `added_at`.
    pub async fn upsert_group(&self, group: &RegisteredGroup) -> Result<(), DatabaseError> {
        let container_config = if group.container_config.is_default() {
            None
        } else {
            Some(
                serde_json::to_string(&group.container_config)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?,
            )
        };

        sqlx::query(
            r"
            INSERT INTO registered_groups
                (folder, jid, name, trigger_pattern, requires_trigger, container_config, added_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(folder) DO UPDATE SET
                jid = excluded.jid,
                name = excluded.name,
                trigger_pattern = excluded.trigger_pattern,
                requires_trigger = excluded.requires_trigger,
                container_config = excluded.container_config
            ",
        )
        .bind(&group.folder)
        .bind(&group.jid)
        .bind(&group.name)
        .bind(&group.trigger_pattern)
        .bind(group.requires_trigger)
        .bind(container_config)
        .bind(group.added_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Get a group by folder.
    pub async fn get_group(&self, folder: &str) -> Result<RegisteredGroup, DatabaseError> {
        let row = sqlx::query_as::<_, GroupRow>("SELECT * FROM registered_groups WHERE folder = ?")
            .bind(folder)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Group {folder}")))?;

        Ok(row.into_group())
    }

    /// All registered groups, oldest registration first.
    pub async fn list_groups(&self) -> Result<Vec<RegisteredGroup>, DatabaseError> {
        let rows = sqlx::query_as::<_, GroupRow>(
            "SELECT * FROM registered_groups ORDER BY added_at ASC, folder ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(GroupRow::into_group).collect())
    }
}
