//! Scheduled task queries.

use nestbox_core::db::unix_timestamp_ms;

use super::db::{Database, DatabaseError};
use super::models::{NewTask, ScheduledTask, TaskRunLog, TaskStatus};

impl Database {
    /// Store a new active task.
    pub async fn create_task(&self, task: &NewTask) -> Result<ScheduledTask, DatabaseError> {
        let now = unix_timestamp_ms();

        sqlx::query(
            r"
            INSERT INTO scheduled_tasks
                (id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                 context_mode, next_run, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)
            ",
        )
        .bind(&task.id)
        .bind(&task.group_folder)
        .bind(&task.chat_jid)
        .bind(&task.prompt)
        .bind(task.schedule_type.as_str())
        .bind(&task.schedule_value)
        .bind(task.context_mode.as_str())
        .bind(task.next_run)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_task(&task.id).await
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: &str) -> Result<ScheduledTask, DatabaseError> {
        sqlx::query_as::<_, ScheduledTask>("SELECT * FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Task {id}")))
    }

    /// Tasks of one group, or of every group when `group_folder` is `None`.
    pub async fn list_tasks(
        &self,
        group_folder: Option<&str>,
    ) -> Result<Vec<ScheduledTask>, DatabaseError> {
        let tasks = if let Some(folder) = group_folder {
            sqlx::query_as::<_, ScheduledTask>(
                "SELECT * FROM scheduled_tasks WHERE group_folder = ? ORDER BY created_at ASC, id ASC",
            )
            .bind(folder)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, ScheduledTask>(
                "SELECT * FROM scheduled_tasks ORDER BY created_at ASC, id ASC",
            )
            .fetch_all(self.pool())
            .await?
        };

        Ok(tasks)
    }

    /// Change a task's status.
    pub async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE scheduled_tasks SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Task {id}")));
        }

        Ok(())
    }

    /// Delete a task together with its run history.
    pub async fn delete_task(&self, id: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Task {id}")));
        }

        Ok(())
    }

    /// Active tasks whose next run is at or before `now`, earliest first.
    pub async fn due_tasks(&self, now: i64) -> Result<Vec<ScheduledTask>, DatabaseError> {
        let tasks = sqlx::query_as::<_, ScheduledTask>(
            r"
            SELECT * FROM scheduled_tasks
            WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?
            ORDER BY next_run ASC
            ",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;

        Ok(tasks)
    }

    /// Record the outcome of a run and move the task to its next slot.
    ///
    /// `next_run = None` completes the task.
    pub async fn record_task_run(
        &self,
        id: &str,
        run_at: i64,
        next_run: Option<i64>,
        last_result: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            UPDATE scheduled_tasks SET
                last_run = ?,
                last_result = ?,
                next_run = ?,
                status = CASE WHEN ? IS NULL THEN 'completed' ELSE status END
            WHERE id = ?
            ",
        )
        .bind(run_at)
        .bind(last_result)
        .bind(next_run)
        .bind(next_run)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Append one entry to a task's run history.
    pub async fn log_task_run(
        &self,
        task_id: &str,
        run_at: i64,
        duration_ms: i64,
        status: &str,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(task_id)
        .bind(run_at)
        .bind(duration_ms)
        .bind(status)
        .bind(result)
        .bind(error)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Run history of a task, oldest first.
    pub async fn task_run_logs(&self, task_id: &str) -> Result<Vec<TaskRunLog>, DatabaseError> {
        let logs = sqlx::query_as::<_, TaskRunLog>(
            "SELECT * FROM task_run_logs WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;

        Ok(logs)
    }
}
