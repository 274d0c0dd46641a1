//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `stepwave-core` using sqlx with split
//! read/write pools. Step definitions are stored as JSON blobs; instances and
//! step entries keep their structured fields (wave table, history, output)
//! as JSON text columns.
//!
//! Conditional writes (step transitions, instance finish) read and update
//! inside one transaction on the single-connection writer pool, so the
//! check-then-write is atomic with respect to every other writer.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use sqlx::Row;
use stepwave_core::repository::workflow::{StepUpdate, WorkflowRepository};
use stepwave_types::error::RepositoryError;
use stepwave_types::workflow::{
    InstanceStatus, StatusHistoryEntry, StepDefinition, StepEntry, StepStatus, WorkflowInstance,
    push_history,
};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct InstanceRow {
    id: String,
    template_id: String,
    internal_json: String,
    waves: String,
    status: String,
    workflow_broken: i64,
    skipped_orders: String,
    heartbeat_at: Option<String>,
    heartbeat_active: i64,
    status_history: String,
    created_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            template_id: row.try_get("template_id")?,
            internal_json: row.try_get("internal_json")?,
            waves: row.try_get("waves")?,
            status: row.try_get("status")?,
            workflow_broken: row.try_get("workflow_broken")?,
            skipped_orders: row.try_get("skipped_orders")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            heartbeat_active: row.try_get("heartbeat_active")?,
            status_history: row.try_get("status_history")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            template_id: self.template_id,
            internal_json: parse_json(&self.internal_json, "internal_json")?,
            waves: parse_json(&self.waves, "waves")?,
            status: parse_label(&self.status, "instance status")?,
            workflow_broken: self.workflow_broken != 0,
            skipped_orders: parse_json(&self.skipped_orders, "skipped_orders")?,
            heartbeat_at: self.heartbeat_at.as_deref().map(parse_datetime).transpose()?,
            heartbeat_active: self.heartbeat_active != 0,
            status_history: parse_json(&self.status_history, "status_history")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    id: String,
    instance_id: String,
    step_order: i64,
    slot_key: String,
    definition_id: String,
    status: String,
    run_mode: String,
    retry_count: i64,
    retry_at: Option<String>,
    heartbeat_at: Option<String>,
    heartbeat_active: i64,
    output: Option<String>,
    error: Option<String>,
    status_history: String,
    created_at: String,
    updated_at: String,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            step_order: row.try_get("step_order")?,
            slot_key: row.try_get("slot_key")?,
            definition_id: row.try_get("definition_id")?,
            status: row.try_get("status")?,
            run_mode: row.try_get("run_mode")?,
            retry_count: row.try_get("retry_count")?,
            retry_at: row.try_get("retry_at")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            heartbeat_active: row.try_get("heartbeat_active")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            status_history: row.try_get("status_history")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_step(self) -> Result<StepEntry, RepositoryError> {
        Ok(StepEntry {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            order: u32::try_from(self.step_order)
                .map_err(|_| RepositoryError::Query(format!("invalid step order: {}", self.step_order)))?,
            slot_key: self.slot_key,
            definition_id: self.definition_id,
            status: parse_label(&self.status, "step status")?,
            run_mode: parse_label(&self.run_mode, "run mode")?,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            retry_at: self.retry_at.as_deref().map(parse_datetime).transpose()?,
            heartbeat_at: self.heartbeat_at.as_deref().map(parse_datetime).transpose()?,
            heartbeat_active: self.heartbeat_active != 0,
            output: self
                .output
                .as_deref()
                .map(|s| parse_json(s, "step output"))
                .transpose()?,
            error: self.error,
            status_history: parse_json(&self.status_history, "status_history")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as TEXT.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

/// Parse a serde-named enum stored as its bare label.
fn parse_label<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn collect_steps(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<StepEntry>, RepositoryError> {
    let mut steps = Vec::with_capacity(rows.len());
    for row in rows {
        let r = StepRow::from_row(row).map_err(query_err)?;
        steps.push(r.into_step()?);
    }
    Ok(steps)
}

fn collect_instances(
    rows: &[sqlx::sqlite::SqliteRow],
) -> Result<Vec<WorkflowInstance>, RepositoryError> {
    let mut instances = Vec::with_capacity(rows.len());
    for row in rows {
        let r = InstanceRow::from_row(row).map_err(query_err)?;
        instances.push(r.into_instance()?);
    }
    Ok(instances)
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &StepDefinition) -> Result<(), RepositoryError> {
        let definition_json = to_json(def)?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO step_definitions (id, name, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&def.id)
        .bind(&def.name)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<StepDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM step_definitions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let definition: String = row.try_get("definition").map_err(query_err)?;
                Ok(Some(parse_json(&definition, "step definition")?))
            }
            None => Ok(None),
        }
    }

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, template_id, internal_json, waves, status, workflow_broken, skipped_orders,
                heartbeat_at, heartbeat_active, status_history, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.template_id)
        .bind(to_json(&instance.internal_json)?)
        .bind(to_json(&instance.waves)?)
        .bind(instance.status.as_str())
        .bind(instance.workflow_broken)
        .bind(to_json(&instance.skipped_orders)?)
        .bind(instance.heartbeat_at.as_ref().map(format_datetime))
        .bind(instance.heartbeat_active)
        .bind(to_json(&instance.status_history)?)
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.message().contains("UNIQUE") {
                    return RepositoryError::Conflict(format!(
                        "instance {} already exists",
                        instance.id
                    ));
                }
            }
            query_err(e)
        })?;

        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_instances WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        collect_instances(&rows)
    }

    async fn finish_instance(
        &self,
        id: &Uuid,
        status: InstanceStatus,
        message: &str,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT status, status_history FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?;

        let current: String = row.try_get("status").map_err(query_err)?;
        if current != InstanceStatus::Running.as_str() {
            return Ok(false);
        }

        let history_json: String = row.try_get("status_history").map_err(query_err)?;
        let mut history: Vec<StatusHistoryEntry> = parse_json(&history_json, "status_history")?;
        let now = Utc::now();
        push_history(&mut history, status.as_str(), message, now);

        sqlx::query(
            r#"UPDATE workflow_instances
               SET status = ?, heartbeat_active = 0, status_history = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(to_json(&history)?)
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }

    async fn mark_instance_broken(&self, id: &Uuid, message: &str) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT status, status_history FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?;

        let current: String = row.try_get("status").map_err(query_err)?;
        let history_json: String = row.try_get("status_history").map_err(query_err)?;
        let mut history: Vec<StatusHistoryEntry> = parse_json(&history_json, "status_history")?;
        let now = Utc::now();
        push_history(&mut history, &current, message, now);

        sqlx::query(
            r#"UPDATE workflow_instances
               SET workflow_broken = 1, status_history = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(to_json(&history)?)
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn update_skipped_orders(
        &self,
        id: &Uuid,
        add: &[u32],
        remove: &[u32],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let stored: String =
            sqlx::query_scalar("SELECT skipped_orders FROM workflow_instances WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_err)?
                .ok_or(RepositoryError::NotFound)?;

        let mut skipped: BTreeSet<u32> = parse_json(&stored, "skipped_orders")?;
        skipped.extend(add.iter().copied());
        for order in remove {
            skipped.remove(order);
        }

        sqlx::query("UPDATE workflow_instances SET skipped_orders = ?, updated_at = ? WHERE id = ?")
            .bind(to_json(&skipped)?)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn touch_instance_heartbeat(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_instances SET heartbeat_at = ? WHERE id = ? AND heartbeat_active = 1",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_instance_heartbeat_active(
        &self,
        id: &Uuid,
        active: bool,
    ) -> Result<(), RepositoryError> {
        let result = if active {
            sqlx::query(
                "UPDATE workflow_instances SET heartbeat_active = 1, heartbeat_at = ? WHERE id = ?",
            )
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
        } else {
            sqlx::query("UPDATE workflow_instances SET heartbeat_active = 0 WHERE id = ?")
                .bind(id.to_string())
                .execute(&self.pool.writer)
                .await
        }
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_stale_instances(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_instances
               WHERE status = 'running' AND COALESCE(heartbeat_at, updated_at) < ?
               ORDER BY created_at ASC"#,
        )
        .bind(format_datetime(&cutoff))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        collect_instances(&rows)
    }

    async fn insert_steps(&self, steps: &[StepEntry]) -> Result<usize, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        let mut inserted = 0;

        for step in steps {
            let result = sqlx::query(
                r#"INSERT INTO workflow_steps
                   (id, instance_id, step_order, slot_key, definition_id, status, run_mode,
                    retry_count, retry_at, heartbeat_at, heartbeat_active, output, error,
                    status_history, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT(instance_id, step_order, slot_key) DO NOTHING"#,
            )
            .bind(step.id.to_string())
            .bind(step.instance_id.to_string())
            .bind(i64::from(step.order))
            .bind(&step.slot_key)
            .bind(&step.definition_id)
            .bind(step.status.as_str())
            .bind(step.run_mode.as_str())
            .bind(i64::from(step.retry_count))
            .bind(step.retry_at.as_ref().map(format_datetime))
            .bind(step.heartbeat_at.as_ref().map(format_datetime))
            .bind(step.heartbeat_active)
            .bind(step.output.as_ref().map(to_json).transpose()?)
            .bind(&step.error)
            .bind(to_json(&step.status_history)?)
            .bind(format_datetime(&step.created_at))
            .bind(format_datetime(&step.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

            inserted += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(inserted)
    }

    async fn get_step(&self, id: &Uuid) -> Result<Option<StepEntry>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_steps WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = StepRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_step()?))
            }
            None => Ok(None),
        }
    }

    async fn list_steps(&self, instance_id: &Uuid) -> Result<Vec<StepEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_steps WHERE instance_id = ? ORDER BY step_order ASC, slot_key ASC",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        collect_steps(&rows)
    }

    async fn transition_step(
        &self,
        id: &Uuid,
        from: &[StepStatus],
        update: &StepUpdate,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT status, status_history FROM workflow_steps WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?;

        let current: String = row.try_get("status").map_err(query_err)?;
        let current: StepStatus = parse_label(&current, "step status")?;
        if !from.contains(&current) {
            return Ok(false);
        }

        let history_json: String = row.try_get("status_history").map_err(query_err)?;
        let mut history: Vec<StatusHistoryEntry> = parse_json(&history_json, "status_history")?;
        let now = Utc::now();
        push_history(&mut history, update.status.as_str(), update.message.clone(), now);

        sqlx::query(
            r#"UPDATE workflow_steps
               SET status = ?,
                   status_history = ?,
                   output = COALESCE(?, output),
                   error = COALESCE(?, error),
                   retry_at = ?,
                   retry_count = retry_count + ?,
                   updated_at = ?
               WHERE id = ?"#,
        )
        .bind(update.status.as_str())
        .bind(to_json(&history)?)
        .bind(update.output.as_ref().map(to_json).transpose()?)
        .bind(&update.error)
        .bind(update.retry_at.as_ref().map(format_datetime))
        .bind(i64::from(update.increment_retry))
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }

    async fn touch_step_heartbeat(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_steps SET heartbeat_at = ? WHERE id = ? AND heartbeat_active = 1",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_step_heartbeat_active(&self, id: &Uuid, active: bool) -> Result<(), RepositoryError> {
        let result = if active {
            sqlx::query(
                "UPDATE workflow_steps SET heartbeat_active = 1, heartbeat_at = ? WHERE id = ?",
            )
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
        } else {
            sqlx::query("UPDATE workflow_steps SET heartbeat_active = 0 WHERE id = ?")
                .bind(id.to_string())
                .execute(&self.pool.writer)
                .await
        }
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_stale_steps(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StepEntry>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_steps
               WHERE status IN ('initializing', 'executing', 'finalizing')
                 AND COALESCE(heartbeat_at, updated_at) < ?
               ORDER BY step_order ASC, slot_key ASC"#,
        )
        .bind(format_datetime(&cutoff))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        collect_steps(&rows)
    }
}
