//! PostgreSQL implementation of HistoryStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via the instance's history length
//! - Efficient task claiming with SKIP LOCKED
//! - JSONB history events for replay

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::workflow::{ActivityOptions, HistoryEvent, HistoryRecord, WorkflowError};

/// PostgreSQL implementation of HistoryStore
///
/// Uses a connection pool for efficient database access. Run
/// [`PostgresHistoryStore::migrate`] once before use to create the schema.
///
/// # Example
///
/// ```ignore
/// use agentflow_durable::PostgresHistoryStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresHistoryStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresHistoryStore {
    pool: PgPool,
}

impl PostgresHistoryStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and create a store
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(database("connect"))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn database(op: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        error!(op, "database operation failed: {}", e);
        StoreError::Database(e.to_string())
    }
}

fn instance_from_row(row: &PgRow) -> Result<WorkflowInstance, StoreError> {
    let status: String = row.get("status");
    let error: Option<serde_json::Value> = row.get("error");

    Ok(WorkflowInstance {
        id: row.get("id"),
        workflow_type: row.get("workflow_type"),
        input: row.get("input"),
        status: status.parse()?,
        output: row.get("output"),
        error: error.map(serde_json::from_value::<WorkflowError>).transpose()?,
        history_len: row.get("history_len"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn task_from_row(row: &PgRow) -> Result<ActivityTask, StoreError> {
    let status: String = row.get("status");
    let options: serde_json::Value = row.get("options");
    let last_error: Option<serde_json::Value> = row.get("last_error");

    Ok(ActivityTask {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        activity_id: row.get("activity_id"),
        activity_type: row.get("activity_type"),
        input: row.get("input"),
        options: serde_json::from_value::<ActivityOptions>(options)?,
        status: status.parse()?,
        attempt: row.get::<i32, _>("attempt") as u32,
        last_error: last_error
            .map(serde_json::from_value::<ActivityError>)
            .transpose()?,
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get("claimed_at"),
        available_at: row.get("available_at"),
        created_at: row.get("created_at"),
    })
}

const INSTANCE_COLUMNS: &str =
    "id, workflow_type, input, status, output, error, history_len, created_at, updated_at";

const TASK_COLUMNS: &str = "id, instance_id, activity_id, activity_type, input, options, status, \
     attempt, last_error, claimed_by, claimed_at, available_at, created_at";

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    #[instrument(skip(self, input))]
    async fn create_instance(
        &self,
        instance_id: &str,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<WorkflowInstance, StoreError> {
        let started = HistoryEvent::OrchestratorStarted {
            workflow_type: workflow_type.to_string(),
            input: input.clone(),
        };
        let event_data = serde_json::to_value(&started)?;

        let mut tx = self.pool.begin().await.map_err(database("begin"))?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO durable_instances (id, workflow_type, input, status, history_len)
            VALUES ($1, $2, $3, 'pending', 1)
            ON CONFLICT (id) DO NOTHING
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(instance_id)
        .bind(workflow_type)
        .bind(&input)
        .fetch_optional(&mut *tx)
        .await
        .map_err(database("create_instance"))?
        .ok_or_else(|| StoreError::AlreadyExists(instance_id.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO durable_history (instance_id, sequence_num, event_type, event_data)
            VALUES ($1, 0, $2, $3)
            "#,
        )
        .bind(instance_id)
        .bind(started.type_name())
        .bind(&event_data)
        .execute(&mut *tx)
        .await
        .map_err(database("create_instance"))?;

        tx.commit().await.map_err(database("commit"))?;

        debug!(%instance_id, %workflow_type, "created instance");
        instance_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, instance_id: &str) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM durable_instances WHERE id = $1"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database("get_instance"))?
        .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        instance_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM durable_instances
            WHERE $1::TEXT IS NULL OR status = $1
            ORDER BY created_at
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(database("list_instances"))?;

        rows.iter().map(instance_from_row).collect()
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append_events(
        &self,
        instance_id: &str,
        expected_sequence: i64,
        events: Vec<HistoryEvent>,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database("begin"))?;

        let row = sqlx::query(
            r#"
            SELECT history_len FROM durable_instances
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(database("append_events"))?
        .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        let current_sequence: i64 = row.get("history_len");
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                instance_id: instance_id.to_string(),
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let mut new_sequence = current_sequence;
        for event in events {
            let event_data = serde_json::to_value(&event)?;

            sqlx::query(
                r#"
                INSERT INTO durable_history (instance_id, sequence_num, event_type, event_data)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(instance_id)
            .bind(new_sequence)
            .bind(event.type_name())
            .bind(&event_data)
            .execute(&mut *tx)
            .await
            .map_err(database("append_events"))?;

            new_sequence += 1;
        }

        sqlx::query(
            r#"
            UPDATE durable_instances
            SET history_len = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(new_sequence)
        .execute(&mut *tx)
        .await
        .map_err(database("append_events"))?;

        tx.commit().await.map_err(database("commit"))?;

        debug!(%instance_id, new_sequence, "appended events");
        Ok(new_sequence)
    }

    #[instrument(skip(self))]
    async fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryRecord>, StoreError> {
        // Distinguish an unknown instance from an empty history
        self.get_instance(instance_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT sequence_num, event_data, recorded_at
            FROM durable_history
            WHERE instance_id = $1
            ORDER BY sequence_num
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(database("load_history"))?;

        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            let data: serde_json::Value = row.get("event_data");
            history.push(HistoryRecord {
                sequence: row.get("sequence_num"),
                recorded_at: row.get("recorded_at"),
                event: serde_json::from_value(data)?,
            });
        }

        Ok(history)
    }

    #[instrument(skip(self, output, error))]
    async fn update_status(
        &self,
        instance_id: &str,
        status: WorkflowStatus,
        output: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let error_json = error.map(serde_json::to_value).transpose()?;

        let mut tx = self.pool.begin().await.map_err(database("begin"))?;

        let row = sqlx::query("SELECT status FROM durable_instances WHERE id = $1 FOR UPDATE")
            .bind(instance_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(database("update_status"))?
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        let current: WorkflowStatus = row.get::<String, _>("status").parse()?;
        if !current.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                instance_id: instance_id.to_string(),
                from: current,
                to: status,
            });
        }
        if current.is_terminal() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE durable_instances
            SET status = $2,
                output = COALESCE($3, output),
                error = COALESCE($4, error),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(status.as_str())
        .bind(&output)
        .bind(&error_json)
        .execute(&mut *tx)
        .await
        .map_err(database("update_status"))?;

        tx.commit().await.map_err(database("commit"))?;

        debug!(%instance_id, %status, "updated instance status");
        Ok(())
    }

    #[instrument(skip(self, task), fields(instance_id = %task.instance_id, activity_id = %task.activity_id))]
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let options_json = serde_json::to_value(&task.options)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO durable_tasks (id, instance_id, activity_id, activity_type, input, options)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (instance_id, activity_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&task.instance_id)
        .bind(&task.activity_id)
        .bind(&task.activity_type)
        .bind(&task.input)
        .bind(&options_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(database("enqueue_task"))?;

        if let Some(row) = inserted {
            let task_id: Uuid = row.get("id");
            debug!(%task_id, activity_type = %task.activity_type, "enqueued task");
            return Ok(task_id);
        }

        let row = sqlx::query(
            "SELECT id FROM durable_tasks WHERE instance_id = $1 AND activity_id = $2",
        )
        .bind(&task.instance_id)
        .bind(&task.activity_id)
        .fetch_one(&self.pool)
        .await
        .map_err(database("enqueue_task"))?;

        Ok(row.get("id"))
    }

    #[instrument(skip(self))]
    async fn get_task(&self, task_id: Uuid) -> Result<ActivityTask, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM durable_tasks WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database("get_task"))?
        .ok_or(StoreError::TaskNotFound(task_id))?;

        task_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn claim_tasks(
        &self,
        worker_id: &str,
        max_tasks: usize,
    ) -> Result<Vec<ActivityTask>, StoreError> {
        // Claim the oldest available tasks in one statement; SKIP LOCKED keeps
        // concurrent workers from blocking on each other's rows.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM durable_tasks
                WHERE status = 'scheduled'
                  AND available_at <= NOW()
                ORDER BY available_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE durable_tasks t
            SET status = 'running',
                claimed_by = $2,
                claimed_at = NOW(),
                attempt = attempt + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.instance_id, t.activity_id, t.activity_type, t.input, t.options,
                      t.status, t.attempt, t.last_error, t.claimed_by, t.claimed_at,
                      t.available_at, t.created_at
            "#,
        )
        .bind(max_tasks as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(database("claim_tasks"))?;

        let claimed = rows.iter().map(task_from_row).collect::<Result<Vec<_>, _>>()?;
        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed tasks");
        }

        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn heartbeat_task(&self, task_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE durable_tasks
            SET claimed_at = NOW()
            WHERE id = $1 AND claimed_by = $2 AND status = 'running'
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(database("heartbeat_task"))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, error))]
    async fn retry_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        error: &ActivityError,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let error_json = serde_json::to_value(error)?;

        let result = sqlx::query(
            r#"
            UPDATE durable_tasks
            SET status = 'scheduled',
                claimed_by = NULL,
                claimed_at = NULL,
                last_error = $4,
                available_at = $5
            WHERE id = $1 AND claimed_by = $2 AND attempt = $3 AND status = 'running'
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(attempt as i32)
        .bind(&error_json)
        .bind(available_at)
        .execute(&self.pool)
        .await
        .map_err(database("retry_task"))?;

        if result.rows_affected() == 0 {
            // Claim lost or cancelled mid-attempt, or unknown
            self.get_task(task_id).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE durable_tasks
            SET status = 'completed', claimed_by = NULL
            WHERE id = $1 AND claimed_by = $2 AND attempt = $3 AND status = 'running'
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(attempt as i32)
        .execute(&self.pool)
        .await
        .map_err(database("complete_task"))?;

        if result.rows_affected() == 0 {
            // Claim lost to another attempt, or unknown
            self.get_task(task_id).await?;
            return Ok(());
        }
        debug!(%task_id, "completed task");
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        error: &ActivityError,
    ) -> Result<(), StoreError> {
        let error_json = serde_json::to_value(error)?;

        let result = sqlx::query(
            r#"
            UPDATE durable_tasks
            SET status = 'failed', claimed_by = NULL, last_error = $4
            WHERE id = $1 AND claimed_by = $2 AND attempt = $3 AND status = 'running'
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(attempt as i32)
        .bind(&error_json)
        .execute(&self.pool)
        .await
        .map_err(database("fail_task"))?;

        if result.rows_affected() == 0 {
            self.get_task(task_id).await?;
            return Ok(());
        }
        debug!(%task_id, "failed task");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_instance_tasks(&self, instance_id: &str) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE durable_tasks
            SET status = 'cancelled'
            WHERE instance_id = $1 AND status = 'scheduled'
            RETURNING id
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(database("cancel_instance_tasks"))?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let threshold = chrono::Duration::from_std(stale_threshold)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let cutoff = Utc::now() - threshold;

        let rows = sqlx::query(
            r#"
            UPDATE durable_tasks
            SET status = 'scheduled',
                claimed_by = NULL,
                claimed_at = NULL,
                available_at = NOW()
            WHERE status = 'running'
              AND (claimed_at IS NULL OR claimed_at <= $1)
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(database("reclaim_stale_tasks"))?;

        let reclaimed: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();
        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed stale tasks");
        }

        Ok(reclaimed)
    }

    #[instrument(skip(self))]
    async fn list_tasks(&self, instance_id: &str) -> Result<Vec<ActivityTask>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM durable_tasks WHERE instance_id = $1 ORDER BY created_at"
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(database("list_tasks"))?;

        rows.iter().map(task_from_row).collect()
    }
}
