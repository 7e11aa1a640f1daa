use super::{
    error::Result, error::StorageError, params::InvocationStartParams, ExecutionLog,
    ScheduledFlow, TaskStatus, TimerInfo,
};
use crate::core::{hash_params, serialize_value, Invocation, InvocationStatus, StepKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Default pool size for SQLite connection pool.
const DEFAULT_POOL_SIZE: u32 = 10;

/// Default connection timeout in seconds.
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

const INVOCATION_COLUMNS: &str = "id, step, timestamp, kind, name, status, attempts, parameters, \
     params_hash, return_value, retry_policy, fire_at, await_key";

const FLOW_COLUMNS: &str = "task_id, flow_id, flow_type, business_key, flow_data, status, \
     locked_by, created_at, updated_at, retry_count, error_message, scheduled_for, deadline, \
     parent_flow_id, signal_token";

/// Configuration for the SQLite connection pool.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_size: u32,
    /// Minimum number of idle connections to maintain.
    pub min_idle: Option<u32>,
    /// Maximum time to wait for a connection from the pool.
    pub connection_timeout: Duration,
    /// Maximum lifetime of a connection.
    pub max_lifetime: Option<Duration>,
    /// Idle timeout for connections.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            min_idle: Some(2),
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            max_lifetime: None,
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// SQLite-based execution log with connection pooling.
///
/// Timestamps are stored as milliseconds since the epoch. Claims that must
/// have exactly one winner (dequeue, timer claim, signal consumption, child
/// completion) are single conditional statements or transactions.
pub struct SqliteExecutionLog {
    pool: SqlitePool,
    db_path: String,
}

impl SqliteExecutionLog {
    /// Creates a new SQLite execution log with the specified database path.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(db_path, PoolConfig::default()).await
    }

    /// Creates a new SQLite execution log with custom pool configuration.
    pub async fn with_config(db_path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path_str))
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = Self::build_pool(connect_options, &config).await?;

        let log = Self {
            pool,
            db_path: db_path_str,
        };

        log.initialize().await?;
        info!("Opened execution log at {}", log.db_path);

        Ok(log)
    }

    /// Creates an in-memory SQLite execution log.
    ///
    /// Every pooled connection to `:memory:` would open its own empty
    /// database, so the pool is pinned to one connection that never expires.
    pub async fn in_memory() -> Result<Self> {
        let config = PoolConfig {
            max_size: 1,
            min_idle: Some(1),
            max_lifetime: None,
            idle_timeout: None,
            ..PoolConfig::default()
        };

        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .journal_mode(SqliteJournalMode::Memory)
            .synchronous(SqliteSynchronous::Normal);

        let pool = Self::build_pool(connect_options, &config).await?;

        let log = Self {
            pool,
            db_path: ":memory:".to_string(),
        };

        log.initialize().await?;

        Ok(log)
    }

    async fn build_pool(
        connect_options: SqliteConnectOptions,
        config: &PoolConfig,
    ) -> Result<Pool<Sqlite>> {
        let mut builder = SqlitePoolOptions::new()
            .max_connections(config.max_size)
            .acquire_timeout(config.connection_timeout)
            .max_lifetime(config.max_lifetime)
            .idle_timeout(config.idle_timeout);

        if let Some(min_idle) = config.min_idle {
            builder = builder.min_connections(min_idle);
        }

        let pool = builder
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(pool)
    }

    /// Initialize the database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS execution_log (
                id TEXT NOT NULL,
                step INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                kind TEXT CHECK( kind IN
                    ('FLOW','ACTIVITY','TIMER','SIGNAL','CHILD_FLOW') ) NOT NULL,
                name TEXT NOT NULL,
                status TEXT CHECK( status IN
                    ('PENDING','WAITING_FOR_SIGNAL','WAITING_FOR_TIMER','COMPLETE') ) NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                parameters BLOB,
                params_hash INTEGER NOT NULL DEFAULT 0,
                return_value BLOB,
                retry_policy TEXT,
                fire_at INTEGER,
                await_key TEXT,
                PRIMARY KEY (id, step)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_execution_log_timers ON execution_log(status, fire_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS flow_queue (
                task_id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL UNIQUE,
                flow_type TEXT NOT NULL,
                business_key TEXT NOT NULL,
                flow_data BLOB NOT NULL,
                status TEXT CHECK( status IN
                    ('PENDING','RUNNING','SUSPENDED','COMPLETE','FAILED') ) NOT NULL,
                locked_by TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                scheduled_for INTEGER,
                deadline INTEGER,
                parent_flow_id TEXT,
                signal_token TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_flow_queue_status ON flow_queue(status, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS signal_inbox (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                flow_id TEXT NOT NULL,
                name TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_signal_inbox_flow ON signal_inbox(flow_id, name, seq)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns the database path.
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// Returns the current pool size.
    pub fn pool_size(&self) -> u32 {
        self.pool.size()
    }

    fn parse_uuid(value: &str) -> Result<Uuid> {
        Uuid::parse_str(value).map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn from_millis(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn row_to_scheduled_flow(row: &sqlx::sqlite::SqliteRow) -> Result<ScheduledFlow> {
        let task_id = Self::parse_uuid(&row.try_get::<String, _>("task_id")?)?;
        let flow_id = Self::parse_uuid(&row.try_get::<String, _>("flow_id")?)?;

        let status_str: String = row.try_get("status")?;
        let status = status_str
            .parse::<TaskStatus>()
            .map_err(StorageError::Connection)?;

        let parent_flow_id: Option<String> = row.try_get("parent_flow_id")?;
        let parent_flow_id = parent_flow_id
            .map(|s| Self::parse_uuid(&s))
            .transpose()?;

        let retry_count: i64 = row.try_get("retry_count")?;

        Ok(ScheduledFlow {
            task_id,
            flow_id,
            flow_type: row.try_get("flow_type")?,
            business_key: row.try_get("business_key")?,
            flow_data: row.try_get("flow_data")?,
            status,
            locked_by: row.try_get("locked_by")?,
            created_at: Self::from_millis(row.try_get("created_at")?),
            updated_at: Self::from_millis(row.try_get("updated_at")?),
            retry_count: retry_count as u32,
            error_message: row.try_get("error_message")?,
            scheduled_for: row
                .try_get::<Option<i64>, _>("scheduled_for")?
                .map(Self::from_millis),
            deadline: row
                .try_get::<Option<i64>, _>("deadline")?
                .map(Self::from_millis),
            parent_flow_id,
            signal_token: row.try_get("signal_token")?,
        })
    }

    fn row_to_invocation(row: &sqlx::sqlite::SqliteRow) -> Result<Invocation> {
        let id = Self::parse_uuid(&row.try_get::<String, _>("id")?)?;
        let step: i32 = row.try_get("step")?;
        let timestamp = Self::from_millis(row.try_get("timestamp")?);

        let kind_str: String = row.try_get("kind")?;
        let kind = StepKind::from_str(&kind_str)?;
        let status_str: String = row.try_get("status")?;
        let status = InvocationStatus::from_str(&status_str)?;

        let attempts: i32 = row.try_get("attempts")?;
        let parameters: Option<Vec<u8>> = row.try_get("parameters")?;
        let params_hash: i64 = row.try_get("params_hash")?;
        let return_value: Option<Vec<u8>> = row.try_get("return_value")?;

        let retry_policy_json: Option<String> = row.try_get("retry_policy")?;
        let retry_policy = retry_policy_json.and_then(|json| serde_json::from_str(&json).ok());

        let fire_at: Option<i64> = row.try_get("fire_at")?;
        let await_key: Option<String> = row.try_get("await_key")?;

        let mut invocation = Invocation::new(
            id,
            step,
            timestamp,
            kind,
            row.try_get("name")?,
            status,
            attempts,
            parameters.unwrap_or_default(),
            params_hash as u64,
            retry_policy,
        );
        if let Some(value) = return_value {
            invocation.set_return_value(value);
        }
        invocation.set_fire_at(fire_at.map(Self::from_millis));
        invocation.set_await_key(await_key);

        Ok(invocation)
    }

    async fn fetch_invocation(&self, id: Uuid, step: i32) -> Result<Option<Invocation>> {
        sqlx::query(&format!(
            "SELECT {} FROM execution_log WHERE id = ? AND step = ?",
            INVOCATION_COLUMNS
        ))
        .bind(id.to_string())
        .bind(step)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| Self::row_to_invocation(&row))
        .transpose()
    }
}

#[async_trait]
impl ExecutionLog for SqliteExecutionLog {
    async fn log_invocation_start(&self, params: InvocationStartParams<'_>) -> Result<()> {
        let InvocationStartParams {
            id,
            step,
            kind,
            name,
            status,
            parameters,
            retry_policy,
        } = params;

        let params_hash = hash_params(parameters);
        let retry_policy_json = retry_policy.and_then(|p| serde_json::to_string(&p).ok());

        sqlx::query(
            "INSERT INTO execution_log
                 (id, step, timestamp, kind, name, status, attempts,
                  parameters, params_hash, retry_policy)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
             ON CONFLICT(id, step)
             DO UPDATE SET attempts = attempts + 1 WHERE status = 'PENDING'",
        )
        .bind(id.to_string())
        .bind(step)
        .bind(Utc::now().timestamp_millis())
        .bind(kind.as_str())
        .bind(name)
        .bind(status.as_str())
        .bind(parameters)
        .bind(params_hash as i64)
        .bind(retry_policy_json)
        .execute(&self.pool)
        .await?;

        debug!(
            "Logged invocation start: id={}, step={}, kind={}, name={}, params_hash={}",
            id, step, kind, name, params_hash
        );

        Ok(())
    }

    async fn log_invocation_completion(
        &self,
        id: Uuid,
        step: i32,
        return_value: &[u8],
    ) -> Result<Invocation> {
        sqlx::query(
            "UPDATE execution_log
             SET status = 'COMPLETE', return_value = ?
             WHERE id = ? AND step = ?",
        )
        .bind(return_value)
        .bind(id.to_string())
        .bind(step)
        .execute(&self.pool)
        .await?;

        let invocation = self
            .fetch_invocation(id, step)
            .await?
            .ok_or(StorageError::InvocationNotFound { id, step })?;

        debug!("Logged invocation completion: id={}, step={}", id, step);

        Ok(invocation)
    }

    async fn get_invocation(&self, id: Uuid, step: i32) -> Result<Option<Invocation>> {
        self.fetch_invocation(id, step).await
    }

    async fn get_invocations_for_flow(&self, id: Uuid) -> Result<Vec<Invocation>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM execution_log WHERE id = ? ORDER BY step ASC",
            INVOCATION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_invocation).collect()
    }

    async fn log_timer(
        &self,
        flow_id: Uuid,
        step: i32,
        fire_at: DateTime<Utc>,
        timer_name: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE execution_log
             SET status = 'WAITING_FOR_TIMER', fire_at = ?, await_key = ?
             WHERE id = ? AND step = ?",
        )
        .bind(fire_at.timestamp_millis())
        .bind(timer_name)
        .bind(flow_id.to_string())
        .bind(step)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::InvocationNotFound { id: flow_id, step });
        }
        Ok(())
    }

    async fn get_expired_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerInfo>> {
        let rows = sqlx::query(
            "SELECT id, step, fire_at, await_key
             FROM execution_log
             WHERE status = 'WAITING_FOR_TIMER'
               AND fire_at IS NOT NULL
               AND fire_at <= ?
             ORDER BY fire_at ASC
             LIMIT 100",
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TimerInfo {
                    flow_id: Self::parse_uuid(&row.try_get::<String, _>("id")?)?,
                    step: row.try_get("step")?,
                    fire_at: Self::from_millis(row.try_get("fire_at")?),
                    timer_name: row.try_get("await_key")?,
                })
            })
            .collect()
    }

    async fn claim_timer(&self, flow_id: Uuid, step: i32) -> Result<bool> {
        let fired = serialize_value(&())?;

        // Optimistic concurrency: only the claimant that still sees the
        // waiting status updates the row
        let result = sqlx::query(
            "UPDATE execution_log
             SET status = 'COMPLETE', return_value = ?
             WHERE id = ? AND step = ? AND status = 'WAITING_FOR_TIMER'",
        )
        .bind(&fired)
        .bind(flow_id.to_string())
        .bind(step)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn log_signal(&self, flow_id: Uuid, step: i32, await_key: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE execution_log
             SET status = 'WAITING_FOR_SIGNAL', await_key = ?
             WHERE id = ? AND step = ?",
        )
        .bind(await_key)
        .bind(flow_id.to_string())
        .bind(step)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::InvocationNotFound { id: flow_id, step });
        }

        debug!(
            "Logged signal wait: flow_id={}, step={}, await_key={}",
            flow_id, step, await_key
        );
        Ok(())
    }

    async fn push_signal(&self, flow_id: Uuid, name: &str, payload: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO signal_inbox (flow_id, name, payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(flow_id.to_string())
        .bind(name)
        .bind(payload)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!("Queued signal '{}' for flow {}", name, flow_id);
        Ok(())
    }

    async fn consume_signal(
        &self,
        flow_id: Uuid,
        step: i32,
        name: &str,
    ) -> Result<Option<Vec<u8>>> {
        let mut tx = self.pool.begin().await?;

        let step_row = sqlx::query(
            "SELECT status, return_value FROM execution_log WHERE id = ? AND step = ?",
        )
        .bind(flow_id.to_string())
        .bind(step)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StorageError::InvocationNotFound { id: flow_id, step })?;

        let status: String = step_row.try_get("status")?;
        if status == InvocationStatus::Complete.as_str() {
            let recorded: Option<Vec<u8>> = step_row.try_get("return_value")?;
            tx.commit().await?;
            return Ok(recorded);
        }

        let message = sqlx::query(
            "SELECT seq, payload FROM signal_inbox
             WHERE flow_id = ? AND name = ?
             ORDER BY seq ASC
             LIMIT 1",
        )
        .bind(flow_id.to_string())
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(message) = message else {
            tx.commit().await?;
            return Ok(None);
        };

        let seq: i64 = message.try_get("seq")?;
        let payload: Vec<u8> = message.try_get("payload")?;

        sqlx::query("DELETE FROM signal_inbox WHERE seq = ?")
            .bind(seq)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE execution_log
             SET status = 'COMPLETE', return_value = ?
             WHERE id = ? AND step = ?",
        )
        .bind(&payload)
        .bind(flow_id.to_string())
        .bind(step)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            "Consumed signal '{}' for flow {} at step {}",
            name, flow_id, step
        );
        Ok(Some(payload))
    }

    async fn has_pending_signal(&self, flow_id: Uuid, name: &str) -> Result<bool> {
        let pending: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM signal_inbox WHERE flow_id = ? AND name = ?)",
        )
        .bind(flow_id.to_string())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(pending)
    }

    async fn complete_waiting_step(
        &self,
        flow_id: Uuid,
        await_key: &str,
        payload: &[u8],
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE execution_log
             SET status = 'COMPLETE', return_value = ?
             WHERE id = ? AND await_key = ? AND status = 'WAITING_FOR_SIGNAL'",
        )
        .bind(payload)
        .bind(flow_id.to_string())
        .bind(await_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn enqueue_flow(&self, flow: ScheduledFlow) -> Result<Uuid> {
        let task_id = flow.task_id;
        let flow_id = flow.flow_id;
        let flow_type = flow.flow_type.clone();

        let result = sqlx::query(&format!(
            "INSERT INTO flow_queue ({})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(flow_id) DO NOTHING",
            FLOW_COLUMNS
        ))
        .bind(task_id.to_string())
        .bind(flow_id.to_string())
        .bind(flow.flow_type)
        .bind(flow.business_key)
        .bind(flow.flow_data)
        .bind(flow.status.as_str())
        .bind(flow.locked_by)
        .bind(flow.created_at.timestamp_millis())
        .bind(flow.updated_at.timestamp_millis())
        .bind(flow.retry_count as i64)
        .bind(flow.error_message)
        .bind(flow.scheduled_for.map(|dt| dt.timestamp_millis()))
        .bind(flow.deadline.map(|dt| dt.timestamp_millis()))
        .bind(flow.parent_flow_id.map(|id| id.to_string()))
        .bind(flow.signal_token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::DuplicateFlow(flow_id));
        }

        debug!(
            "Enqueued flow: task_id={}, flow_type={}",
            task_id, flow_type
        );
        Ok(task_id)
    }

    async fn dequeue_flow(&self, worker_id: &str) -> Result<Option<ScheduledFlow>> {
        let now = Utc::now().timestamp_millis();

        // Single atomic claim using UPDATE...RETURNING (SQLite 3.35+)
        let flow_opt = sqlx::query(&format!(
            "UPDATE flow_queue
             SET status = 'RUNNING', locked_by = ?1, updated_at = ?2
             WHERE task_id = (
                 SELECT task_id FROM flow_queue
                 WHERE status = 'PENDING'
                   AND (scheduled_for IS NULL OR scheduled_for <= ?2)
                 ORDER BY updated_at ASC
                 LIMIT 1
             )
             RETURNING {}",
            FLOW_COLUMNS
        ))
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| Self::row_to_scheduled_flow(&row))
        .transpose()?;

        if let Some(flow) = &flow_opt {
            debug!(
                "Dequeued flow: task_id={}, flow_type={}, worker={}",
                flow.task_id, flow.flow_type, worker_id
            );
        }

        Ok(flow_opt)
    }

    async fn suspend_flow(&self, task_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE flow_queue
             SET status = 'SUSPENDED', locked_by = NULL, updated_at = ?
             WHERE task_id = ? AND status = 'RUNNING'",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn resume_flow(&self, flow_id: Uuid) -> Result<bool> {
        // Only SUSPENDED flows; a RUNNING flow re-checks its wait itself
        let result = sqlx::query(
            "UPDATE flow_queue
             SET status = 'PENDING', locked_by = NULL, updated_at = ?
             WHERE flow_id = ? AND status = 'SUSPENDED'",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(flow_id.to_string())
        .execute(&self.pool)
        .await?;

        let resumed = result.rows_affected() > 0;
        if resumed {
            debug!("Resumed flow: flow_id={}", flow_id);
        }
        Ok(resumed)
    }

    async fn complete_flow(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE flow_queue
             SET status = ?, locked_by = NULL, updated_at = ?,
                 error_message = COALESCE(?, error_message)
             WHERE task_id = ? AND status NOT IN ('COMPLETE', 'FAILED')",
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(error_message)
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            // Nothing receives once the instance is finished
            sqlx::query(
                "DELETE FROM signal_inbox
                 WHERE flow_id = (SELECT flow_id FROM flow_queue WHERE task_id = ?)",
            )
            .bind(task_id.to_string())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            debug!("Completed flow: task_id={}, status={}", task_id, status);
            return Ok(true);
        }
        tx.commit().await?;

        match self.get_scheduled_flow(task_id).await? {
            Some(_) => Ok(false),
            None => Err(StorageError::ScheduledFlowNotFound(task_id)),
        }
    }

    async fn retry_flow(
        &self,
        task_id: Uuid,
        error_message: String,
        delay: Duration,
    ) -> Result<()> {
        let chrono_delay = chrono::Duration::from_std(delay)
            .map_err(|e| StorageError::InvalidParameter(format!("Invalid delay duration: {}", e)))?;
        let scheduled_for = Utc::now() + chrono_delay;

        let result = sqlx::query(
            "UPDATE flow_queue
             SET retry_count = retry_count + 1,
                 error_message = ?,
                 status = 'PENDING',
                 locked_by = NULL,
                 scheduled_for = ?,
                 updated_at = ?
             WHERE task_id = ?",
        )
        .bind(error_message)
        .bind(scheduled_for.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ScheduledFlowNotFound(task_id));
        }

        debug!("Retried flow: task_id={}, retry_count incremented", task_id);
        Ok(())
    }

    async fn get_scheduled_flow(&self, task_id: Uuid) -> Result<Option<ScheduledFlow>> {
        sqlx::query(&format!(
            "SELECT {} FROM flow_queue WHERE task_id = ?",
            FLOW_COLUMNS
        ))
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| Self::row_to_scheduled_flow(&row))
        .transpose()
    }

    async fn get_flow(&self, flow_id: Uuid) -> Result<Option<ScheduledFlow>> {
        sqlx::query(&format!(
            "SELECT {} FROM flow_queue WHERE flow_id = ?",
            FLOW_COLUMNS
        ))
        .bind(flow_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| Self::row_to_scheduled_flow(&row))
        .transpose()
    }

    async fn get_overdue_flows(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledFlow>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM flow_queue
             WHERE deadline IS NOT NULL
               AND deadline <= ?
               AND status NOT IN ('COMPLETE', 'FAILED')",
            FLOW_COLUMNS
        ))
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_scheduled_flow).collect()
    }

    async fn release_locks(&self, worker_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE flow_queue
             SET status = 'PENDING', locked_by = NULL, updated_at = ?
             WHERE status = 'RUNNING' AND locked_by = ?",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            info!("Released {} flows locked by {}", released, worker_id);
        }
        Ok(released)
    }

    async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM execution_log")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM flow_queue")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM signal_inbox")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Reset execution log database (cleared execution_log, flow_queue, signal_inbox)");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        info!("Closing execution log database");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::deserialize_value;

    async fn start_step(log: &SqliteExecutionLog, id: Uuid, step: i32, kind: StepKind, name: &str) {
        let params = serialize_value(&vec!["pizza".to_string()]).unwrap();
        log.log_invocation_start(InvocationStartParams {
            id,
            step,
            kind,
            name,
            status: InvocationStatus::Pending,
            parameters: &params,
            retry_policy: None,
        })
        .await
        .unwrap();
    }

    fn scheduled(key: &str) -> ScheduledFlow {
        ScheduledFlow::new(
            Uuid::new_v4(),
            "HandleEatsOrder".to_string(),
            key.to_string(),
            b"{}".to_vec(),
        )
    }

    #[tokio::test]
    async fn test_create_and_log_invocation() {
        let log = SqliteExecutionLog::in_memory().await.unwrap();
        let id = Uuid::new_v4();
        start_step(&log, id, 1, StepKind::Activity, "receive-ack").await;

        let expected_hash = hash_params(&serialize_value(&vec!["pizza".to_string()]).unwrap());
        let invocation = log.get_invocation(id, 1).await.unwrap().unwrap();
        assert_eq!(invocation.kind(), StepKind::Activity);
        assert_eq!(invocation.name(), "receive-ack");
        assert_eq!(invocation.status(), InvocationStatus::Pending);
        assert_eq!(invocation.attempts(), 1);
        assert_eq!(invocation.params_hash(), expected_hash);

        start_step(&log, id, 1, StepKind::Activity, "receive-ack").await;
        let invocation = log.get_invocation(id, 1).await.unwrap().unwrap();
        assert_eq!(invocation.attempts(), 2);
    }

    #[tokio::test]
    async fn test_log_completion() {
        let log = SqliteExecutionLog::in_memory().await.unwrap();
        let id = Uuid::new_v4();
        start_step(&log, id, 0, StepKind::Flow, "HandleEatsOrder").await;

        let return_val = serialize_value(&42i32).unwrap();
        let invocation = log
            .log_invocation_completion(id, 0, &return_val)
            .await
            .unwrap();

        assert_eq!(invocation.status(), InvocationStatus::Complete);
        assert_eq!(invocation.deserialize_return_value::<i32>().unwrap(), Some(42));

        let history = log.get_invocations_for_flow(id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_lifecycle() {
        let log = SqliteExecutionLog::in_memory().await.unwrap();
        let flow = scheduled("o-1");
        let (task_id, flow_id) = (flow.task_id, flow.flow_id);

        let mut duplicate = scheduled("o-1");
        duplicate.flow_id = flow_id;

        log.enqueue_flow(flow).await.unwrap();
        assert!(matches!(
            log.enqueue_flow(duplicate).await,
            Err(StorageError::DuplicateFlow(_))
        ));

        let claimed = log.dequeue_flow("worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.task_id, task_id);
        assert_eq!(claimed.business_key, "o-1");
        assert!(log.dequeue_flow("worker-2").await.unwrap().is_none());

        assert!(log.suspend_flow(task_id).await.unwrap());
        assert!(log.resume_flow(flow_id).await.unwrap());
        assert!(!log.resume_flow(flow_id).await.unwrap());

        log.dequeue_flow("worker-1").await.unwrap().unwrap();
        assert!(log
            .complete_flow(task_id, TaskStatus::Complete, None)
            .await
            .unwrap());
        assert!(!log
            .complete_flow(task_id, TaskStatus::Failed, Some("late".into()))
            .await
            .unwrap());

        let stored = log.get_flow(flow_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Complete);
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn test_finishing_flow_drops_queued_signals() {
        let log = SqliteExecutionLog::in_memory().await.unwrap();
        let flow = scheduled("o-2");
        let (task_id, flow_id) = (flow.task_id, flow.flow_id);
        let other = Uuid::new_v4();
        log.enqueue_flow(flow).await.unwrap();
        log.dequeue_flow("worker-1").await.unwrap();

        log.push_signal(flow_id, "order-decision", b"late").await.unwrap();
        log.push_signal(other, "order-decision", b"keep").await.unwrap();

        assert!(log
            .complete_flow(task_id, TaskStatus::Failed, Some("boom".into()))
            .await
            .unwrap());
        assert!(!log.has_pending_signal(flow_id, "order-decision").await.unwrap());
        assert!(log.has_pending_signal(other, "order-decision").await.unwrap());
    }

    #[tokio::test]
    async fn test_signal_consumption_is_transactional() {
        let log = SqliteExecutionLog::in_memory().await.unwrap();
        let flow_id = Uuid::new_v4();
        start_step(&log, flow_id, 2, StepKind::Signal, "order-decision").await;
        log.log_signal(flow_id, 2, "order-decision").await.unwrap();

        assert!(log
            .consume_signal(flow_id, 2, "order-decision")
            .await
            .unwrap()
            .is_none());

        log.push_signal(flow_id, "order-decision", &serialize_value(&1).unwrap())
            .await
            .unwrap();
        log.push_signal(flow_id, "order-decision", &serialize_value(&2).unwrap())
            .await
            .unwrap();

        let first = log
            .consume_signal(flow_id, 2, "order-decision")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deserialize_value::<i32>(&first).unwrap(), 1);

        let step = log.get_invocation(flow_id, 2).await.unwrap().unwrap();
        assert!(step.is_complete());

        // Completed step keeps its value, second message stays queued
        let again = log
            .consume_signal(flow_id, 2, "order-decision")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again, first);
        assert!(log
            .has_pending_signal(flow_id, "order-decision")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_timer_claim_and_child_completion() {
        let log = SqliteExecutionLog::in_memory().await.unwrap();
        let flow_id = Uuid::new_v4();

        start_step(&log, flow_id, 1, StepKind::Timer, "accept-delay").await;
        log.log_timer(
            flow_id,
            1,
            Utc::now() - chrono::Duration::milliseconds(10),
            Some("accept-delay"),
        )
        .await
        .unwrap();

        let expired = log.get_expired_timers(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert!(log.claim_timer(flow_id, 1).await.unwrap());
        assert!(!log.claim_timer(flow_id, 1).await.unwrap());

        start_step(&log, flow_id, 2, StepKind::ChildFlow, "DeliverOrder").await;
        log.log_signal(flow_id, 2, "child-token").await.unwrap();
        assert!(log
            .complete_waiting_step(flow_id, "child-token", b"{}")
            .await
            .unwrap());
        assert!(!log
            .complete_waiting_step(flow_id, "child-token", b"{}")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_overdue_and_release_locks() {
        let log = SqliteExecutionLog::in_memory().await.unwrap();
        let late = scheduled("o-1").with_deadline(Utc::now() - chrono::Duration::seconds(1));
        log.enqueue_flow(late).await.unwrap();

        let overdue = log.get_overdue_flows(Utc::now()).await.unwrap();
        assert_eq!(overdue.len(), 1);

        log.dequeue_flow("worker-1").await.unwrap().unwrap();
        assert_eq!(log.release_locks("worker-2").await.unwrap(), 0);
        assert_eq!(log.release_locks("worker-1").await.unwrap(), 1);
        assert!(log.dequeue_flow("worker-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_in_memory_pool_is_single_connection() {
        let log = SqliteExecutionLog::in_memory().await.unwrap();
        assert_eq!(log.pool_size(), 1);
        assert_eq!(log.db_path(), ":memory:");
    }
}
