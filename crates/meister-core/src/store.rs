//! Postgres access layer.
//!
//! All writes the scheduler performs go through here: idempotent job
//! inserts (keyed on `(kind, payload)`) and priority backfills.

use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::debug;

use crate::models::{ChallengeBinaryNode, Crash, Job, JobKind, RawRoundPoll};

const JOB_COLUMNS: &str = "id, kind, worker, payload, priority, request_cpu, request_memory, \
                           limit_cpu, limit_memory, kvm_access, data_access, restart, created_at";

/// Errors surfaced by the store. Creators catch these at the call site;
/// a failing store truncates one creator's stream, never the tick.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Connection parameters for the shared Postgres instance.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Template for an idempotent job insert.
///
/// Two inserts with the same `(kind, payload)` return the same row; the
/// uniqueness key lives on the `jobs` table.
#[derive(Debug, Clone)]
pub struct JobInit {
    pub kind: JobKind,
    pub payload: Value,
    pub request_cpu: Option<f64>,
    pub request_memory: Option<i64>,
    pub limit_cpu: Option<f64>,
    pub limit_memory: Option<i64>,
    pub kvm_access: bool,
    pub data_access: bool,
    pub restart: bool,
}

impl JobInit {
    /// A job template with every hint unset and every flag off.
    pub fn new(kind: JobKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            request_cpu: None,
            request_memory: None,
            limit_cpu: None,
            limit_memory: None,
            kvm_access: false,
            data_access: false,
            restart: false,
        }
    }
}

/// Handle to the shared state store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect a small pool; the scheduler is a single control loop and
    /// never needs many connections.
    pub async fn connect(cfg: &DbConfig) -> Result<Self, StoreError> {
        let opts = PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.user)
            .password(&cfg.password)
            .database(&cfg.database);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn challenge_binaries(&self) -> Result<Vec<ChallengeBinaryNode>, StoreError> {
        let rows = sqlx::query_as::<_, ChallengeBinaryNode>(
            "SELECT id, name FROM challenge_binary_nodes ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn crashes_for(&self, cbn_id: i64) -> Result<Vec<Crash>, StoreError> {
        let rows = sqlx::query_as::<_, Crash>(
            "SELECT id, cbn_id, kind FROM crashes WHERE cbn_id = $1 ORDER BY id",
        )
        .bind(cbn_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn unsanitized_polls(&self) -> Result<Vec<RawRoundPoll>, StoreError> {
        let rows = sqlx::query_as::<_, RawRoundPoll>(
            "SELECT id, sanitized FROM raw_round_polls WHERE sanitized = FALSE ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Insert a job if no row with the same `(kind, payload)` exists yet,
    /// and return the row either way.
    pub async fn get_or_create_job(&self, init: JobInit) -> Result<Job, StoreError> {
        let sql = format!(
            "INSERT INTO jobs (kind, worker, payload, priority, request_cpu, request_memory, \
                               limit_cpu, limit_memory, kvm_access, data_access, restart) \
             VALUES ($1, $2, $3, 0, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (kind, payload) DO UPDATE SET worker = EXCLUDED.worker \
             RETURNING {JOB_COLUMNS}"
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(init.kind)
            .bind(init.kind.worker())
            .bind(&init.payload)
            .bind(init.request_cpu)
            .bind(init.request_memory)
            .bind(init.limit_cpu)
            .bind(init.limit_memory)
            .bind(init.kvm_access)
            .bind(init.data_access)
            .bind(init.restart)
            .fetch_one(&self.pool)
            .await?;
        Ok(job)
    }

    /// Persist brain-assigned priorities in one transaction. Used by the
    /// offline (cluster-absent) mode to backfill priorities without
    /// dispatching anything.
    pub async fn save_priorities(&self, candidates: &[(Job, f64)]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (job, priority) in candidates {
            debug!(job_id = job.id, priority, "persisting priority");
            sqlx::query("UPDATE jobs SET priority = $1 WHERE id = $2")
                .bind(priority.round() as i64)
                .bind(job.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
