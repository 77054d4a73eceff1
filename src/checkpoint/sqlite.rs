/*!
SQLite checkpoint store

Async implementation of the [`CheckpointStore`] trait on top of `sqlx`.

## Behavior

- Uses the serde persistence models (see [`super::models`]) for encoding
  record payloads; the lifecycle phase and owning procedure are mirrored
  into dedicated columns so filtering and procedure-wide removal stay in
  SQL.
- The schema is applied on connect; the store is safe to open against an
  existing database.
- The recoverable-action registry is process-local: it describes the code
  deployed in this process, not durable data, so it lives in memory next to
  the pool.
*/

use std::sync::{PoisonError, RwLock};

use miette::Diagnostic;
use rustc_hash::FxHashSet;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use super::models::{PersistedCheckpoint, decode_phase, encode_phase};
use super::{Checkpoint, CheckpointError, CheckpointPhase, CheckpointStore, Result};
use async_trait::async_trait;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    job_uuid      TEXT PRIMARY KEY,
    proc_uuid     TEXT NOT NULL,
    phase         TEXT NOT NULL,
    recoverable   INTEGER NOT NULL,
    record_json   TEXT NOT NULL,
    registered_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS checkpoints_proc ON checkpoints (proc_uuid);
";

#[derive(Debug, Error, Diagnostic)]
pub enum SqliteStoreError {
    #[error("SQLx error: {0}")]
    #[diagnostic(
        code(fabricore::sqlite::sqlx),
        help("Ensure the SQLite database URL is valid and accessible.")
    )]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    #[diagnostic(
        code(fabricore::sqlite::serde),
        help("Check the persisted record_json shape against PersistedCheckpoint.")
    )]
    Serde(#[from] serde_json::Error),
}

impl From<SqliteStoreError> for CheckpointError {
    fn from(e: SqliteStoreError) -> Self {
        match e {
            SqliteStoreError::Sqlx(err) => CheckpointError::Backend {
                message: err.to_string(),
            },
            SqliteStoreError::Serde(err) => CheckpointError::Other {
                message: err.to_string(),
            },
        }
    }
}

/// SQLite-backed checkpoint store.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    recoverable_actions: RwLock<FxHashSet<String>>,
}

impl SqliteCheckpointStore {
    /// Connect to `db_url` (e.g. `sqlite://fabricore.db`) and apply the
    /// schema. For file URLs the database file is created when missing.
    #[instrument(skip(db_url), err)]
    pub async fn connect(db_url: &str) -> std::result::Result<Self, SqliteStoreError> {
        if let Some(path) = db_url.strip_prefix("sqlite://") {
            let path = path.trim();
            if !path.is_empty() && path != ":memory:" {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if !p.exists() {
                    // Ignore result; if it already exists or we lack
                    // permission the connect below will report it.
                    let _ = std::fs::File::create_new(p);
                }
            }
        }
        let pool = SqlitePool::connect(db_url).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            recoverable_actions: RwLock::new(FxHashSet::default()),
        })
    }

    /// Access the underlying pool, e.g. to share it with a
    /// [`SqlitePersisterProvider`](crate::persister::SqlitePersisterProvider).
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode_row(row: &SqliteRow) -> std::result::Result<Checkpoint, SqliteStoreError> {
        let record_json: String = row.try_get("record_json")?;
        let persisted: PersistedCheckpoint = serde_json::from_str(&record_json)?;
        Ok(Checkpoint::from(persisted))
    }

    async fn set_phase(&self, checkpoint: &Checkpoint, phase: CheckpointPhase) -> Result<()> {
        let updated = sqlx::query("UPDATE checkpoints SET phase = ?1 WHERE job_uuid = ?2")
            .bind(encode_phase(phase))
            .bind(checkpoint.job_uuid.to_string())
            .execute(&self.pool)
            .await
            .map_err(SqliteStoreError::from)?;
        if updated.rows_affected() == 0 {
            return Err(CheckpointError::NotFound {
                job_uuid: checkpoint.job_uuid,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    fn is_recoverable(&self, action_fqn: &str) -> bool {
        self.recoverable_actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(action_fqn)
    }

    fn register_recoverable(&self, action_fqn: &str) {
        self.recoverable_actions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(action_fqn.to_string());
    }

    #[instrument(skip(self, records), fields(count = records.len()), err)]
    async fn register(&self, records: Vec<Checkpoint>, recoverable: bool) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(SqliteStoreError::from)?;
        for checkpoint in &records {
            let persisted = PersistedCheckpoint::from_checkpoint(
                checkpoint,
                CheckpointPhase::Registered,
                recoverable,
            );
            let record_json =
                serde_json::to_string(&persisted).map_err(SqliteStoreError::from)?;
            sqlx::query(
                "INSERT OR REPLACE INTO checkpoints \
                 (job_uuid, proc_uuid, phase, recoverable, record_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(checkpoint.job_uuid.to_string())
            .bind(checkpoint.proc_uuid.to_string())
            .bind(encode_phase(CheckpointPhase::Registered))
            .bind(recoverable)
            .bind(record_json)
            .execute(&mut *tx)
            .await
            .map_err(SqliteStoreError::from)?;
        }
        tx.commit().await.map_err(SqliteStoreError::from)?;
        Ok(())
    }

    async fn begin(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.set_phase(checkpoint, CheckpointPhase::Begun).await
    }

    async fn finish(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.set_phase(checkpoint, CheckpointPhase::Finished).await
    }

    #[instrument(skip(self, checkpoint), fields(procedure = %checkpoint.proc_uuid), err)]
    async fn remove(&self, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE proc_uuid = ?1")
            .bind(checkpoint.proc_uuid.to_string())
            .execute(&self.pool)
            .await
            .map_err(SqliteStoreError::from)?;
        Ok(())
    }

    async fn phase(&self, job_uuid: Uuid) -> Result<Option<CheckpointPhase>> {
        let row = sqlx::query("SELECT phase FROM checkpoints WHERE job_uuid = ?1")
            .bind(job_uuid.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(SqliteStoreError::from)?;
        Ok(row.map(|row| {
            let phase: String = row.get("phase");
            decode_phase(&phase)
        }))
    }

    async fn pending(&self) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            "SELECT record_json FROM checkpoints \
             WHERE phase != 'finished' ORDER BY registered_at, rowid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(SqliteStoreError::from)?;
        rows.iter()
            .map(|row| Self::decode_row(row).map_err(CheckpointError::from))
            .collect()
    }
}
