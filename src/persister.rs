//! The per-worker transactional seam.
//!
//! Every worker owns exactly one [`Persister`], the database session its
//! jobs run under, constructed through a shared [`PersisterProvider`] when
//! the worker task starts. Ownership replaces the thread-registry binding of
//! older designs: the session can never be shared across workers because it
//! is moved into the worker task.

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

/// Errors surfaced by the transactional context.
///
/// These are caught and logged inside [`Job::execute`](crate::job::Job::execute);
/// they never propagate to the worker loop.
#[derive(Debug, Error, Diagnostic)]
pub enum PersisterError {
    /// Opening the session failed. Fatal to the owning worker.
    #[error("failed to open database session: {message}")]
    #[diagnostic(
        code(fabricore::persister::connect),
        help("Check database connectivity; the worker will not start without a session.")
    )]
    Connect { message: String },

    /// `begin` called while a transaction is already open.
    #[error("transaction already in progress")]
    #[diagnostic(code(fabricore::persister::already_in_transaction))]
    AlreadyInTransaction,

    /// `commit`/`rollback` called with no open transaction.
    #[error("no transaction in progress")]
    #[diagnostic(code(fabricore::persister::no_transaction))]
    NoTransaction,

    /// Backend database error.
    #[error("database error: {message}")]
    #[diagnostic(code(fabricore::persister::database))]
    Database { message: String },
}

/// A worker-local database session with explicit transaction boundaries.
///
/// At most one transaction is open at a time; jobs on the same worker run
/// strictly sequentially, so `&mut self` is the whole concurrency story.
#[async_trait]
pub trait Persister: Send {
    /// Open a transaction bound to the calling worker.
    async fn begin(&mut self) -> Result<(), PersisterError>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<(), PersisterError>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> Result<(), PersisterError>;
}

/// Constructs one [`Persister`] per worker.
#[async_trait]
pub trait PersisterProvider: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Persister>, PersisterError>;
}

/// A persister with no backing store. Transaction boundaries are tracked so
/// misuse is still reported, but nothing is made durable. Default for tests
/// and for deployments whose actions manage their own durability.
#[derive(Debug, Default)]
pub struct NoopPersister {
    in_transaction: bool,
}

#[async_trait]
impl Persister for NoopPersister {
    async fn begin(&mut self) -> Result<(), PersisterError> {
        if self.in_transaction {
            return Err(PersisterError::AlreadyInTransaction);
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), PersisterError> {
        if !self.in_transaction {
            return Err(PersisterError::NoTransaction);
        }
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), PersisterError> {
        if !self.in_transaction {
            return Err(PersisterError::NoTransaction);
        }
        self.in_transaction = false;
        Ok(())
    }
}

/// Provider for [`NoopPersister`].
#[derive(Debug, Default)]
pub struct NoopPersisterProvider;

#[async_trait]
impl PersisterProvider for NoopPersisterProvider {
    async fn open(&self) -> Result<Box<dyn Persister>, PersisterError> {
        Ok(Box::new(NoopPersister::default()))
    }
}

#[cfg(feature = "sqlite")]
pub use self::sqlite::{SqlitePersister, SqlitePersisterProvider};

#[cfg(feature = "sqlite")]
mod sqlite {
    use sqlx::{Sqlite, SqlitePool, Transaction};

    use super::*;

    impl From<sqlx::Error> for PersisterError {
        fn from(e: sqlx::Error) -> Self {
            PersisterError::Database {
                message: e.to_string(),
            }
        }
    }

    /// sqlx/SQLite-backed session: one pool connection, one open transaction
    /// at a time.
    pub struct SqlitePersister {
        pool: SqlitePool,
        tx: Option<Transaction<'static, Sqlite>>,
    }

    impl SqlitePersister {
        #[must_use]
        pub fn new(pool: SqlitePool) -> Self {
            Self { pool, tx: None }
        }

        /// The open transaction, for actions that persist through the same
        /// context their job commits under.
        pub fn transaction(&mut self) -> Option<&mut Transaction<'static, Sqlite>> {
            self.tx.as_mut()
        }
    }

    #[async_trait]
    impl Persister for SqlitePersister {
        async fn begin(&mut self) -> Result<(), PersisterError> {
            if self.tx.is_some() {
                return Err(PersisterError::AlreadyInTransaction);
            }
            self.tx = Some(self.pool.begin().await?);
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), PersisterError> {
            let tx = self.tx.take().ok_or(PersisterError::NoTransaction)?;
            tx.commit().await?;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), PersisterError> {
            let tx = self.tx.take().ok_or(PersisterError::NoTransaction)?;
            tx.rollback().await?;
            Ok(())
        }
    }

    /// Provider handing each worker its own [`SqlitePersister`] off a shared
    /// pool.
    pub struct SqlitePersisterProvider {
        pool: SqlitePool,
    }

    impl SqlitePersisterProvider {
        #[must_use]
        pub fn new(pool: SqlitePool) -> Self {
            Self { pool }
        }

        /// Connect a fresh pool for `db_url` and wrap it in a provider.
        pub async fn connect(db_url: &str) -> Result<Self, PersisterError> {
            let pool = SqlitePool::connect(db_url)
                .await
                .map_err(|e| PersisterError::Connect {
                    message: e.to_string(),
                })?;
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl PersisterProvider for SqlitePersisterProvider {
        async fn open(&self) -> Result<Box<dyn Persister>, PersisterError> {
            Ok(Box::new(SqlitePersister::new(self.pool.clone())))
        }
    }
}
