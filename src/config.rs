//! Executor configuration with environment resolution.

/// Resolved configuration for building an [`Executor`](crate::executor::Executor).
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Optional bound on each worker's job queue.
    pub queue_capacity: Option<usize>,
    /// Database URL for the SQLite-backed checkpoint store and persister.
    pub database_url: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        dotenvy::dotenv().ok();
        Self {
            workers: std::env::var("FABRICORE_WORKERS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(1),
            queue_capacity: std::env::var("FABRICORE_QUEUE_CAPACITY")
                .ok()
                .and_then(|raw| raw.parse().ok()),
            database_url: Self::resolve_database_url(None),
        }
    }
}

impl ExecutorConfig {
    fn resolve_database_url(provided: Option<String>) -> Option<String> {
        if provided.is_some() {
            return provided;
        }
        dotenvy::dotenv().ok();
        Some(
            std::env::var("FABRICORE_SQLITE_URL")
                .unwrap_or_else(|_| "sqlite://fabricore.db".to_string()),
        )
    }

    #[must_use]
    pub fn new(workers: usize, queue_capacity: Option<usize>, database_url: Option<String>) -> Self {
        Self {
            workers: workers.max(1),
            queue_capacity,
            database_url: Self::resolve_database_url(database_url),
        }
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }
}
