//! Shared Postgres plumbing for the sync store traits.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PipelineError | Scenario |
//! |------------|---------------|----------|
//! | Database (unique violation `23505`) | `StoreUnavailable` | Concurrent writer won the race; retry |
//! | Database (other) | `StoreUnavailable` | Server-side failure |
//! | PoolClosed / PoolTimedOut / Io / Tls | `StoreUnavailable` | Database unreachable |
//! | ColumnDecode / Decode / ColumnNotFound | `InvariantViolation` | Schema and code disagree |
//! | RowNotFound | `InvariantViolation` | Unexpected (queries use fetch_optional/fetch_all) |
//!
//! ## Runtime bridging
//!
//! The pipeline traits are synchronous. Each adapter keeps the `tokio` runtime
//! handle it was built on and `block_on`s the query. Callers must not be on a
//! runtime worker thread: worker-pool threads and `spawn_blocking` are fine.

use std::future::Future;
use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use shoptrack_core::{PipelineError, PipelineResult};

#[derive(Debug, Clone)]
pub struct PgContext {
    pool: Arc<PgPool>,
    handle: tokio::runtime::Handle,
}

impl PgContext {
    pub fn new(pool: PgPool, handle: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Connect a pool. Must be awaited inside the runtime the handle belongs to.
    pub async fn connect(url: &str, max_connections: u32) -> PipelineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, tokio::runtime::Handle::current()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn block_on<F, T>(&self, fut: F) -> PipelineResult<T>
    where
        F: Future<Output = PipelineResult<T>>,
    {
        self.handle.block_on(fut)
    }
}

pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PipelineError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => PipelineError::store(format!("{msg} (concurrent write)")),
                _ => PipelineError::store(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            PipelineError::invariant(format!("unexpected row not found in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            PipelineError::invariant(format!("decode error in {}: {}", operation, err))
        }
        _ => PipelineError::store(format!("sqlx error in {}: {}", operation, err)),
    }
}
