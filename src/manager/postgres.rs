//! PostgreSQL implementation of [`RequestStore`].
//!
//! Each request is stored as one JSONB snapshot plus a few projected columns (stage,
//! category, terminal flag) for filtering. Run [`crate::migrator`] before first use.

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::Row;
use sqlx::types::Json;
use uuid::Uuid;

mod pool_provider;

pub use pool_provider::{PoolProvider, SplitPools, TestDbPools};

use super::RequestStore;
use crate::domain::request::{RequestId, ReviewRequest};
use crate::error::{Result, WorkflowError};

/// Request store backed by a `review_requests` table.
///
/// # Example
/// ```ignore
/// let pool = PgPool::connect("postgresql://localhost/covenant").await?;
/// covenant::migrator().run(&pool).await?;
/// let store = Arc::new(PostgresRequestStore::new(pool));
/// ```
#[derive(Debug, Clone)]
pub struct PostgresRequestStore<P: PoolProvider = sqlx::PgPool> {
    pools: P,
}

impl<P: PoolProvider> PostgresRequestStore<P> {
    pub fn new(pools: P) -> Self {
        Self { pools }
    }

    pub fn pools(&self) -> &P {
        &self.pools
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<ReviewRequest> {
    let Json(request): Json<ReviewRequest> = row
        .try_get("snapshot")
        .map_err(|e| WorkflowError::Other(anyhow!("Failed to decode request snapshot: {}", e)))?;
    Ok(request)
}

#[async_trait]
impl<P: PoolProvider> RequestStore for PostgresRequestStore<P> {
    #[tracing::instrument(skip(self, request), fields(request_id = %request.id))]
    async fn create(&self, request: &ReviewRequest) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO review_requests (id, category, stage, terminal, snapshot, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(*request.id as Uuid)
        .bind(request.category.as_str())
        .bind(request.stage.as_str())
        .bind(request.is_terminal())
        .bind(Json(request))
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(self.pools.write())
        .await
        .map_err(|e| WorkflowError::Other(anyhow!("Failed to insert request: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(WorkflowError::RequestExists(request.id));
        }
        Ok(())
    }

    async fn get(&self, id: RequestId) -> Result<ReviewRequest> {
        // Read from the primary: a transition loads, applies and persists in one lease.
        let row = sqlx::query("SELECT snapshot FROM review_requests WHERE id = $1")
            .bind(*id as Uuid)
            .fetch_optional(self.pools.write())
            .await
            .map_err(|e| WorkflowError::Other(anyhow!("Failed to fetch request: {}", e)))?
            .ok_or(WorkflowError::RequestNotFound(id))?;

        decode(&row)
    }

    #[tracing::instrument(skip(self, request), fields(request_id = %request.id, stage = %request.stage))]
    async fn persist(&self, request: &ReviewRequest) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE review_requests
            SET stage = $2, terminal = $3, snapshot = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(*request.id as Uuid)
        .bind(request.stage.as_str())
        .bind(request.is_terminal())
        .bind(Json(request))
        .bind(request.updated_at)
        .execute(self.pools.write())
        .await
        .map_err(|e| WorkflowError::Other(anyhow!("Failed to update request: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(WorkflowError::RequestNotFound(request.id));
        }
        Ok(())
    }

    async fn delete(&self, id: RequestId) -> Result<()> {
        let result = sqlx::query("DELETE FROM review_requests WHERE id = $1")
            .bind(*id as Uuid)
            .execute(self.pools.write())
            .await
            .map_err(|e| WorkflowError::Other(anyhow!("Failed to delete request: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(WorkflowError::RequestNotFound(id));
        }
        Ok(())
    }

    async fn list_active(
        &self,
        after: Option<RequestId>,
        limit: usize,
    ) -> Result<Vec<ReviewRequest>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT snapshot FROM review_requests
            WHERE NOT terminal AND ($1::UUID IS NULL OR id > $1)
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(after.map(|id| id.0))
        .bind(limit)
        .fetch_all(self.pools.read())
        .await
        .map_err(|e| WorkflowError::Other(anyhow!("Failed to list active requests: {}", e)))?;

        rows.iter().map(decode).collect()
    }
}
