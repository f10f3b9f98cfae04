//! Storage seam for review requests.
//!
//! The engine is storage-agnostic: it reads a snapshot, computes a new one and writes it
//! back under its per-request lease. Any store that offers read-committed reads and writes by
//! id is good enough, since nothing else writes a request while its lease is held.

use async_trait::async_trait;

use crate::domain::request::{RequestId, ReviewRequest};
use crate::error::Result;

mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryRequestStore;

/// Persistence for review request snapshots.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a new request.
    ///
    /// # Errors
    /// `RequestExists` if a request with the same id is already stored.
    async fn create(&self, request: &ReviewRequest) -> Result<()>;

    /// Load a request by id.
    ///
    /// # Errors
    /// `RequestNotFound` if no such request exists.
    async fn get(&self, id: RequestId) -> Result<ReviewRequest>;

    /// Replace the stored snapshot of an existing request.
    ///
    /// # Errors
    /// `RequestNotFound` if the request was deleted meanwhile.
    async fn persist(&self, request: &ReviewRequest) -> Result<()>;

    /// Remove a request.
    async fn delete(&self, id: RequestId) -> Result<()>;

    /// Non-terminal requests ordered by id, starting strictly after `after`.
    ///
    /// Used by the scheduler sweep and by recovery to page through every live request.
    async fn list_active(
        &self,
        after: Option<RequestId>,
        limit: usize,
    ) -> Result<Vec<ReviewRequest>>;
}
