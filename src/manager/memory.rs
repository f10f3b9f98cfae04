//! In-memory request store.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::RequestStore;
use crate::domain::request::{RequestId, ReviewRequest};
use crate::error::{Result, WorkflowError};

/// Concurrent map of request snapshots. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRequestStore {
    requests: Arc<DashMap<RequestId, ReviewRequest>>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn create(&self, request: &ReviewRequest) -> Result<()> {
        match self.requests.entry(request.id) {
            Entry::Occupied(_) => Err(WorkflowError::RequestExists(request.id)),
            Entry::Vacant(slot) => {
                slot.insert(request.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: RequestId) -> Result<ReviewRequest> {
        self.requests
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(WorkflowError::RequestNotFound(id))
    }

    async fn persist(&self, request: &ReviewRequest) -> Result<()> {
        match self.requests.get_mut(&request.id) {
            Some(mut entry) => {
                *entry = request.clone();
                Ok(())
            }
            None => Err(WorkflowError::RequestNotFound(request.id)),
        }
    }

    async fn delete(&self, id: RequestId) -> Result<()> {
        self.requests
            .remove(&id)
            .map(|_| ())
            .ok_or(WorkflowError::RequestNotFound(id))
    }

    async fn list_active(
        &self,
        after: Option<RequestId>,
        limit: usize,
    ) -> Result<Vec<ReviewRequest>> {
        let mut active: Vec<ReviewRequest> = self
            .requests
            .iter()
            .filter(|entry| !entry.is_terminal())
            .filter(|entry| after.is_none_or(|after| *entry.key() > after))
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by_key(|request| request.id);
        active.truncate(limit);
        Ok(active)
    }
}
