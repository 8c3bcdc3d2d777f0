//! Proposal storage
//!
//! The [`ProposalStore`] port hides the document database. Every write after
//! creation is conditional on the version the writer read, which is what
//! lets the lifecycle run read-modify-write units without a global lock.

use crate::error::{conflict_error, not_found_error, AppError};
use crate::proposal::{Proposal, ProposalStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence port for the proposal aggregate
#[async_trait]
pub trait ProposalStore: Send + Sync {
    /// Persist a new proposal at version 1 and return the stored copy.
    async fn create(&self, proposal: &Proposal) -> Result<Proposal, AppError>;

    /// Fetch a proposal scoped to its group. `None` if absent or owned by another group.
    async fn get(&self, group_id: Uuid, id: Uuid) -> Result<Option<Proposal>, AppError>;

    /// Replace the stored proposal if its version still equals `expected_version`.
    ///
    /// # Errors
    ///
    /// - `Conflict` when another writer committed first
    /// - `NotFound` when the proposal does not exist
    async fn update_if_version(
        &self,
        proposal: &Proposal,
        expected_version: u64,
    ) -> Result<Proposal, AppError>;

    /// All proposals of a group, newest first, optionally filtered by stored status.
    async fn list_by_group(
        &self,
        group_id: Uuid,
        status: Option<ProposalStatus>,
    ) -> Result<Vec<Proposal>, AppError>;

    /// Every proposal still stored as `Open`, across groups. Used by the expiry sweep.
    async fn list_open(&self) -> Result<Vec<Proposal>, AppError>;
}

/// Thread-safe in-memory proposal store
pub struct InMemoryProposalStore {
    proposals: Arc<RwLock<HashMap<Uuid, Proposal>>>,
}

impl InMemoryProposalStore {
    pub fn new() -> Self {
        Self {
            proposals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get proposal count
    #[cfg(test)]
    pub async fn count(&self) -> usize {
        let proposals = self.proposals.read().await;
        proposals.len()
    }
}

impl Default for InMemoryProposalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProposalStore for InMemoryProposalStore {
    async fn create(&self, proposal: &Proposal) -> Result<Proposal, AppError> {
        let mut proposals = self.proposals.write().await;
        if proposals.contains_key(&proposal.id) {
            return Err(conflict_error(format!(
                "Proposal {} already exists",
                proposal.id
            )));
        }
        let mut stored = proposal.clone();
        stored.version = 1;
        proposals.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, group_id: Uuid, id: Uuid) -> Result<Option<Proposal>, AppError> {
        let proposals = self.proposals.read().await;
        Ok(proposals
            .get(&id)
            .filter(|p| p.group_id == group_id)
            .cloned())
    }

    async fn update_if_version(
        &self,
        proposal: &Proposal,
        expected_version: u64,
    ) -> Result<Proposal, AppError> {
        let mut proposals = self.proposals.write().await;
        let current = proposals
            .get_mut(&proposal.id)
            .ok_or_else(|| not_found_error(format!("Proposal {} not found", proposal.id)))?;

        if current.version != expected_version {
            return Err(conflict_error(format!(
                "Proposal {} is at version {}, expected {}",
                proposal.id, current.version, expected_version
            )));
        }

        let mut stored = proposal.clone();
        stored.version = expected_version + 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn list_by_group(
        &self,
        group_id: Uuid,
        status: Option<ProposalStatus>,
    ) -> Result<Vec<Proposal>, AppError> {
        let proposals = self.proposals.read().await;
        let mut matching: Vec<Proposal> = proposals
            .values()
            .filter(|p| p.group_id == group_id)
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }

    async fn list_open(&self) -> Result<Vec<Proposal>, AppError> {
        let proposals = self.proposals.read().await;
        Ok(proposals
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect())
    }
}
