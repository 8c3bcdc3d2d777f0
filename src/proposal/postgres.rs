//! PostgreSQL-backed proposal store
//!
//! Proposals are kept as JSONB documents. Status, version and deadlines are
//! mirrored into columns so the conditional update and the listing filters
//! run inside the database.

use crate::db::{queries, store_error};
use crate::error::{conflict_error, not_found_error, AppError};
use crate::proposal::{Proposal, ProposalStatus, ProposalStore};
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use tokio_postgres::types::Json;
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::debug;
use uuid::Uuid;

pub struct PgProposalStore {
    pool: Pool,
}

impl PgProposalStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn client(&self) -> Result<Object, AppError> {
        self.pool
            .get()
            .await
            .map_err(|e| store_error("Database pool error", e))
    }

    fn from_row(row: &Row) -> Result<Proposal, AppError> {
        let version: i64 = row.get("version");
        let Json(mut proposal): Json<Proposal> = row
            .try_get("document")
            .map_err(|e| AppError::Internal(format!("Corrupt proposal document: {}", e)))?;
        proposal.version = version as u64;
        Ok(proposal)
    }
}

#[async_trait]
impl ProposalStore for PgProposalStore {
    async fn create(&self, proposal: &Proposal) -> Result<Proposal, AppError> {
        let client = self.client().await?;
        let mut stored = proposal.clone();
        stored.version = 1;

        client
            .execute(
                queries::INSERT_PROPOSAL,
                &[
                    &stored.id,
                    &stored.group_id,
                    &stored.status.as_str(),
                    &(stored.version as i64),
                    &stored.created_at,
                    &stored.expires_at,
                    &Json(&stored),
                ],
            )
            .await
            .map_err(|e| {
                if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                    conflict_error(format!("Proposal {} already exists", stored.id))
                } else {
                    store_error("Failed to insert proposal", e)
                }
            })?;

        debug!("Inserted proposal {} for group {}", stored.id, stored.group_id);
        Ok(stored)
    }

    async fn get(&self, group_id: Uuid, id: Uuid) -> Result<Option<Proposal>, AppError> {
        let client = self.client().await?;
        let row = client
            .query_opt(queries::GET_PROPOSAL, &[&id, &group_id])
            .await
            .map_err(|e| store_error("Failed to load proposal", e))?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn update_if_version(
        &self,
        proposal: &Proposal,
        expected_version: u64,
    ) -> Result<Proposal, AppError> {
        let client = self.client().await?;
        let mut stored = proposal.clone();
        stored.version = expected_version + 1;

        let updated = client
            .execute(
                queries::UPDATE_PROPOSAL_IF_VERSION,
                &[
                    &stored.id,
                    &(expected_version as i64),
                    &stored.status.as_str(),
                    &(stored.version as i64),
                    &stored.expires_at,
                    &Json(&stored),
                ],
            )
            .await
            .map_err(|e| store_error("Failed to update proposal", e))?;

        if updated == 1 {
            return Ok(stored);
        }

        let exists = client
            .query_opt(queries::PROPOSAL_EXISTS, &[&stored.id])
            .await
            .map_err(|e| store_error("Failed to check proposal", e))?
            .is_some();

        if exists {
            Err(conflict_error(format!(
                "Proposal {} changed since version {}",
                stored.id, expected_version
            )))
        } else {
            Err(not_found_error(format!("Proposal {} not found", stored.id)))
        }
    }

    async fn list_by_group(
        &self,
        group_id: Uuid,
        status: Option<ProposalStatus>,
    ) -> Result<Vec<Proposal>, AppError> {
        let client = self.client().await?;
        let status = status.map(|s| s.as_str());
        let rows = client
            .query(queries::LIST_PROPOSALS_BY_GROUP, &[&group_id, &status])
            .await
            .map_err(|e| store_error("Failed to list proposals", e))?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn list_open(&self) -> Result<Vec<Proposal>, AppError> {
        let client = self.client().await?;
        let rows = client
            .query(queries::LIST_OPEN_PROPOSALS, &[])
            .await
            .map_err(|e| store_error("Failed to list open proposals", e))?;

        rows.iter().map(Self::from_row).collect()
    }
}
