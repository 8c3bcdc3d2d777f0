//! PostgreSQL group adapters
//!
//! Thin reads and writes over the `groups`, `group_members` and `loans`
//! tables owned by the wider savings-group backend.

use super::{ConfigStore, GroupDirectory, GroupRoster, LoanService, MembershipService};
use crate::db::{queries, store_error};
use crate::error::AppError;
use crate::governance::GovernanceModel;
use crate::proposal::{LoanApprovalPayload, MemberRemovalPayload};
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio_postgres::types::Json;
use tracing::{info, warn};
use uuid::Uuid;

pub struct PgGroups {
    pool: Pool,
}

impl PgGroups {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn client(&self) -> Result<Object, AppError> {
        self.pool
            .get()
            .await
            .map_err(|e| store_error("Database pool error", e))
    }

    fn missing(group_id: Uuid) -> AppError {
        AppError::NotFound(format!("Group {} not found", group_id))
    }
}

#[async_trait]
impl GroupDirectory for PgGroups {
    async fn get_members(&self, group_id: Uuid) -> Result<GroupRoster, AppError> {
        let client = self.client().await?;
        let group = client
            .query_opt(queries::GET_GROUP, &[&group_id])
            .await
            .map_err(|e| store_error("Failed to load group", e))?
            .ok_or_else(|| Self::missing(group_id))?;

        let rows = client
            .query(queries::LIST_ACTIVE_MEMBERS, &[&group_id])
            .await
            .map_err(|e| store_error("Failed to load members", e))?;

        Ok(GroupRoster {
            member_ids: rows.iter().map(|r| r.get("user_id")).collect(),
            admin_id: group.get("admin_id"),
        })
    }

    async fn get_governance_model(&self, group_id: Uuid) -> Result<GovernanceModel, AppError> {
        let client = self.client().await?;
        let row = client
            .query_opt(queries::GET_GROUP, &[&group_id])
            .await
            .map_err(|e| store_error("Failed to load group", e))?
            .ok_or_else(|| Self::missing(group_id))?;

        let stored: Option<Json<GovernanceModel>> = row
            .try_get("governance")
            .map_err(|e| AppError::Internal(format!("Corrupt governance model: {}", e)))?;

        Ok(match stored {
            Some(Json(model)) => model,
            None => {
                warn!("Group {} has no stored governance model, using default", group_id);
                GovernanceModel::default()
            }
        })
    }

    async fn get_config(&self, group_id: Uuid) -> Result<Map<String, Value>, AppError> {
        let client = self.client().await?;
        let row = client
            .query_opt(queries::GET_GROUP_SETTINGS, &[&group_id])
            .await
            .map_err(|e| store_error("Failed to load group settings", e))?
            .ok_or_else(|| Self::missing(group_id))?;

        match row.get::<_, Value>("settings") {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }
}

#[async_trait]
impl ConfigStore for PgGroups {
    async fn apply_fields(
        &self,
        group_id: Uuid,
        fields: &BTreeMap<String, Value>,
    ) -> Result<(), AppError> {
        let client = self.client().await?;
        let patch: Map<String, Value> = fields.clone().into_iter().collect();
        let updated = client
            .execute(queries::MERGE_GROUP_SETTINGS, &[&group_id, &Value::Object(patch)])
            .await
            .map_err(|e| store_error("Failed to update group settings", e))?;

        if updated == 0 {
            return Err(Self::missing(group_id));
        }
        info!("Applied {} rule field(s) to group {}", fields.len(), group_id);
        Ok(())
    }
}

#[async_trait]
impl MembershipService for PgGroups {
    async fn remove_from_proposal(
        &self,
        group_id: Uuid,
        payload: &MemberRemovalPayload,
    ) -> Result<(), AppError> {
        let client = self.client().await?;
        let updated = client
            .execute(queries::DEACTIVATE_MEMBER, &[&group_id, &payload.member_id])
            .await
            .map_err(|e| store_error("Failed to deactivate member", e))?;

        if updated == 0 {
            return Err(AppError::NotFound(format!(
                "Member {} not in group {}",
                payload.member_id, group_id
            )));
        }
        info!("Removed member {} from group {}", payload.member_id, group_id);
        Ok(())
    }
}

#[async_trait]
impl LoanService for PgGroups {
    async fn approve_from_proposal(
        &self,
        group_id: Uuid,
        payload: &LoanApprovalPayload,
    ) -> Result<(), AppError> {
        let client = self.client().await?;
        let updated = client
            .execute(
                queries::APPROVE_LOAN,
                &[&payload.loan_id, &group_id, &payload.borrower_id],
            )
            .await
            .map_err(|e| store_error("Failed to approve loan", e))?;

        if updated == 0 {
            return Err(AppError::NotFound(format!(
                "Loan {} for borrower {} not found in group {}",
                payload.loan_id, payload.borrower_id, group_id
            )));
        }
        info!("Approved loan {} in group {}", payload.loan_id, group_id);
        Ok(())
    }
}
