//! In-memory group adapters
//!
//! Backs the service when no database is configured, and the tests.

use super::{ConfigStore, GroupDirectory, GroupRoster, LoanService, MembershipService};
use crate::error::AppError;
use crate::governance::GovernanceModel;
use crate::proposal::{LoanApprovalPayload, MemberRemovalPayload};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Initial state of a group
#[derive(Debug, Clone)]
pub struct GroupSeed {
    pub id: Uuid,
    pub admin_id: Uuid,
    /// Includes the admin
    pub member_ids: Vec<Uuid>,
    pub governance: GovernanceModel,
    pub settings: Map<String, Value>,
}

impl GroupSeed {
    pub fn new(admin_id: Uuid, other_members: impl IntoIterator<Item = Uuid>) -> Self {
        let mut member_ids = vec![admin_id];
        member_ids.extend(other_members);
        Self {
            id: Uuid::new_v4(),
            admin_id,
            member_ids,
            governance: GovernanceModel::default(),
            settings: Map::new(),
        }
    }

    #[cfg(test)]
    pub fn with_governance(mut self, governance: GovernanceModel) -> Self {
        self.governance = governance;
        self
    }

    pub fn with_setting(mut self, key: &str, value: Value) -> Self {
        self.settings.insert(key.to_string(), value);
        self
    }
}

struct GroupRecord {
    admin_id: Uuid,
    members: Vec<Uuid>,
    removed: HashSet<Uuid>,
    governance: GovernanceModel,
    settings: Map<String, Value>,
}

/// Groups, memberships and loan approvals held in process memory
pub struct InMemoryGroups {
    groups: RwLock<HashMap<Uuid, GroupRecord>>,
    approved_loans: RwLock<HashSet<Uuid>>,
}

impl InMemoryGroups {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            approved_loans: RwLock::new(HashSet::new()),
        }
    }

    pub async fn insert_group(&self, seed: GroupSeed) -> Uuid {
        let mut groups = self.groups.write().await;
        groups.insert(
            seed.id,
            GroupRecord {
                admin_id: seed.admin_id,
                members: seed.member_ids,
                removed: HashSet::new(),
                governance: seed.governance,
                settings: seed.settings,
            },
        );
        seed.id
    }

    #[cfg(test)]
    pub async fn is_loan_approved(&self, loan_id: Uuid) -> bool {
        self.approved_loans.read().await.contains(&loan_id)
    }

    fn missing(group_id: Uuid) -> AppError {
        AppError::NotFound(format!("Group {} not found", group_id))
    }
}

impl Default for InMemoryGroups {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GroupDirectory for InMemoryGroups {
    async fn get_members(&self, group_id: Uuid) -> Result<GroupRoster, AppError> {
        let groups = self.groups.read().await;
        let group = groups.get(&group_id).ok_or_else(|| Self::missing(group_id))?;
        Ok(GroupRoster {
            member_ids: group
                .members
                .iter()
                .filter(|m| !group.removed.contains(m))
                .copied()
                .collect(),
            admin_id: group.admin_id,
        })
    }

    async fn get_governance_model(&self, group_id: Uuid) -> Result<GovernanceModel, AppError> {
        let groups = self.groups.read().await;
        groups
            .get(&group_id)
            .map(|g| g.governance)
            .ok_or_else(|| Self::missing(group_id))
    }

    async fn get_config(&self, group_id: Uuid) -> Result<Map<String, Value>, AppError> {
        let groups = self.groups.read().await;
        groups
            .get(&group_id)
            .map(|g| g.settings.clone())
            .ok_or_else(|| Self::missing(group_id))
    }
}

#[async_trait]
impl ConfigStore for InMemoryGroups {
    async fn apply_fields(
        &self,
        group_id: Uuid,
        fields: &BTreeMap<String, Value>,
    ) -> Result<(), AppError> {
        let mut groups = self.groups.write().await;
        let group = groups.get_mut(&group_id).ok_or_else(|| Self::missing(group_id))?;
        for (field, value) in fields {
            group.settings.insert(field.clone(), value.clone());
        }
        info!("Applied {} rule field(s) to group {}", fields.len(), group_id);
        Ok(())
    }
}

#[async_trait]
impl MembershipService for InMemoryGroups {
    async fn remove_from_proposal(
        &self,
        group_id: Uuid,
        payload: &MemberRemovalPayload,
    ) -> Result<(), AppError> {
        let mut groups = self.groups.write().await;
        let group = groups.get_mut(&group_id).ok_or_else(|| Self::missing(group_id))?;
        if !group.members.contains(&payload.member_id) {
            return Err(AppError::NotFound(format!(
                "Member {} not in group {}",
                payload.member_id, group_id
            )));
        }
        group.removed.insert(payload.member_id);
        info!("Removed member {} from group {}", payload.member_id, group_id);
        Ok(())
    }
}

#[async_trait]
impl LoanService for InMemoryGroups {
    async fn approve_from_proposal(
        &self,
        group_id: Uuid,
        payload: &LoanApprovalPayload,
    ) -> Result<(), AppError> {
        if !self.groups.read().await.contains_key(&group_id) {
            return Err(Self::missing(group_id));
        }
        self.approved_loans.write().await.insert(payload.loan_id);
        info!("Approved loan {} in group {}", payload.loan_id, group_id);
        Ok(())
    }
}
