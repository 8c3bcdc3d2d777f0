//! Group collaborators
//!
//! Ports for everything the governance engine needs from the rest of the
//! savings-group backend: who belongs to a group, which rules it runs under,
//! and the domain services an approved proposal is handed to.

mod memory;
mod postgres;

pub use memory::{GroupSeed, InMemoryGroups};
pub use postgres::PgGroups;

use crate::error::AppError;
use crate::governance::GovernanceModel;
use crate::proposal::{LoanApprovalPayload, MemberRemovalPayload};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Active membership of a group at the time of the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRoster {
    pub member_ids: Vec<Uuid>,
    pub admin_id: Uuid,
}

impl GroupRoster {
    pub fn is_member(&self, user_id: Uuid) -> bool {
        self.member_ids.contains(&user_id)
    }

    pub fn is_admin(&self, user_id: Uuid) -> bool {
        self.admin_id == user_id
    }

    pub fn total_members(&self) -> usize {
        self.member_ids.len()
    }

    /// The group has exactly one active member and it is `user_id`
    pub fn is_sole_member(&self, user_id: Uuid) -> bool {
        self.member_ids.len() == 1 && self.member_ids[0] == user_id
    }
}

/// Read-only view of groups
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// `NotFound` if the group does not exist
    async fn get_members(&self, group_id: Uuid) -> Result<GroupRoster, AppError>;

    async fn get_governance_model(&self, group_id: Uuid) -> Result<GovernanceModel, AppError>;

    /// Current rule values, used to detect rule changes that change nothing
    async fn get_config(&self, group_id: Uuid) -> Result<Map<String, Value>, AppError>;
}

/// Writes approved rule values into the group configuration record
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn apply_fields(
        &self,
        group_id: Uuid,
        fields: &BTreeMap<String, Value>,
    ) -> Result<(), AppError>;
}

/// Must be idempotent per loan: reconciliation may call it again
#[async_trait]
pub trait LoanService: Send + Sync {
    async fn approve_from_proposal(
        &self,
        group_id: Uuid,
        payload: &LoanApprovalPayload,
    ) -> Result<(), AppError>;
}

/// Must be idempotent per member: reconciliation may call it again
#[async_trait]
pub trait MembershipService: Send + Sync {
    async fn remove_from_proposal(
        &self,
        group_id: Uuid,
        payload: &MemberRemovalPayload,
    ) -> Result<(), AppError>;
}
