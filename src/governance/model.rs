//! Governance configuration and policy types

use serde::{Deserialize, Serialize};

/// How a group authorizes changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GovernanceMode {
    /// Members vote on every change
    GroupDispute,
    /// The admin may act alone; others still need a proposal
    AdminControl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumKind {
    /// `quorum_value` is a percentage of active members
    Percentage,
    /// `quorum_value` is an absolute number of ballots
    Count,
}

/// Per-group decision rules, read once per evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceModel {
    pub mode: GovernanceMode,
    pub quorum_kind: QuorumKind,
    pub quorum_value: f64,
    pub admin_has_tiebreaker: bool,
}

impl Default for GovernanceModel {
    /// The model a group gets when none was chosen at creation
    fn default() -> Self {
        Self {
            mode: GovernanceMode::GroupDispute,
            quorum_kind: QuorumKind::Percentage,
            quorum_value: 51.0,
            admin_has_tiebreaker: true,
        }
    }
}

/// Kind of change an actor wants to make, as asked before opening a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    RuleChange,
    LoanApproval,
    MemberRemoval,
    /// First-time setup of a freshly created group
    InitialConfig,
}

/// Why a proposal is or is not needed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequirementReason {
    SoleAdmin,
    AdminControl,
    InitialSetup,
    DefaultPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRequirement {
    pub required: bool,
    pub reason: RequirementReason,
}

impl ProposalRequirement {
    pub fn bypass(reason: RequirementReason) -> Self {
        Self { required: false, reason }
    }

    pub fn required() -> Self {
        Self {
            required: true,
            reason: RequirementReason::DefaultPolicy,
        }
    }
}
