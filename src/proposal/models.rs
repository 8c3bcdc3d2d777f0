//! Proposal data models
//!
//! A proposal is the unit of collective decision inside a savings group.
//! It is never deleted: terminal proposals stay behind as the audit record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Proposal status in the governance workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalStatus {
    /// Collecting votes
    Open,
    /// Quorum reached and the majority approved
    Approved,
    /// Quorum reached and the majority rejected, or the tie fell to rejection
    Rejected,
    /// Deadline passed before a decision
    Expired,
    /// Withdrawn by the proposer or the group admin
    Cancelled,
}

impl ProposalStatus {
    pub const ALL: [ProposalStatus; 5] = [
        ProposalStatus::Open,
        ProposalStatus::Approved,
        ProposalStatus::Rejected,
        ProposalStatus::Expired,
        ProposalStatus::Cancelled,
    ];

    /// Every status except `Open` is final
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProposalStatus::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Open => "Open",
            ProposalStatus::Approved => "Approved",
            ProposalStatus::Rejected => "Rejected",
            ProposalStatus::Expired => "Expired",
            ProposalStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProposalStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown proposal status '{}'", s))
    }
}

/// Discriminant of [`ProposalChange`], handy for logging and routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalType {
    RuleChange,
    LoanApproval,
    MemberRemoval,
}

impl fmt::Display for ProposalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProposalType::RuleChange => "RuleChange",
            ProposalType::LoanApproval => "LoanApproval",
            ProposalType::MemberRemoval => "MemberRemoval",
        };
        f.write_str(name)
    }
}

/// The change a proposal would make once approved.
///
/// Serialized as `{"type": "...", "payload": {...}}` so that, flattened into
/// the proposal, the wire shape carries `type` and `payload` side by side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ProposalChange {
    RuleChange(RuleChangePayload),
    LoanApproval(LoanApprovalPayload),
    MemberRemoval(MemberRemovalPayload),
}

impl ProposalChange {
    pub fn kind(&self) -> ProposalType {
        match self {
            ProposalChange::RuleChange(_) => ProposalType::RuleChange,
            ProposalChange::LoanApproval(_) => ProposalType::LoanApproval,
            ProposalChange::MemberRemoval(_) => ProposalType::MemberRemoval,
        }
    }
}

/// Rule change payload: field name -> {from, to}
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleChangePayload {
    pub fields: BTreeMap<String, FieldChange>,
}

impl RuleChangePayload {
    /// Target values keyed by field, as written to the group configuration
    pub fn target_values(&self) -> BTreeMap<String, Value> {
        self.fields
            .iter()
            .map(|(field, change)| (field.clone(), change.to.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Value at proposal time; overwritten with the live value on creation
    #[serde(default)]
    pub from: Value,
    pub to: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanApprovalPayload {
    pub loan_id: Uuid,
    pub borrower_id: Uuid,
    /// Principal in minor currency units
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRemovalPayload {
    pub member_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A single member's ballot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub voter_id: Uuid,
    pub approve: bool,
    pub cast_at: DateTime<Utc>,
}

/// A pending or decided collective decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: Uuid,
    pub group_id: Uuid,

    /// `type` + `payload` on the wire
    #[serde(flatten)]
    pub change: ProposalChange,

    pub status: ProposalStatus,

    pub proposed_by: Uuid,
    pub proposed_by_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Insertion order is audit order
    #[serde(default)]
    pub votes: Vec<Vote>,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,

    /// Set once the approved change reached the domain services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    /// Last application failure, kept until a reconcile succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_error: Option<String>,
    /// When a writer took responsibility for applying the change; cleared
    /// once the outcome is recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_claimed_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency token, bumped by the store on every write
    #[serde(default)]
    pub version: u64,
}

impl Proposal {
    pub fn new(
        group_id: Uuid,
        change: ProposalChange,
        proposed_by: Uuid,
        proposed_by_name: String,
        description: Option<String>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            change,
            status: ProposalStatus::Open,
            proposed_by,
            proposed_by_name,
            description,
            votes: Vec::new(),
            created_at,
            expires_at,
            resolved_at: None,
            cancelled_by: None,
            cancellation_reason: None,
            applied_at: None,
            apply_error: None,
            apply_claimed_at: None,
            version: 0,
        }
    }

    pub fn kind(&self) -> ProposalType {
        self.change.kind()
    }

    pub fn is_open(&self) -> bool {
        self.status == ProposalStatus::Open
    }

    /// Open, but its deadline has already passed
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && self.expires_at < now
    }

    pub fn vote_of(&self, voter_id: Uuid) -> Option<&Vote> {
        self.votes.iter().find(|v| v.voter_id == voter_id)
    }

    /// Move to a terminal status. `resolved_at` is written only once.
    pub fn resolve(&mut self, status: ProposalStatus, at: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        if self.is_open() {
            self.status = status;
            self.resolved_at = Some(at);
        }
    }

    pub fn expire(&mut self, at: DateTime<Utc>) {
        self.resolve(ProposalStatus::Expired, at);
    }

    pub fn cancel(&mut self, actor_id: Uuid, reason: Option<String>, at: DateTime<Utc>) {
        if self.is_open() {
            self.cancelled_by = Some(actor_id);
            self.cancellation_reason = reason;
            self.resolve(ProposalStatus::Cancelled, at);
        }
    }

    /// Approved, but the change has not reached the domain services yet
    pub fn awaiting_application(&self) -> bool {
        self.status == ProposalStatus::Approved && self.applied_at.is_none()
    }

    /// Someone claimed the application less than `lease` ago
    pub fn apply_in_progress(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.apply_claimed_at.is_some_and(|at| now - at < lease)
    }

    /// Take the application for the caller. Fails while an earlier claim is
    /// live or once the change has been applied.
    pub fn claim_application(&mut self, now: DateTime<Utc>, lease: Duration) -> bool {
        if !self.awaiting_application() || self.apply_in_progress(now, lease) {
            return false;
        }
        self.apply_claimed_at = Some(now);
        true
    }

    /// Everyone with a stake in the outcome: proposer first, then voters
    pub fn participants(&self) -> Vec<Uuid> {
        let mut ids = vec![self.proposed_by];
        for vote in &self.votes {
            if !ids.contains(&vote.voter_id) {
                ids.push(vote.voter_id);
            }
        }
        ids
    }
}
