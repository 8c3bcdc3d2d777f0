//! Hands an approved proposal to the domain service that owns the change.
//!
//! The applier holds no loan or membership rules of its own. Each change
//! variant names exactly one collaborator.

use crate::group::{ConfigStore, LoanService, MembershipService};
use crate::proposal::{Proposal, ProposalChange, ProposalStatus, ProposalType};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("Proposal {0} is {1}, only approved proposals can be applied")]
    NotApproved(Uuid, ProposalStatus),

    #[error("{kind} proposal {proposal_id} failed to apply: {source}")]
    Collaborator {
        proposal_id: Uuid,
        kind: ProposalType,
        #[source]
        source: crate::error::AppError,
    },
}

#[derive(Clone)]
pub struct ChangeApplier {
    config: Arc<dyn ConfigStore>,
    loans: Arc<dyn LoanService>,
    memberships: Arc<dyn MembershipService>,
}

impl ChangeApplier {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        loans: Arc<dyn LoanService>,
        memberships: Arc<dyn MembershipService>,
    ) -> Self {
        Self {
            config,
            loans,
            memberships,
        }
    }

    pub async fn apply(&self, proposal: &Proposal) -> Result<(), ApplyError> {
        if proposal.status != ProposalStatus::Approved {
            return Err(ApplyError::NotApproved(proposal.id, proposal.status));
        }

        let group_id = proposal.group_id;
        let outcome = match &proposal.change {
            ProposalChange::RuleChange(payload) => {
                self.config
                    .apply_fields(group_id, &payload.target_values())
                    .await
            }
            ProposalChange::LoanApproval(payload) => {
                self.loans.approve_from_proposal(group_id, payload).await
            }
            ProposalChange::MemberRemoval(payload) => {
                self.memberships.remove_from_proposal(group_id, payload).await
            }
        };

        outcome.map_err(|source| ApplyError::Collaborator {
            proposal_id: proposal.id,
            kind: proposal.kind(),
            source,
        })?;

        info!(
            proposal_id = %proposal.id,
            group_id = %group_id,
            kind = %proposal.kind(),
            "Applied approved proposal"
        );
        Ok(())
    }
}
