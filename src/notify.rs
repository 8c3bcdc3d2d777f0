//! Outcome notifications
//!
//! Delivery is owned by another service; the engine only emits events.

use crate::error::AppError;
use crate::proposal::{Proposal, ProposalStatus, ProposalType};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum GovernanceEvent {
    #[serde(rename_all = "camelCase")]
    ProposalOpened {
        group_id: Uuid,
        proposal_id: Uuid,
        kind: ProposalType,
        proposed_by_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ProposalResolved {
        group_id: Uuid,
        proposal_id: Uuid,
        kind: ProposalType,
        status: ProposalStatus,
    },
}

impl GovernanceEvent {
    pub fn opened(proposal: &Proposal) -> Self {
        GovernanceEvent::ProposalOpened {
            group_id: proposal.group_id,
            proposal_id: proposal.id,
            kind: proposal.kind(),
            proposed_by_name: proposal.proposed_by_name.clone(),
        }
    }

    pub fn resolved(proposal: &Proposal) -> Self {
        GovernanceEvent::ProposalResolved {
            group_id: proposal.group_id,
            proposal_id: proposal.id,
            kind: proposal.kind(),
            status: proposal.status,
        }
    }
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify(&self, user_id: Uuid, event: &GovernanceEvent) -> Result<(), AppError>;
}

/// Emits events into the log stream for a downstream shipper to pick up
pub struct TracingNotifier;

#[async_trait]
impl NotificationGateway for TracingNotifier {
    async fn notify(&self, user_id: Uuid, event: &GovernanceEvent) -> Result<(), AppError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| AppError::Internal(format!("Failed to encode event: {}", e)))?;
        info!(target: "governance::notify", %user_id, event = %payload, "notification");
        Ok(())
    }
}
