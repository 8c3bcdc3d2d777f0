//! Proposal lifecycle
//!
//! Owns the proposal state machine:
//!
//! ```text
//! Open --(quorum + approve)--> Approved --(apply)--> domain services
//! Open --(quorum + reject)---> Rejected
//! Open --(deadline passed)---> Expired
//! Open --(admin/proposer)----> Cancelled
//! ```
//!
//! Every mutation is a read-modify-write unit committed with a conditional
//! write on the proposal version. Losing a race means re-reading and
//! re-running the whole unit, so concurrent ballots are never dropped and a
//! ballot can never land on a proposal a concurrent cancel just closed.

use crate::config::GovernanceConfig;
use crate::error::{not_found_error, AppError};
use crate::governance::applier::{ApplyError, ChangeApplier};
use crate::governance::evaluator;
use crate::governance::{ChangeType, GovernanceMode, GovernanceModel, ProposalRequirement, RequirementReason};
use crate::group::{GroupDirectory, GroupRoster};
use crate::notify::{GovernanceEvent, NotificationGateway};
use crate::proposal::{
    FieldChange, Proposal, ProposalChange, ProposalStatus, ProposalStore, RuleChangePayload, Vote,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

static FIELD_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("field name pattern compiles"));

/// Rule fields are plain identifiers in the group configuration record
pub fn is_valid_field_name(name: &str) -> bool {
    name.len() <= 64 && FIELD_NAME.is_match(name)
}

/// Input for opening a proposal
#[derive(Debug, Clone)]
pub struct CreateProposalData {
    pub change: ProposalChange,
    pub proposed_by: Uuid,
    pub proposed_by_name: String,
    pub description: Option<String>,
    /// Overrides the configured lifetime; must lie in the future
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of one committed read-modify-write unit
struct Committed {
    before: ProposalStatus,
    proposal: Proposal,
    /// The unit found the proposal overdue and expired it instead of running
    expired: bool,
}

pub struct ProposalService {
    store: Arc<dyn ProposalStore>,
    directory: Arc<dyn GroupDirectory>,
    applier: ChangeApplier,
    notifier: Arc<dyn NotificationGateway>,
    config: GovernanceConfig,
}

impl ProposalService {
    pub fn new(
        store: Arc<dyn ProposalStore>,
        directory: Arc<dyn GroupDirectory>,
        applier: ChangeApplier,
        notifier: Arc<dyn NotificationGateway>,
        config: GovernanceConfig,
    ) -> Self {
        Self {
            store,
            directory,
            applier,
            notifier,
            config,
        }
    }

    // =========================================================================
    // POLICY
    // =========================================================================

    /// Whether `actor_id` must open a proposal to make a change of `change_type`
    pub async fn requires_proposal(
        &self,
        group_id: Uuid,
        change_type: ChangeType,
        actor_id: Uuid,
    ) -> Result<ProposalRequirement, AppError> {
        let roster = self.roster(group_id).await?;

        if roster.is_sole_member(actor_id) {
            return Ok(ProposalRequirement::bypass(RequirementReason::SoleAdmin));
        }

        if roster.is_admin(actor_id) {
            let model = self.model(group_id).await?;
            if model.mode == GovernanceMode::AdminControl {
                return Ok(ProposalRequirement::bypass(RequirementReason::AdminControl));
            }
            if change_type == ChangeType::InitialConfig {
                return Ok(ProposalRequirement::bypass(RequirementReason::InitialSetup));
            }
        }

        Ok(ProposalRequirement::required())
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    pub async fn create_proposal(
        &self,
        group_id: Uuid,
        data: CreateProposalData,
    ) -> Result<Proposal, AppError> {
        let roster = self.roster(group_id).await?;
        if !roster.is_member(data.proposed_by) {
            return Err(AppError::NotMember(format!(
                "User {} is not an active member of group {}",
                data.proposed_by, group_id
            )));
        }

        let proposed_by_name = data.proposed_by_name.trim().to_string();
        if proposed_by_name.is_empty() {
            return Err(AppError::Validation("Proposer name is required".to_string()));
        }

        let now = Utc::now();
        let expires_at = match data.expires_at {
            Some(at) if at <= now => {
                return Err(AppError::Validation(
                    "Proposal expiry must be in the future".to_string(),
                ))
            }
            Some(at) => at,
            None => now + self.config.proposal_ttl(),
        };

        let change = self.normalize_change(group_id, &roster, data.change).await?;
        let proposal = Proposal::new(
            group_id,
            change,
            data.proposed_by,
            proposed_by_name,
            data.description,
            now,
            expires_at,
        );

        let stored = self
            .timed("create proposal", self.store.create(&proposal))
            .await?;

        info!(
            proposal_id = %stored.id,
            group_id = %group_id,
            kind = %stored.kind(),
            expires_at = %stored.expires_at,
            "Proposal opened"
        );

        let event = GovernanceEvent::opened(&stored);
        let recipients = roster
            .member_ids
            .iter()
            .copied()
            .filter(|&id| id != stored.proposed_by);
        self.broadcast(recipients, &event).await;

        Ok(stored)
    }

    /// Record a ballot and evaluate the proposal in the same atomic unit
    pub async fn cast_vote(
        &self,
        group_id: Uuid,
        proposal_id: Uuid,
        voter_id: Uuid,
        approve: bool,
    ) -> Result<Proposal, AppError> {
        let roster = self.roster(group_id).await?;
        let model = self.model(group_id).await?;
        let lease = self.config.apply_lease();
        let mut evaluation = None;

        let committed = self
            .commit(group_id, proposal_id, |proposal, now| {
                if !roster.is_member(voter_id) {
                    return Err(AppError::NotMember(format!(
                        "User {} is not an active member of group {}",
                        voter_id, group_id
                    )));
                }
                ensure_open(proposal)?;
                if proposal.vote_of(voter_id).is_some() {
                    return Err(AppError::AlreadyVoted(format!(
                        "User {} already voted on proposal {}",
                        voter_id, proposal.id
                    )));
                }

                proposal.votes.push(Vote {
                    voter_id,
                    approve,
                    cast_at: now,
                });

                let result = evaluator::evaluate(
                    proposal,
                    &model,
                    roster.total_members(),
                    roster.admin_id,
                    now,
                );
                if let Some(at) = result.resolved_at {
                    proposal.resolve(result.status, at);
                    // The deciding write also takes the application
                    proposal.claim_application(at, lease);
                }
                evaluation = Some(result);
                Ok(())
            })
            .await?;

        if committed.expired {
            self.announce_resolution(&committed.proposal).await;
            return Err(expired_error(&committed.proposal));
        }

        let proposal = committed.proposal;
        if let Some(result) = evaluation {
            debug!(
                proposal_id = %proposal.id,
                approve = result.tally.approve,
                reject = result.tally.reject,
                quorum_reached = result.quorum_reached,
                tie_broken_by_admin = result.tie_broken_by_admin,
                decided = result.is_decision(),
                "Proposal evaluated"
            );
        }
        info!(proposal_id = %proposal.id, voter_id = %voter_id, approve, "Vote recorded");

        if committed.before == ProposalStatus::Open && proposal.status.is_terminal() {
            info!(proposal_id = %proposal.id, status = %proposal.status, "Proposal decided");
            self.announce_resolution(&proposal).await;
            if proposal.status == ProposalStatus::Approved {
                return Ok(self.apply_approved(proposal).await);
            }
        }

        Ok(proposal)
    }

    /// Close an open proposal. Only its proposer or the group admin may do so.
    pub async fn cancel_proposal(
        &self,
        group_id: Uuid,
        proposal_id: Uuid,
        actor_id: Uuid,
        reason: Option<String>,
    ) -> Result<Proposal, AppError> {
        let roster = self.roster(group_id).await?;

        let committed = self
            .commit(group_id, proposal_id, |proposal, now| {
                if !roster.is_admin(actor_id) && proposal.proposed_by != actor_id {
                    return Err(AppError::Forbidden(
                        "Only the proposer or the group admin can cancel a proposal".to_string(),
                    ));
                }
                ensure_open(proposal)?;
                proposal.cancel(actor_id, reason.clone(), now);
                Ok(())
            })
            .await?;

        if committed.expired {
            self.announce_resolution(&committed.proposal).await;
            return Err(expired_error(&committed.proposal));
        }

        info!(proposal_id = %proposal_id, actor_id = %actor_id, "Proposal cancelled");
        self.announce_resolution(&committed.proposal).await;
        Ok(committed.proposal)
    }

    /// Retry application of an approved proposal that never reached its domain service.
    ///
    /// A no-op for proposals already applied, and while another writer holds
    /// a live claim on the application.
    pub async fn reconcile(
        &self,
        group_id: Uuid,
        proposal_id: Uuid,
        actor_id: Uuid,
    ) -> Result<Proposal, AppError> {
        let roster = self.roster(group_id).await?;
        if !roster.is_admin(actor_id) {
            return Err(AppError::Forbidden(
                "Only the group admin can reconcile proposals".to_string(),
            ));
        }

        let lease = self.config.apply_lease();
        let mut claimed = false;
        let committed = self
            .commit(group_id, proposal_id, |proposal, now| {
                if proposal.status != ProposalStatus::Approved {
                    return Err(AppError::InvalidState(format!(
                        "Proposal {} is {}, only approved proposals can be reconciled",
                        proposal.id, proposal.status
                    )));
                }
                claimed = proposal.claim_application(now, lease);
                Ok(())
            })
            .await?;

        if committed.expired {
            self.announce_resolution(&committed.proposal).await;
            return Err(expired_error(&committed.proposal));
        }

        let proposal = committed.proposal;
        if !claimed {
            if proposal.applied_at.is_some() {
                debug!(proposal_id = %proposal.id, "Proposal already applied, nothing to reconcile");
            } else {
                info!(proposal_id = %proposal.id, "Application already in progress, not reconciling");
            }
            return Ok(proposal);
        }

        info!(proposal_id = %proposal.id, "Reconciling approved proposal");
        Ok(self.apply_approved(proposal).await)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Proposals are visible to members of their group only
    pub async fn get_proposal(
        &self,
        group_id: Uuid,
        proposal_id: Uuid,
        viewer_id: Uuid,
    ) -> Result<Proposal, AppError> {
        self.ensure_member(group_id, viewer_id).await?;
        let proposal = self.load(group_id, proposal_id).await?;
        self.refresh(proposal).await
    }

    pub async fn list_proposals(
        &self,
        group_id: Uuid,
        viewer_id: Uuid,
        status: Option<ProposalStatus>,
    ) -> Result<Vec<Proposal>, AppError> {
        // Unknown groups are NotFound rather than an empty list
        self.ensure_member(group_id, viewer_id).await?;

        // Filter after refreshing so overdue proposals are reported as Expired
        let stored = self
            .timed("list proposals", self.store.list_by_group(group_id, None))
            .await?;

        let mut proposals = Vec::with_capacity(stored.len());
        for proposal in stored {
            let proposal = self.refresh(proposal).await?;
            if status.map_or(true, |s| proposal.status == s) {
                proposals.push(proposal);
            }
        }
        Ok(proposals)
    }

    /// Expire every overdue open proposal. Returns how many were expired.
    pub async fn sweep_expired(&self) -> Result<usize, AppError> {
        let now = Utc::now();
        let open = self.timed("list open proposals", self.store.list_open()).await?;

        let mut expired = 0;
        for proposal in open.into_iter().filter(|p| p.is_overdue(now)) {
            let id = proposal.id;
            match self.refresh(proposal).await {
                Ok(p) if p.status == ProposalStatus::Expired => expired += 1,
                Ok(_) => {}
                Err(e) => warn!(proposal_id = %id, error = %e, "Failed to expire proposal"),
            }
        }
        Ok(expired)
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    /// Run `op` against the latest stored proposal and commit it conditionally.
    ///
    /// An overdue proposal is expired instead of running `op`. A unit that
    /// changes nothing is not written.
    async fn commit<F>(&self, group_id: Uuid, proposal_id: Uuid, mut op: F) -> Result<Committed, AppError>
    where
        F: FnMut(&mut Proposal, DateTime<Utc>) -> Result<(), AppError>,
    {
        let attempts = self.config.max_write_attempts;
        for attempt in 1..=attempts {
            let current = self.load(group_id, proposal_id).await?;
            let now = Utc::now();
            let mut next = current.clone();

            let expired = next.is_overdue(now);
            if expired {
                next.expire(now);
            } else {
                op(&mut next, now)?;
            }

            if next == current {
                return Ok(Committed {
                    before: current.status,
                    proposal: current,
                    expired: false,
                });
            }

            match self
                .timed("write proposal", self.store.update_if_version(&next, current.version))
                .await
            {
                Ok(stored) => {
                    if expired {
                        info!(proposal_id = %proposal_id, "Proposal expired");
                    }
                    return Ok(Committed {
                        before: current.status,
                        proposal: stored,
                        expired,
                    });
                }
                Err(AppError::Conflict(reason)) => {
                    debug!(proposal_id = %proposal_id, attempt, %reason, "Concurrent write, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(proposal_id = %proposal_id, attempts, "Gave up after repeated write conflicts");
        Err(AppError::StoreUnavailable(format!(
            "Proposal {} kept changing, gave up after {} attempts",
            proposal_id, attempts
        )))
    }

    /// Lazily expire a proposal read from the store
    async fn refresh(&self, proposal: Proposal) -> Result<Proposal, AppError> {
        if !proposal.is_overdue(Utc::now()) {
            return Ok(proposal);
        }
        let committed = self
            .commit(proposal.group_id, proposal.id, |_, _| Ok(()))
            .await?;
        if committed.expired {
            self.announce_resolution(&committed.proposal).await;
        }
        Ok(committed.proposal)
    }

    /// Hand an approved proposal to the applier and record the outcome.
    ///
    /// Failures never revert the decision; they are logged and stored for
    /// reconciliation.
    async fn apply_approved(&self, proposal: Proposal) -> Proposal {
        let outcome: Result<(), ApplyError> = self.applier.apply(&proposal).await;
        if let Err(e) = &outcome {
            error!(
                proposal_id = %proposal.id,
                group_id = %proposal.group_id,
                kind = %proposal.kind(),
                error = %e,
                "ApplyFailed: approved proposal is awaiting reconciliation"
            );
        }

        let recorded = self
            .commit(proposal.group_id, proposal.id, |p, now| {
                match &outcome {
                    Ok(()) => {
                        p.applied_at.get_or_insert(now);
                        p.apply_error = None;
                    }
                    Err(e) if p.applied_at.is_none() => p.apply_error = Some(e.to_string()),
                    Err(_) => {}
                }
                p.apply_claimed_at = None;
                Ok(())
            })
            .await;

        match recorded {
            Ok(committed) => committed.proposal,
            Err(e) => {
                warn!(proposal_id = %proposal.id, error = %e, "Failed to record application outcome");
                proposal
            }
        }
    }

    /// Validate a requested change and pin rule changes to the live configuration
    async fn normalize_change(
        &self,
        group_id: Uuid,
        roster: &GroupRoster,
        change: ProposalChange,
    ) -> Result<ProposalChange, AppError> {
        match change {
            ProposalChange::RuleChange(payload) => {
                if payload.fields.is_empty() {
                    return Err(AppError::Validation(
                        "A rule change must name at least one field".to_string(),
                    ));
                }
                if let Some(bad) = payload.fields.keys().find(|f| !is_valid_field_name(f)) {
                    return Err(AppError::Validation(format!("Invalid rule field '{}'", bad)));
                }

                let current = self
                    .timed("load group config", self.directory.get_config(group_id))
                    .await?;

                let fields: BTreeMap<String, FieldChange> = payload
                    .fields
                    .into_iter()
                    .filter_map(|(field, change)| {
                        let from = current.get(&field).cloned().unwrap_or(Value::Null);
                        (from != change.to).then(|| (field, FieldChange { from, to: change.to }))
                    })
                    .collect();

                if fields.is_empty() {
                    return Err(AppError::NoChangeDetected(
                        "Every proposed value matches the current group rules".to_string(),
                    ));
                }
                Ok(ProposalChange::RuleChange(RuleChangePayload { fields }))
            }
            ProposalChange::LoanApproval(payload) => {
                if payload.amount <= 0 {
                    return Err(AppError::Validation(
                        "Loan amount must be positive".to_string(),
                    ));
                }
                Ok(ProposalChange::LoanApproval(payload))
            }
            ProposalChange::MemberRemoval(payload) => {
                if !roster.is_member(payload.member_id) {
                    return Err(AppError::Validation(format!(
                        "User {} is not an active member of group {}",
                        payload.member_id, group_id
                    )));
                }
                if roster.is_admin(payload.member_id) {
                    return Err(AppError::Validation(
                        "The group admin cannot be removed by proposal".to_string(),
                    ));
                }
                Ok(ProposalChange::MemberRemoval(payload))
            }
        }
    }

    async fn load(&self, group_id: Uuid, proposal_id: Uuid) -> Result<Proposal, AppError> {
        self.timed("load proposal", self.store.get(group_id, proposal_id))
            .await?
            .ok_or_else(|| {
                not_found_error(format!(
                    "Proposal {} not found in group {}",
                    proposal_id, group_id
                ))
            })
    }

    async fn ensure_member(&self, group_id: Uuid, user_id: Uuid) -> Result<(), AppError> {
        if self.roster(group_id).await?.is_member(user_id) {
            Ok(())
        } else {
            Err(AppError::NotMember(format!(
                "User {} is not an active member of group {}",
                user_id, group_id
            )))
        }
    }

    async fn roster(&self, group_id: Uuid) -> Result<GroupRoster, AppError> {
        self.timed("load group members", self.directory.get_members(group_id))
            .await
    }

    async fn model(&self, group_id: Uuid) -> Result<GovernanceModel, AppError> {
        self.timed("load governance model", self.directory.get_governance_model(group_id))
            .await
    }

    /// Bound a store or directory round trip
    async fn timed<T>(
        &self,
        what: &str,
        fut: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        match tokio::time::timeout(self.config.store_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::StoreUnavailable(format!(
                "{} timed out after {}ms",
                what, self.config.store_timeout_ms
            ))),
        }
    }

    async fn announce_resolution(&self, proposal: &Proposal) {
        let event = GovernanceEvent::resolved(proposal);
        self.broadcast(proposal.participants(), &event).await;
    }

    async fn broadcast(&self, recipients: impl IntoIterator<Item = Uuid>, event: &GovernanceEvent) {
        for user_id in recipients {
            if let Err(e) = self.notifier.notify(user_id, event).await {
                warn!(user_id = %user_id, error = %e, "Notification delivery failed");
            }
        }
    }
}

fn ensure_open(proposal: &Proposal) -> Result<(), AppError> {
    if proposal.is_open() {
        Ok(())
    } else {
        Err(AppError::InvalidState(format!(
            "Proposal {} is {}",
            proposal.id, proposal.status
        )))
    }
}

fn expired_error(proposal: &Proposal) -> AppError {
    AppError::InvalidState(format!(
        "Proposal {} expired at {}",
        proposal.id, proposal.expires_at
    ))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::governance::QuorumKind;
    use crate::group::{ConfigStore, GroupSeed, InMemoryGroups};
    use crate::notify::testing::RecordingNotifier;
    use crate::proposal::{InMemoryProposalStore, LoanApprovalPayload, MemberRemovalPayload};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn percentage(value: f64) -> GovernanceModel {
        GovernanceModel {
            quorum_kind: QuorumKind::Percentage,
            quorum_value: value,
            ..GovernanceModel::default()
        }
    }

    fn admin_control() -> GovernanceModel {
        GovernanceModel {
            mode: GovernanceMode::AdminControl,
            ..GovernanceModel::default()
        }
    }

    // -------------------------------------------------------------------------
    // requires_proposal
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_sole_admin_never_requires_proposal() {
        let h = Harness::new(1, GovernanceModel::default()).await;
        for change_type in [
            ChangeType::RuleChange,
            ChangeType::LoanApproval,
            ChangeType::MemberRemoval,
            ChangeType::InitialConfig,
        ] {
            let req = h.service.requires_proposal(h.group_id, change_type, h.admin).await.unwrap();
            assert_eq!(req, ProposalRequirement::bypass(RequirementReason::SoleAdmin));
        }
    }

    #[tokio::test]
    async fn test_admin_control_bypasses_for_admin_only() {
        let h = Harness::new(3, admin_control()).await;
        let admin = h.service.requires_proposal(h.group_id, ChangeType::LoanApproval, h.admin).await.unwrap();
        assert_eq!(admin.reason, RequirementReason::AdminControl);
        assert!(!admin.required);

        let member = h.service.requires_proposal(h.group_id, ChangeType::LoanApproval, h.members[1]).await.unwrap();
        assert_eq!(member, ProposalRequirement::required());
    }

    #[tokio::test]
    async fn test_initial_config_by_admin_bypasses() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let req = h.service.requires_proposal(h.group_id, ChangeType::InitialConfig, h.admin).await.unwrap();
        assert_eq!(req, ProposalRequirement::bypass(RequirementReason::InitialSetup));

        let other = h.service.requires_proposal(h.group_id, ChangeType::InitialConfig, h.members[2]).await.unwrap();
        assert!(other.required);

        let rule = h.service.requires_proposal(h.group_id, ChangeType::RuleChange, h.admin).await.unwrap();
        assert_eq!(rule.reason, RequirementReason::DefaultPolicy);
    }

    // -------------------------------------------------------------------------
    // create_proposal
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_create_pins_from_to_live_value() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let proposal = h.open_rule_change(h.members[1]).await;

        assert_eq!(proposal.status, ProposalStatus::Open);
        assert_eq!(proposal.version, 1);
        assert_eq!(proposal.expires_at - proposal.created_at, chrono::Duration::days(7));
        match &proposal.change {
            ProposalChange::RuleChange(p) => {
                assert_eq!(p.fields["contributionAmount"], FieldChange { from: json!(100), to: json!(150) });
            }
            other => panic!("unexpected change {:?}", other),
        }

        // Everyone but the proposer hears about it
        let sent = h.notifier.sent.lock().await;
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(user, _)| *user != h.members[1]));
    }

    #[tokio::test]
    async fn test_create_rejects_unchanged_rule() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let err = h
            .service
            .create_proposal(h.group_id, h.data(h.admin, Harness::rule_change(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoChangeDetected(_)));
    }

    #[tokio::test]
    async fn test_create_drops_unchanged_fields() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let mut fields = BTreeMap::new();
        fields.insert("contributionAmount".to_string(), FieldChange { from: Value::Null, to: json!(100) });
        fields.insert("cycleDays".to_string(), FieldChange { from: Value::Null, to: json!(14) });
        let change = ProposalChange::RuleChange(RuleChangePayload { fields });

        let proposal = h.service.create_proposal(h.group_id, h.data(h.admin, change)).await.unwrap();
        match proposal.change {
            ProposalChange::RuleChange(p) => {
                assert_eq!(p.fields.keys().collect::<Vec<_>>(), vec!["cycleDays"]);
            }
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_validates_payloads() {
        let h = Harness::new(3, GovernanceModel::default()).await;

        let empty = ProposalChange::RuleChange(RuleChangePayload::default());
        let err = h.service.create_proposal(h.group_id, h.data(h.admin, empty)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let loan = ProposalChange::LoanApproval(LoanApprovalPayload {
            loan_id: Uuid::new_v4(),
            borrower_id: h.members[1],
            amount: 0,
            note: None,
        });
        let err = h.service.create_proposal(h.group_id, h.data(h.admin, loan)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let remove_admin = ProposalChange::MemberRemoval(MemberRemovalPayload { member_id: h.admin, reason: None });
        let err = h.service.create_proposal(h.group_id, h.data(h.members[1], remove_admin)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_by_outsider_is_not_member() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let err = h
            .service
            .create_proposal(h.group_id, h.data(Uuid::new_v4(), Harness::rule_change(150)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotMember(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_past_expiry() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let mut data = h.data(h.admin, Harness::rule_change(150));
        data.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        let err = h.service.create_proposal(h.group_id, data).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    // -------------------------------------------------------------------------
    // cast_vote
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_quorum_reached_on_sixth_vote_of_ten() {
        let h = Harness::new(10, percentage(51.0)).await;
        let proposal = h.open_rule_change(h.members[1]).await;

        for voter in &h.members[..5] {
            let p = h.service.cast_vote(h.group_id, proposal.id, *voter, true).await.unwrap();
            assert_eq!(p.status, ProposalStatus::Open);
        }

        let decided = h.service.cast_vote(h.group_id, proposal.id, h.members[5], true).await.unwrap();
        assert_eq!(decided.status, ProposalStatus::Approved);
        assert_eq!(decided.votes.len(), 6);
        assert!(decided.resolved_at.is_some());
        assert!(decided.applied_at.is_some());

        let config = h.groups.get_config(h.group_id).await.unwrap();
        assert_eq!(config["contributionAmount"], json!(150));
    }

    #[tokio::test]
    async fn test_tie_with_admin_approval_approves() {
        let h = Harness::new(10, percentage(51.0)).await;
        let proposal = h.open_rule_change(h.members[1]).await;

        // admin + 2 approve, 3 reject
        let ballots = [(0, true), (1, true), (2, true), (3, false), (4, false)];
        for (i, approve) in ballots {
            h.service.cast_vote(h.group_id, proposal.id, h.members[i], approve).await.unwrap();
        }
        let decided = h.service.cast_vote(h.group_id, proposal.id, h.members[5], false).await.unwrap();
        assert_eq!(decided.status, ProposalStatus::Approved);
    }

    #[tokio::test]
    async fn test_tie_without_admin_vote_rejects() {
        let h = Harness::new(10, percentage(51.0)).await;
        let proposal = h.open_rule_change(h.members[1]).await;

        let ballots = [(1, true), (2, true), (3, true), (4, false), (5, false)];
        for (i, approve) in ballots {
            h.service.cast_vote(h.group_id, proposal.id, h.members[i], approve).await.unwrap();
        }
        let decided = h.service.cast_vote(h.group_id, proposal.id, h.members[6], false).await.unwrap();
        assert_eq!(decided.status, ProposalStatus::Rejected);
        assert!(decided.applied_at.is_none());
        assert_eq!(h.config_store.calls(), 0);
    }

    #[tokio::test]
    async fn test_vote_by_outsider_is_not_member() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let proposal = h.open_rule_change(h.admin).await;
        let err = h.service.cast_vote(h.group_id, proposal.id, Uuid::new_v4(), true).await.unwrap_err();
        assert!(matches!(err, AppError::NotMember(_)));
    }

    #[tokio::test]
    async fn test_second_vote_from_same_member_is_rejected() {
        let h = Harness::new(10, percentage(51.0)).await;
        let proposal = h.open_rule_change(h.admin).await;

        h.service.cast_vote(h.group_id, proposal.id, h.members[1], true).await.unwrap();
        let err = h.service.cast_vote(h.group_id, proposal.id, h.members[1], false).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyVoted(_)));

        let stored = h.service.get_proposal(h.group_id, proposal.id, h.admin).await.unwrap();
        assert_eq!(stored.votes.len(), 1);
        assert!(stored.votes[0].approve);
    }

    #[tokio::test]
    async fn test_vote_on_overdue_proposal_expires_it() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let proposal = h.insert_overdue(h.admin).await;

        let err = h.service.cast_vote(h.group_id, proposal.id, h.members[1], true).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));

        let stored = h.store.get(h.group_id, proposal.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProposalStatus::Expired);
        assert!(stored.votes.is_empty());
        assert!(stored.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_read_expires_overdue_proposal() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let proposal = h.insert_overdue(h.members[1]).await;

        let read = h.service.get_proposal(h.group_id, proposal.id, h.admin).await.unwrap();
        assert_eq!(read.status, ProposalStatus::Expired);

        let listed = h.service.list_proposals(h.group_id, h.admin, Some(ProposalStatus::Open)).await.unwrap();
        assert!(listed.is_empty());

        let sent = h.notifier.sent.lock().await;
        assert!(sent
            .iter()
            .any(|(user, event)| *user == h.members[1] && *event == GovernanceEvent::resolved(&read)));
    }

    #[tokio::test]
    async fn test_vote_after_decision_is_invalid_state_and_applies_once() {
        let h = Harness::new(3, GovernanceModel {
            quorum_kind: QuorumKind::Count,
            quorum_value: 2.0,
            ..GovernanceModel::default()
        })
        .await;
        let proposal = h.open_rule_change(h.admin).await;

        h.service.cast_vote(h.group_id, proposal.id, h.members[0], true).await.unwrap();
        let decided = h.service.cast_vote(h.group_id, proposal.id, h.members[1], true).await.unwrap();
        assert_eq!(decided.status, ProposalStatus::Approved);

        let err = h.service.cast_vote(h.group_id, proposal.id, h.members[2], false).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));

        let reconciled = h.service.reconcile(h.group_id, proposal.id, h.admin).await.unwrap();
        assert_eq!(reconciled.status, ProposalStatus::Approved);
        assert_eq!(h.config_store.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_votes_are_not_lost() {
        let h = Harness::new(10, percentage(51.0)).await;
        let proposal_id = h.open_rule_change(h.admin).await.id;

        let (a, b) = (h.members[1], h.members[2]);
        let first = {
            let service = h.service.clone();
            let group_id = h.group_id;
            tokio::spawn(async move { service.cast_vote(group_id, proposal_id, a, true).await })
        };
        let second = {
            let service = h.service.clone();
            let group_id = h.group_id;
            tokio::spawn(async move { service.cast_vote(group_id, proposal_id, b, false).await })
        };

        assert_ok!(first.await.unwrap());
        assert_ok!(second.await.unwrap());

        let stored = h.service.get_proposal(h.group_id, proposal_id, h.admin).await.unwrap();
        assert_eq!(stored.votes.len(), 2);
        assert_eq!(stored.version, 3);
    }

    // -------------------------------------------------------------------------
    // cancel_proposal
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_proposer_can_cancel() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let proposal = h.open_rule_change(h.members[1]).await;

        let cancelled = h
            .service
            .cancel_proposal(h.group_id, proposal.id, h.members[1], Some("typo".to_string()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, ProposalStatus::Cancelled);
        assert_eq!(cancelled.cancelled_by, Some(h.members[1]));
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("typo"));
    }

    #[tokio::test]
    async fn test_admin_can_cancel() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let proposal = h.open_rule_change(h.members[1]).await;
        let cancelled = h.service.cancel_proposal(h.group_id, proposal.id, h.admin, None).await.unwrap();
        assert_eq!(cancelled.status, ProposalStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_other_member_cannot_cancel() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let proposal = h.open_rule_change(h.members[1]).await;
        let err = h.service.cancel_proposal(h.group_id, proposal.id, h.members[2], None).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_cancel_terminal_proposal_is_invalid_state() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let proposal = h.open_rule_change(h.members[1]).await;
        h.service.cancel_proposal(h.group_id, proposal.id, h.admin, None).await.unwrap();

        let err = h.service.cancel_proposal(h.group_id, proposal.id, h.members[1], None).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));

        let err = h.service.cast_vote(h.group_id, proposal.id, h.members[2], true).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_racing_deciding_vote_has_one_winner() {
        for _ in 0..20 {
            let h = Harness::new(2, GovernanceModel {
                quorum_kind: QuorumKind::Count,
                quorum_value: 1.0,
                ..GovernanceModel::default()
            })
            .await;
            let proposal_id = h.open_rule_change(h.admin).await.id;
            let (group_id, admin, voter) = (h.group_id, h.admin, h.members[1]);

            let cancel = {
                let service = h.service.clone();
                tokio::spawn(async move { service.cancel_proposal(group_id, proposal_id, admin, None).await })
            };
            let vote = {
                let service = h.service.clone();
                tokio::spawn(async move { service.cast_vote(group_id, proposal_id, voter, true).await })
            };
            let (cancel, vote) = (cancel.await.unwrap(), vote.await.unwrap());

            let stored = h.store.get(group_id, proposal_id).await.unwrap().unwrap();
            match stored.status {
                ProposalStatus::Cancelled => {
                    assert_ok!(cancel);
                    assert!(matches!(vote, Err(AppError::InvalidState(_))));
                    assert!(stored.votes.is_empty());
                    assert_eq!(h.config_store.calls(), 0);
                }
                ProposalStatus::Approved => {
                    assert_ok!(vote);
                    assert!(matches!(cancel, Err(AppError::InvalidState(_))));
                    assert_eq!(stored.votes.len(), 1);
                    assert!(stored.applied_at.is_some());
                    assert_eq!(h.config_store.calls(), 1);
                }
                other => panic!("unexpected status {}", other),
            }
        }
    }

    // -------------------------------------------------------------------------
    // application
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_apply_failure_keeps_approval_and_reconcile_recovers() {
        let h = Harness::new(2, GovernanceModel {
            quorum_kind: QuorumKind::Count,
            quorum_value: 1.0,
            ..GovernanceModel::default()
        })
        .await;
        h.config_store.set_failing(true);
        let proposal = h.open_rule_change(h.admin).await;

        let decided = h.service.cast_vote(h.group_id, proposal.id, h.members[1], true).await.unwrap();
        assert_eq!(decided.status, ProposalStatus::Approved);
        assert!(decided.applied_at.is_none());
        assert!(decided.apply_error.is_some());

        let err = h.service.reconcile(h.group_id, proposal.id, h.members[1]).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        h.config_store.set_failing(false);
        let reconciled = h.service.reconcile(h.group_id, proposal.id, h.admin).await.unwrap();
        assert_eq!(reconciled.status, ProposalStatus::Approved);
        assert!(reconciled.applied_at.is_some());
        assert!(reconciled.apply_error.is_none());
        assert_eq!(h.config_store.calls(), 2);
    }

    fn quorum_of_one() -> GovernanceModel {
        GovernanceModel {
            quorum_kind: QuorumKind::Count,
            quorum_value: 1.0,
            ..GovernanceModel::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reconcile_during_inflight_apply_is_noop() {
        let h = Harness::new(2, quorum_of_one()).await;
        h.config_store.set_delay(200);
        let proposal_id = h.open_rule_change(h.admin).await.id;

        let vote = {
            let service = h.service.clone();
            let (group_id, voter) = (h.group_id, h.members[1]);
            tokio::spawn(async move { service.cast_vote(group_id, proposal_id, voter, true).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let reconciled = h.service.reconcile(h.group_id, proposal_id, h.admin).await.unwrap();
        assert_eq!(reconciled.status, ProposalStatus::Approved);
        assert!(reconciled.applied_at.is_none());
        assert!(reconciled.apply_claimed_at.is_some());

        let decided = vote.await.unwrap().unwrap();
        assert!(decided.applied_at.is_some());
        assert!(decided.apply_claimed_at.is_none());
        assert_eq!(h.config_store.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reconciles_apply_once() {
        let h = Harness::new(2, quorum_of_one()).await;
        h.config_store.set_failing(true);
        let proposal_id = h.open_rule_change(h.admin).await.id;
        let decided = h.service.cast_vote(h.group_id, proposal_id, h.members[1], true).await.unwrap();
        assert!(decided.apply_error.is_some());
        assert!(decided.apply_claimed_at.is_none());

        h.config_store.set_failing(false);
        h.config_store.set_delay(100);
        let spawn_reconcile = || {
            let service = h.service.clone();
            let (group_id, admin) = (h.group_id, h.admin);
            tokio::spawn(async move { service.reconcile(group_id, proposal_id, admin).await })
        };
        let (first, second) = (spawn_reconcile(), spawn_reconcile());
        assert_ok!(first.await.unwrap());
        assert_ok!(second.await.unwrap());

        assert_eq!(h.config_store.calls(), 2);
        let stored = h.store.get(h.group_id, proposal_id).await.unwrap().unwrap();
        assert!(stored.applied_at.is_some());
        assert!(stored.apply_claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_takes_over_lapsed_claim_only() {
        let h = Harness::new(2, quorum_of_one()).await;
        let now = Utc::now();
        let approved_with_claim = |claimed_at| {
            let mut proposal = Proposal::new(
                h.group_id,
                Harness::rule_change(150),
                h.admin,
                "Member".to_string(),
                None,
                now - chrono::Duration::hours(1),
                now + chrono::Duration::days(6),
            );
            proposal.resolve(ProposalStatus::Approved, claimed_at);
            proposal.apply_claimed_at = Some(claimed_at);
            proposal
        };

        let lapsed = h.store.create(&approved_with_claim(now - chrono::Duration::minutes(10))).await.unwrap();
        let reconciled = h.service.reconcile(h.group_id, lapsed.id, h.admin).await.unwrap();
        assert!(reconciled.applied_at.is_some());
        assert_eq!(h.config_store.calls(), 1);

        let held = h.store.create(&approved_with_claim(now - chrono::Duration::minutes(1))).await.unwrap();
        let reconciled = h.service.reconcile(h.group_id, held.id, h.admin).await.unwrap();
        assert!(reconciled.applied_at.is_none());
        assert_eq!(h.config_store.calls(), 1);
    }

    #[tokio::test]
    async fn test_member_removal_shrinks_roster() {
        let h = Harness::new(3, GovernanceModel {
            quorum_kind: QuorumKind::Count,
            quorum_value: 2.0,
            ..GovernanceModel::default()
        })
        .await;
        let target = h.members[2];
        let change = ProposalChange::MemberRemoval(MemberRemovalPayload { member_id: target, reason: None });
        let proposal = h.service.create_proposal(h.group_id, h.data(h.admin, change)).await.unwrap();

        h.service.cast_vote(h.group_id, proposal.id, h.admin, true).await.unwrap();
        h.service.cast_vote(h.group_id, proposal.id, h.members[1], true).await.unwrap();

        let roster = h.groups.get_members(h.group_id).await.unwrap();
        assert!(!roster.is_member(target));
    }

    // -------------------------------------------------------------------------
    // store behaviour
    // -------------------------------------------------------------------------

    /// Store whose conditional writes always lose
    struct AlwaysConflicting(InMemoryProposalStore);

    #[async_trait]
    impl ProposalStore for AlwaysConflicting {
        async fn create(&self, proposal: &Proposal) -> Result<Proposal, AppError> {
            self.0.create(proposal).await
        }
        async fn get(&self, group_id: Uuid, id: Uuid) -> Result<Option<Proposal>, AppError> {
            self.0.get(group_id, id).await
        }
        async fn update_if_version(&self, _: &Proposal, _: u64) -> Result<Proposal, AppError> {
            Err(AppError::Conflict("always".to_string()))
        }
        async fn list_by_group(&self, group_id: Uuid, status: Option<ProposalStatus>) -> Result<Vec<Proposal>, AppError> {
            self.0.list_by_group(group_id, status).await
        }
        async fn list_open(&self) -> Result<Vec<Proposal>, AppError> {
            self.0.list_open().await
        }
    }

    /// Store that never answers reads in time
    struct Stalled;

    #[async_trait]
    impl ProposalStore for Stalled {
        async fn create(&self, proposal: &Proposal) -> Result<Proposal, AppError> {
            Ok(proposal.clone())
        }
        async fn get(&self, _: Uuid, _: Uuid) -> Result<Option<Proposal>, AppError> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(None)
        }
        async fn update_if_version(&self, p: &Proposal, _: u64) -> Result<Proposal, AppError> {
            Ok(p.clone())
        }
        async fn list_by_group(&self, _: Uuid, _: Option<ProposalStatus>) -> Result<Vec<Proposal>, AppError> {
            Ok(Vec::new())
        }
        async fn list_open(&self) -> Result<Vec<Proposal>, AppError> {
            Ok(Vec::new())
        }
    }

    async fn service_over(store: Arc<dyn ProposalStore>, config: GovernanceConfig) -> (ProposalService, Uuid, Uuid, Uuid) {
        let groups = Arc::new(InMemoryGroups::new());
        let admin = Uuid::new_v4();
        let member = Uuid::new_v4();
        let seed = GroupSeed::new(admin, [member]).with_setting("contributionAmount", json!(100));
        let group_id = groups.insert_group(seed).await;
        let applier = ChangeApplier::new(groups.clone() as Arc<dyn ConfigStore>, groups.clone(), groups.clone());
        let service = ProposalService::new(store, groups, applier, Arc::new(RecordingNotifier::default()), config);
        (service, group_id, admin, member)
    }

    #[tokio::test]
    async fn test_persistent_conflicts_surface_store_unavailable() {
        let store = Arc::new(AlwaysConflicting(InMemoryProposalStore::new()));
        let (service, group_id, admin, member) = service_over(store, GovernanceConfig::default()).await;

        let proposal = service
            .create_proposal(group_id, CreateProposalData {
                change: Harness::rule_change(150),
                proposed_by: admin,
                proposed_by_name: "Admin".to_string(),
                description: None,
                expires_at: None,
            })
            .await
            .unwrap();

        let err = service.cast_vote(group_id, proposal.id, member, true).await.unwrap_err();
        assert!(matches!(err, AppError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let config = GovernanceConfig {
            store_timeout_ms: 20,
            ..GovernanceConfig::default()
        };
        let (service, group_id, admin, _) = service_over(Arc::new(Stalled), config).await;

        let err = service.get_proposal(group_id, Uuid::new_v4(), admin).await.unwrap_err();
        assert!(matches!(err, AppError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unknown_proposal_and_group_are_not_found() {
        let h = Harness::new(2, GovernanceModel::default()).await;
        let err = h.service.get_proposal(h.group_id, Uuid::new_v4(), h.admin).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = h.service.list_proposals(Uuid::new_v4(), h.admin, None).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_outsider_cannot_read_proposals() {
        let h = Harness::new(2, GovernanceModel::default()).await;
        let proposal = h.open_rule_change(h.admin).await;
        let outsider = Uuid::new_v4();

        let err = h.service.get_proposal(h.group_id, proposal.id, outsider).await.unwrap_err();
        assert!(matches!(err, AppError::NotMember(_)));
        let err = h.service.list_proposals(h.group_id, outsider, None).await.unwrap_err();
        assert!(matches!(err, AppError::NotMember(_)));

        let read = h.service.get_proposal(h.group_id, proposal.id, h.members[1]).await.unwrap();
        assert_eq!(read.id, proposal.id);
    }

    #[tokio::test]
    async fn test_sweep_expires_only_overdue() {
        let h = Harness::new(3, GovernanceModel::default()).await;
        let overdue = h.insert_overdue(h.admin).await;
        let fresh = h.open_rule_change(h.admin).await;

        assert_eq!(h.service.sweep_expired().await.unwrap(), 1);
        assert_eq!(h.service.sweep_expired().await.unwrap(), 0);

        let stored = h.store.get(h.group_id, overdue.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProposalStatus::Expired);
        let stored = h.store.get(h.group_id, fresh.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProposalStatus::Open);
    }
}
