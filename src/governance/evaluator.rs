//! Quorum, tally and tie-break rules
//!
//! Everything here is a pure function of its inputs so the decision rules
//! can be exercised with literal ballots and no store.

use crate::governance::{GovernanceModel, QuorumKind};
use crate::proposal::{Proposal, ProposalStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Approve/reject counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    pub approve: usize,
    pub reject: usize,
}

impl Tally {
    pub fn of(proposal: &Proposal) -> Self {
        let approve = proposal.votes.iter().filter(|v| v.approve).count();
        Self {
            approve,
            reject: proposal.votes.len() - approve,
        }
    }

    pub fn total(&self) -> usize {
        self.approve + self.reject
    }

    pub fn is_tie(&self) -> bool {
        self.approve == self.reject
    }
}

/// Result of evaluating a proposal against its group's rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub status: ProposalStatus,
    pub approved: bool,
    pub quorum_reached: bool,
    pub tally: Tally,
    /// The admin's ballot settled a tie
    pub tie_broken_by_admin: bool,
    /// Set when this evaluation moved the proposal out of `Open`
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Evaluation {
    fn unchanged(proposal: &Proposal, quorum_reached: bool, tally: Tally) -> Self {
        Self {
            status: proposal.status,
            approved: proposal.status == ProposalStatus::Approved,
            quorum_reached,
            tally,
            tie_broken_by_admin: false,
            resolved_at: None,
        }
    }

    /// Whether the evaluation moves an open proposal to a terminal status
    pub fn is_decision(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Whether enough members have voted for the tally to bind.
///
/// `Percentage` compares `votes * 100` against `threshold * total`, so with
/// ten members and 51% six ballots are needed. Cross-multiplying keeps exact
/// thresholds such as 29 of 50 at 58% exact. An empty group never reaches a
/// percentage quorum.
pub fn quorum_reached(votes: usize, total_members: usize, model: &GovernanceModel) -> bool {
    match model.quorum_kind {
        QuorumKind::Percentage => {
            if total_members == 0 {
                return false;
            }
            votes as f64 * 100.0 >= model.quorum_value * total_members as f64
        }
        QuorumKind::Count => votes as f64 >= model.quorum_value,
    }
}

/// Evaluate `proposal` as of `now`. Does not mutate the proposal.
pub fn evaluate(
    proposal: &Proposal,
    model: &GovernanceModel,
    total_members: usize,
    admin_id: Uuid,
    now: DateTime<Utc>,
) -> Evaluation {
    let tally = Tally::of(proposal);

    if proposal.status.is_terminal() {
        return Evaluation::unchanged(proposal, false, tally);
    }

    if now > proposal.expires_at {
        return Evaluation {
            status: ProposalStatus::Expired,
            approved: false,
            quorum_reached: false,
            tally,
            tie_broken_by_admin: false,
            resolved_at: Some(now),
        };
    }

    if !quorum_reached(tally.total(), total_members, model) {
        return Evaluation::unchanged(proposal, false, tally);
    }

    let mut approved = tally.approve > tally.reject;
    let mut tie_broken_by_admin = false;

    // Ties reject unless the admin holds the casting vote and used it
    if tally.is_tie() && model.admin_has_tiebreaker {
        if let Some(admin_vote) = proposal.vote_of(admin_id) {
            approved = admin_vote.approve;
            tie_broken_by_admin = true;
        }
    }

    Evaluation {
        status: if approved {
            ProposalStatus::Approved
        } else {
            ProposalStatus::Rejected
        },
        approved,
        quorum_reached: true,
        tally,
        tie_broken_by_admin,
        resolved_at: Some(now),
    }
}
