//! Proposal route handlers
//!
//! Thin adapters: authenticate, validate the payload, hand off to the
//! proposal service.

use crate::auth::Claims;
use crate::error::{validation_error, ApiResult};
use crate::governance::lifecycle::is_valid_field_name;
use crate::governance::{ChangeType, CreateProposalData, ProposalRequirement};
use crate::models::SuccessResponse;
use crate::proposal::{Proposal, ProposalChange, ProposalStatus};
use crate::state::SharedState;
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementQuery {
    pub change_type: ChangeType,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

/// Body of `POST /proposals`: `{"type": ..., "payload": ..., "description": ...}`
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateProposalRequest {
    #[serde(flatten)]
    #[validate(custom(function = "validate_change"))]
    pub change: ProposalChange,
    #[validate(length(max = 2000, message = "Description must be at most 2000 characters"))]
    pub description: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub approve: bool,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CancelRequest {
    #[validate(length(max = 500, message = "Reason must be at most 500 characters"))]
    pub reason: Option<String>,
}

fn validate_change(change: &ProposalChange) -> Result<(), validator::ValidationError> {
    if let ProposalChange::RuleChange(payload) = change {
        if payload.fields.keys().any(|f| !is_valid_field_name(f)) {
            let mut err = validator::ValidationError::new("invalid_field_name");
            err.message = Some(
                "Rule fields must start with a letter and contain only letters, digits, underscores."
                    .into(),
            );
            return Err(err);
        }
    }
    Ok(())
}

/// Whether the caller needs a proposal for a change of the given type
pub async fn check_requirement(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<Uuid>,
    Query(query): Query<RequirementQuery>,
) -> ApiResult<Json<SuccessResponse<ProposalRequirement>>> {
    let requirement = state
        .proposals
        .requires_proposal(group_id, query.change_type, claims.sub)
        .await?;

    Ok(Json(SuccessResponse::with_data(
        "Requirement evaluated.",
        requirement,
    )))
}

pub async fn create_proposal(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<Uuid>,
    Json(payload): Json<CreateProposalRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<Proposal>>)> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    debug!("Creating {} proposal in group {}", payload.change.kind(), group_id);

    let proposal = state
        .proposals
        .create_proposal(
            group_id,
            CreateProposalData {
                change: payload.change,
                proposed_by: claims.sub,
                proposed_by_name: claims.name,
                description: payload.description,
                expires_at: payload.expires_at,
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data("Proposal opened.", proposal)),
    ))
}

pub async fn list_proposals(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<SuccessResponse<Vec<Proposal>>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ProposalStatus>)
        .transpose()
        .map_err(validation_error)?;

    let proposals = state
        .proposals
        .list_proposals(group_id, claims.sub, status)
        .await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Found {} proposal(s).", proposals.len()),
        proposals,
    )))
}

pub async fn get_proposal(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path((group_id, proposal_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<SuccessResponse<Proposal>>> {
    let proposal = state
        .proposals
        .get_proposal(group_id, proposal_id, claims.sub)
        .await?;
    Ok(Json(SuccessResponse::with_data("Proposal found.", proposal)))
}

pub async fn cast_vote(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path((group_id, proposal_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<VoteRequest>,
) -> ApiResult<Json<SuccessResponse<Proposal>>> {
    let proposal = state
        .proposals
        .cast_vote(group_id, proposal_id, claims.sub, payload.approve)
        .await?;

    let message = if proposal.is_open() {
        "Vote recorded.".to_string()
    } else {
        format!("Vote recorded, proposal {}.", proposal.status.as_str().to_lowercase())
    };
    Ok(Json(SuccessResponse::with_data(message, proposal)))
}

pub async fn cancel_proposal(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path((group_id, proposal_id)): Path<(Uuid, Uuid)>,
    payload: Option<Json<CancelRequest>>,
) -> ApiResult<Json<SuccessResponse<Proposal>>> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let proposal = state
        .proposals
        .cancel_proposal(group_id, proposal_id, claims.sub, payload.reason)
        .await?;

    Ok(Json(SuccessResponse::with_data("Proposal cancelled.", proposal)))
}

pub async fn reconcile_proposal(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path((group_id, proposal_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<SuccessResponse<Proposal>>> {
    let proposal = state
        .proposals
        .reconcile(group_id, proposal_id, claims.sub)
        .await?;

    Ok(Json(SuccessResponse::with_data("Proposal reconciled.", proposal)))
}
