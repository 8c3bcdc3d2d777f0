//! Group governance: who may change a group's rules and how members decide.

pub mod applier;
pub mod evaluator;
pub mod lifecycle;
mod model;
pub mod sweep;

pub use applier::ChangeApplier;
pub use lifecycle::{CreateProposalData, ProposalService};
pub use model::*;
