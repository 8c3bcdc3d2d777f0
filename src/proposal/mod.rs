//! Proposal module
//!
//! The proposal aggregate and the stores that persist it.

mod models;
mod postgres;
mod store;

pub use models::*;
pub use postgres::PgProposalStore;
pub use store::{InMemoryProposalStore, ProposalStore};
