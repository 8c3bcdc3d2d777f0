//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::governance::ProposalService;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Proposal lifecycle, already wired to its store and collaborators
    pub proposals: Arc<ProposalService>,
}

impl AppState {
    pub fn new(proposals: Arc<ProposalService>) -> Self {
        Self { proposals }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
