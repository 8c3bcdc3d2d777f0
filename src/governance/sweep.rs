//! Background expiry sweep
//!
//! Lazy expiry on read already keeps answers correct; the sweep only makes
//! sure proposals nobody looks at still get closed and announced.

use crate::governance::ProposalService;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub fn spawn_expiry_sweep(service: Arc<ProposalService>, every: Duration) -> JoinHandle<()> {
    info!("⏲️  Expiry sweep running every {}s", every.as_secs());

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match service.sweep_expired().await {
                Ok(0) => debug!("Expiry sweep found nothing to close"),
                Ok(n) => info!("Expiry sweep closed {} proposal(s)", n),
                Err(e) => warn!("Expiry sweep failed: {}", e),
            }
        }
    })
}
