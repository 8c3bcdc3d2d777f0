//! Pooled Fund Governance API
//!
//! Collective decision-making for savings groups: members open proposals to
//! change group rules, approve loans or remove members, vote on them under
//! the group's quorum rules, and approved changes are handed to the services
//! that own them.
//!
//! Without `DATABASE_URL` the server runs on in-memory adapters seeded with a
//! demo group, which is handy for local development.

mod auth;
mod config;
mod db;
mod error;
mod governance;
mod group;
mod models;
mod notify;
mod proposal;
mod routes;
mod state;

use crate::config::Settings;
use crate::governance::sweep::spawn_expiry_sweep;
use crate::governance::{ChangeApplier, ProposalService};
use crate::group::{GroupSeed, InMemoryGroups, PgGroups};
use crate::notify::TracingNotifier;
use crate::proposal::{InMemoryProposalStore, PgProposalStore};
use crate::routes::create_router;
use crate::state::AppState;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for structured logging
    init_tracing();

    info!("🚀 Starting Pooled Fund Governance...");

    // Load configuration
    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    if std::env::var("JWT_SECRET").is_err() {
        warn!("⚠️  JWT_SECRET not set, using default (INSECURE - set in production!)");
    }

    let proposals = match &settings.database {
        Some(database) => {
            let pool = db::create_pool(database).await?;
            info!("✅ Database pool created successfully");
            db::ensure_schema(&pool).await?;

            let groups = Arc::new(PgGroups::new(pool.clone()));
            wire_service(
                Arc::new(PgProposalStore::new(pool)),
                groups,
                &settings,
            )
        }
        None => {
            warn!("⚠️  DATABASE_URL not set, using in-memory storage (data is lost on restart)");
            let groups = Arc::new(InMemoryGroups::new());
            seed_demo_group(&groups).await?;
            wire_service(Arc::new(InMemoryProposalStore::new()), groups, &settings)
        }
    };
    let proposals = Arc::new(proposals);

    if let Some(secs) = settings.governance.sweep_interval_secs {
        spawn_expiry_sweep(proposals.clone(), Duration::from_secs(secs));
    }

    // Build the router
    let app = create_router(Arc::new(AppState::new(proposals)), &settings);

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   GET  /health");
    info!("   GET  /api/groups/{{groupId}}/proposals/requirement?changeType=");
    info!("   POST /api/groups/{{groupId}}/proposals");
    info!("   GET  /api/groups/{{groupId}}/proposals?status=");
    info!("   GET  /api/groups/{{groupId}}/proposals/{{proposalId}}");
    info!("   POST /api/groups/{{groupId}}/proposals/{{proposalId}}/votes");
    info!("   POST /api/groups/{{groupId}}/proposals/{{proposalId}}/cancel");
    info!("   POST /api/groups/{{groupId}}/proposals/{{proposalId}}/reconcile");
    info!("");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Server shutdown complete");
    Ok(())
}

/// One adapter serves as directory and every domain service
fn wire_service<G>(
    store: Arc<dyn proposal::ProposalStore>,
    groups: Arc<G>,
    settings: &Settings,
) -> ProposalService
where
    G: group::GroupDirectory
        + group::ConfigStore
        + group::LoanService
        + group::MembershipService
        + 'static,
{
    let applier = ChangeApplier::new(groups.clone(), groups.clone(), groups.clone());
    ProposalService::new(
        store,
        groups,
        applier,
        Arc::new(TracingNotifier),
        settings.governance.clone(),
    )
}

/// Admin plus two members, with tokens logged for trying the API by hand
async fn seed_demo_group(groups: &InMemoryGroups) -> anyhow::Result<()> {
    let admin = Uuid::new_v4();
    let members = [Uuid::new_v4(), Uuid::new_v4()];
    let seed = GroupSeed::new(admin, members)
        .with_setting("contributionAmount", json!(100))
        .with_setting("cycleDays", json!(30));
    let group_id = groups.insert_group(seed).await;

    info!("🧪 Demo group {} (admin {})", group_id, admin);
    for (name, user) in [("admin", admin), ("member-1", members[0]), ("member-2", members[1])] {
        let token = auth::create_token(user, name)?;
        debug!("   {} token: {}", name, token);
    }
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,pooled_fund_governance=debug,tower_http=debug")
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
