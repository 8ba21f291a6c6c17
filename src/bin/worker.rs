use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::EnvFilter;

use fl_sync::{
    clients::{HttpLedger, HttpPortal},
    config::AppConfig,
    default_handlers,
    state::AppState,
    Worker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "worker",
        ledger_url = %config.redacted_ledger_url(),
        portal_url = %config.redacted_portal_url(),
        concurrency = config.worker.concurrency,
        auto_approve_assessments = config.policy.auto_approve_assessments,
        auto_reject_assessments = config.policy.auto_reject_assessments,
        force_mirror_write = config.policy.force_mirror_write,
        "loaded fl-sync configuration"
    );

    let ledger = Arc::new(HttpLedger::new(
        config.ledger_url.clone(),
        config.ledger_token.clone(),
    )?);
    let portal = Arc::new(HttpPortal::new(
        config.portal_url.clone(),
        config.portal_token.clone(),
    )?);

    let state = Arc::new(AppState::new(config, ledger, portal));
    let worker = Worker::new(state, default_handlers());

    tokio::select! {
        _ = worker.run() => {}
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
