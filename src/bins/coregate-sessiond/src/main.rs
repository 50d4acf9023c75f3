//! CoreGate sessiond
//!
//! Per-subscriber session enforcement daemon: tracks policy rules,
//! credit grants and usage reporting for every attached subscriber and
//! drives session lifecycles against the policy/charging cloud.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use coregate_sessiond::clients::{
    LoggingAaaClient, LoggingDataPlaneClient, LoggingDirectoryClient, LoggingSessionReporter,
    LoggingSpgwClient,
};
use coregate_sessiond::config::SessionDConfig;
use coregate_sessiond::enforcer::{epoch_now, LocalEnforcer};
use coregate_sessiond::rules::StaticRuleStore;
use coregate_sessiond::store::SessionStore;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("CoreGate sessiond v{} starting...", env!("CARGO_PKG_VERSION"));

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        shutdown_flag.store(true, Ordering::SeqCst);
    })?;

    let config = SessionDConfig::load_from_env();
    log::info!(
        "Enforcement config: update_interval={}s force_termination_timeout={}ms",
        config.update_interval_secs,
        config.session_force_termination_timeout_ms
    );

    let rule_store = Arc::new(StaticRuleStore::new());
    if !config.static_rules.is_empty() {
        log::info!("Loading {} static rules from configuration", config.static_rules.len());
        rule_store.reload(config.static_rules.clone());
    }
    let session_store = Arc::new(SessionStore::new());

    // Transports are injected at the deployment boundary; log-only
    // clients keep the daemon runnable standalone.
    let enforcer = LocalEnforcer::new(
        Arc::new(LoggingSessionReporter),
        Arc::clone(&rule_store),
        Arc::clone(&session_store),
        Arc::new(LoggingDataPlaneClient),
        Arc::new(LoggingDirectoryClient),
        Arc::new(LoggingSpgwClient),
        Arc::new(LoggingAaaClient),
        config,
    );

    let now = epoch_now();
    enforcer.sync_sessions_on_restart(now);
    match enforcer.setup(now) {
        Ok(result) => log::info!("Data-plane setup finished: {result:?}"),
        Err(e) => log::error!("Data-plane setup failed: {e}"),
    }

    log::info!("CoreGate sessiond ready");
    enforcer.run(shutdown).await;

    log::info!("CoreGate sessiond stopped");
    Ok(())
}
