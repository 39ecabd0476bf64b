//! match-ledger process host: wires the in-memory store, restores timers and
//! runs the periodic rating merge until shutdown.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use match_ledger::{
    clock::SystemClock,
    config::Settings,
    dao::match_store::MemoryStore,
    messaging::LogMessenger,
    services::{rating_service, task_runner},
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let settings = Settings::load();
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(
        store.clone(),
        store,
        Arc::new(LogMessenger::default()),
        Arc::new(SystemClock),
        settings,
    );

    let restored = task_runner::restore_timers(&state)
        .await
        .context("restoring match timers")?;
    let merge = rating_service::arm_periodic_merge(&state);
    info!(restored, next_merge = %merge.fire_at, "match ledger running");

    shutdown_signal().await;

    let cancelled = state.timers().cancel_all();
    info!(cancelled, "timers cancelled; shutting down");
    Ok(())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
