//! Vigil service binary.
//!
//! Wires the evolution loop, the manual-session lock coordinator, and the
//! dedup ledger to an HTTP analysis engine and game feed, then serves the
//! operator API until `Ctrl-C`.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `vigil-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Connect storage (memory, `PostgreSQL`, `Dragonfly`)
//! 4. Start the rate limiter sweeper
//! 5. Warm the dedup ledger in the background
//! 6. Build the engine and feed clients and the evolution loop
//! 7. Build the lock coordinator and its remote watcher
//! 8. Serve the operator API
//! 9. On shutdown, release any manual session, stop the loop and close
//!    storage

mod backend;
mod error;
mod upstream;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vigil_core::config::{LoggingConfig, VigilConfig};
use vigil_core::coordinator::{LockCoordinator, LockSignal};
use vigil_core::evolution::{Collaborators, EvolutionLoop};
use vigil_core::ledger::DedupLedger;
use vigil_observer::{AppState, ControlPlane, Runtime, ServerConfig};
use vigil_resilience::SlidingWindowLimiter;

use crate::backend::Backend;
use crate::error::AppError;
use crate::upstream::{HttpEngine, HttpFeed};

/// Configuration file looked up relative to the working directory.
const CONFIG_PATH: &str = "vigil-config.yaml";

/// Per-request bound on feed calls.
const FEED_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<(), AppError> {
    // 1. Configuration.
    let config = VigilConfig::from_file_or_default(Path::new(CONFIG_PATH))?;

    // 2. Logging.
    init_tracing(&config.logging);
    info!(
        config_found = Path::new(CONFIG_PATH).exists(),
        engine_url = config.infrastructure.engine_url,
        feed_url = config.infrastructure.feed_url,
        "vigil starting"
    );

    // 3. Storage.
    let store = Arc::new(Backend::connect(&config.infrastructure).await?);
    info!(backend = store.name(), "Storage ready");

    // 4. Limiter shared by engine and feed clients.
    let limiter = Arc::new(SlidingWindowLimiter::new(config.rate_limit.clone()));
    let _sweeper = limiter.spawn_sweeper();

    // 5. Ledger, warmed in the background so startup never waits on it.
    let ledger = Arc::new(DedupLedger::new(Arc::clone(&store), config.dedup.clone()));
    {
        let ledger = Arc::clone(&ledger);
        tokio::spawn(async move {
            let report = ledger.init_known_ids().await;
            info!(
                loaded = report.loaded,
                pages = report.pages,
                stop = ?report.stop,
                "Dedup ledger warmed"
            );
        });
    }

    // 6. Collaborators and loop.
    let engine = Arc::new(HttpEngine::new(
        &config.infrastructure.engine_url,
        Arc::clone(&limiter),
    )?);
    let feed = Arc::new(HttpFeed::new(
        &config.infrastructure.feed_url,
        Arc::clone(&limiter),
        FEED_TIMEOUT,
    )?);
    let signal = LockSignal::new();
    let evolution = Arc::new(EvolutionLoop::new(
        Collaborators {
            engine,
            feed,
            store: Arc::clone(&store),
            ledger,
            limiter,
        },
        config.evolution.clone(),
        config.retry.clone(),
        signal.clone(),
    ));

    // 7. Coordinator and cross-process watcher.
    let coordinator = Arc::new(LockCoordinator::new(
        Arc::clone(&evolution),
        Arc::clone(&store),
        signal,
        config.lock.clone(),
    ));
    let _remote_watch = coordinator.spawn_remote_watch();
    info!(
        owner = %coordinator.owner(),
        lock_key = config.lock.lock_key,
        "Lock coordinator ready"
    );

    if config.evolution.autostart {
        evolution.start();
    }

    // 8. Operator API.
    let runtime = Arc::new(Runtime::new(Arc::clone(&evolution), Arc::clone(&coordinator)));
    let control: Arc<dyn ControlPlane> = Arc::clone(&runtime) as Arc<dyn ControlPlane>;
    let app_state = Arc::new(AppState::new(control));
    let _forwarding = runtime.forward_to(&app_state.tx);

    let server_config = ServerConfig {
        port: config.infrastructure.observer_port,
        ..ServerConfig::default()
    };
    vigil_observer::start_server(&server_config, app_state, shutdown_signal()).await?;

    // 9. Shutdown.
    if coordinator.is_held() {
        coordinator.release().await;
    }
    evolution.stop();
    store.close().await;
    info!("vigil shutdown complete");

    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
