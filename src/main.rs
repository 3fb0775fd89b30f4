//! snooscrape server binary.
//!
//! Exit codes: 0 clean shutdown, 1 invalid configuration, 2 store
//! unreachable, 3 unhandled panic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snooscrape::admission::AdmissionController;
use snooscrape::circuit::CircuitBreaker;
use snooscrape::client::ForumClient;
use snooscrape::config::Settings;
use snooscrape::engine::{EngineConfig, SessionEngine};
use snooscrape::enrich::ContentEnricher;
use snooscrape::events::EventBus;
use snooscrape::metrics::MetricsSink;
use snooscrape::server::{self, AppState};
use snooscrape::store::Store;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "snooscrape=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Worker-task panics are contained by the scheduler; a panic on the
    // main thread is not survivable and gets its own exit code.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        if std::thread::current().name() == Some("main") {
            std::process::exit(3);
        }
    }));

    let config_path = std::env::var("SNOOSCRAPE_CONFIG")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from);
    let settings = match Settings::load(config_path.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let store = match Store::open(&settings.database_path(), settings.max_connections).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(
                "store unreachable at {}: {e}",
                settings.database_path().display()
            );
            std::process::exit(2);
        }
    };

    let bus = EventBus::new();
    let metrics = MetricsSink::start(store.clone(), bus.clone());

    let forum_admission = if settings.shared_admission {
        match AdmissionController::shared(
            &settings.database_path(),
            "forum",
            settings.admission_config(),
        ) {
            Ok(ctl) => Arc::new(ctl),
            Err(e) => {
                tracing::error!("shared admission line unavailable: {e}");
                std::process::exit(2);
            }
        }
    } else {
        Arc::new(AdmissionController::local(settings.admission_config()))
    };
    let forum_circuit = Arc::new(CircuitBreaker::new("forum", settings.circuit_config()));
    let client = match ForumClient::new(settings.client_config(), forum_admission, forum_circuit) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!("client init failed: {e}");
            std::process::exit(1);
        }
    };

    // The external web is a different failure domain; it gets its own
    // pacing line and circuit.
    let enrich_admission = Arc::new(AdmissionController::local(settings.admission_config()));
    let enrich_circuit = Arc::new(CircuitBreaker::new("content", settings.circuit_config()));
    let enricher = match ContentEnricher::new(
        settings.enrich_config(),
        enrich_admission,
        enrich_circuit,
    ) {
        Ok(enricher) => Arc::new(enricher),
        Err(e) => {
            tracing::error!("enricher init failed: {e}");
            std::process::exit(1);
        }
    };

    let engine = SessionEngine::new(
        store.clone(),
        bus.clone(),
        client,
        enricher,
        metrics,
        EngineConfig::default(),
    );

    match engine.resume_active().await {
        Ok(0) => {}
        Ok(n) => tracing::info!("restored {n} interrupted sessions"),
        Err(e) => tracing::warn!("session restore failed: {e}"),
    }

    tokio::spawn(engine.clone().run_watchdog());
    tokio::spawn(janitor(store.clone(), settings.retention_days));

    let state = AppState {
        engine,
        store,
        bus,
        public_config: settings.public_view(),
    };
    if let Err(e) = server::serve(state, &settings.bind_host, settings.bind_port).await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}

/// Housekeeping: sweep idle pool connections every minute and apply the
/// retention policy daily when configured.
async fn janitor(store: Store, retention_days: Option<i64>) {
    let mut sweep = tokio::time::interval(Duration::from_secs(60));
    let mut gc = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                store.pool().trim_idle(2);
            }
            _ = gc.tick() => {
                if let Some(days) = retention_days {
                    let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
                    match store.gc(cutoff).await {
                        Ok(removed) if removed > 0 => {
                            tracing::info!("retention sweep removed {removed} rows");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("retention sweep failed: {e}"),
                    }
                }
            }
        }
    }
}
