use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use home_energy_dispatcher::config::AppConfig;
use home_energy_dispatcher::engine::notify::LogNotifier;
use home_energy_dispatcher::engine::Engine;
use home_energy_dispatcher::evcc::EvccClient;
use home_energy_dispatcher::store::StateStore;
use home_energy_dispatcher::{server, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    let mut cfg = AppConfig::load()?;
    let issues = cfg.validate_issues();
    for issue in &issues {
        match issue.severity {
            home_energy_dispatcher::config::Severity::Critical => {
                error!(field = issue.field, suggestion = issue.suggestion, "{}", issue.message);
            }
            home_energy_dispatcher::config::Severity::Warning => {
                warn!(field = issue.field, suggestion = issue.suggestion, "{}", issue.message);
            }
        }
    }

    let addr = cfg.server.socket_addr()?;

    // Critical config: keep the web server up to show the issue list, but
    // never start the decision loop.
    if AppConfig::has_critical(&issues) {
        error!(
            count = issues.len(),
            "kritische Konfigurationsfehler - Dispatcher startet nicht"
        );
        let app = server::error_router(issues);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        return Ok(());
    }

    cfg.apply_safe_defaults(&issues);

    let store = Arc::new(StateStore::new());
    let evcc = Arc::new(EvccClient::new(&cfg.evcc)?);
    let engine = Engine::new(cfg, store, evcc, Arc::new(LogNotifier));
    let handles = engine.handles();

    tokio::spawn(engine.run());

    let app = server::router(handles);
    info!(%addr, "starting home energy dispatcher");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    warn!("shutdown complete");
    Ok(())
}
