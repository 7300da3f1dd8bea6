use ack_core::llm::LlmConfig;
use ack_core::model::ChannelRef;
use ack_core::{ChannelBridge, CoordinatorConfig, OperatorAlert, ServiceCatalog, Stores, TriageDeps};
use ack_server::demo::{demo_gateway, LogBridge};
use ack_server::{router, state, AppState};
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let db_path = std::env::var("ACK_DB_PATH").unwrap_or_else(|_| "incidents.db".into());
    let bind = std::env::var("ACK_BIND").unwrap_or_else(|_| "0.0.0.0:8080".into());

    let catalog = match std::env::var("ACK_CATALOG_PATH") {
        Ok(path) => ServiceCatalog::load(&path).with_context(|| format!("loading catalog {path}"))?,
        Err(_) => {
            warn!("ACK_CATALOG_PATH not set; using the demo catalog");
            ServiceCatalog::demo()
        }
    };
    let config = CoordinatorConfig::from_env();
    let llm = LlmConfig::from_env();
    info!(
        budget_secs = config.response_budget_secs,
        max_tool_calls = config.max_tool_calls,
        llm = llm.is_some(),
        "configuration loaded"
    );

    let stores = Stores::open(&db_path).with_context(|| format!("opening store {db_path}"))?;
    let bridge: Arc<dyn ChannelBridge> = Arc::new(LogBridge::default());
    let (operator_tx, operator_rx) = mpsc::unbounded_channel();

    let deps = TriageDeps {
        stores,
        gateway: demo_gateway(config.retry_backoff()),
        bridge: bridge.clone(),
        catalog: Arc::new(catalog),
        config: Arc::new(config),
        llm,
        operator_tx,
    };

    tokio::spawn(forward_operator_alerts(operator_rx, bridge));

    let settled = state::settle_orphans(&deps).context("settling incidents from a previous run")?;
    if settled.failed > 0 || settled.resumed > 0 {
        warn!(
            failed = settled.failed,
            resumed = settled.resumed,
            "incidents from a previous run were settled"
        );
    }

    let app = router(AppState::new(deps));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(%bind, "ack-server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let json = std::env::var("ACK_LOG_JSON").is_ok_and(|v| v == "1");
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            )
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Logs every operator alert and mirrors it to the ops channel when one is
/// configured.
async fn forward_operator_alerts(
    mut rx: mpsc::UnboundedReceiver<OperatorAlert>,
    bridge: Arc<dyn ChannelBridge>,
) {
    let ops = std::env::var("ACK_OPS_CHANNEL").ok().map(|name| ChannelRef {
        id: name.clone(),
        name,
    });
    while let Some(alert) = rx.recv().await {
        error!(incident_id = %alert.incident_id, reason = %alert.reason, "operator alert");
        let Some(channel) = &ops else { continue };
        let text = format!(
            ":rotating_light: incident `{}` needs an operator: {}",
            alert.incident_id, alert.reason
        );
        if let Err(err) = bridge.post_message(channel, &text).await {
            warn!(error = %err, "operator alert could not be posted");
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
