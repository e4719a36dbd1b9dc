use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod lockout;

use dbus_interface::{AppState, LivenessService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("glanced starting");

    let config = config::Config::from_env()?;
    let session_bus = config.session_bus;
    tracing::info!(
        config_file = ?config.liveness_path,
        max_sessions = config.max_sessions,
        hold_ms = config.liveness.hold_ms,
        stabilize_delay_ms = config.liveness.stabilize_delay_ms,
        session_idle_secs = config.session_idle_secs,
        "configuration loaded"
    );

    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let state = Arc::new(Mutex::new(AppState::new(config, notice_tx)));
    let service = LivenessService {
        state: Arc::clone(&state),
    };

    let builder = if session_bus {
        tracing::warn!("using session bus, session ownership is not enforced");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    let forwarder = tokio::spawn(dbus_interface::forward_notices(conn.clone(), notice_rx));

    tracing::info!(bus_name = BUS_NAME, "glanced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("glanced shutting down");

    state.lock().await.shutdown_all().await;
    forwarder.abort();

    Ok(())
}
