//! tandemd — two-peer media streaming daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use tandem_core::TandemConfig;
use tandem_services::PeerSession;

mod capture;
mod sink;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TandemConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TandemConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TandemConfig::default()
    });
    tracing::info!(
        remote = %config.peer.remote_address,
        remote_port = config.peer.remote_port,
        local_port = config.peer.local_port,
        mode = ?config.transport.mode,
        "tandemd starting"
    );

    let session = match PeerSession::start(config.clone(), Arc::new(sink::LogSink::default())).await
    {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "failed to start peer session");
            return Err(e);
        }
    };

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let capture_task = tokio::spawn(capture::run(
        session.clone(),
        config.capture.clone(),
        session.shutdown_signal(),
    ));

    let stats_printer = {
        let registry = session.stats_registry().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                registry.log_stats();
            }
        })
    };

    if config.api.enabled {
        let state = tandem_api::ApiState {
            session: session.clone(),
        };
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = tandem_api::serve(state, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = session.shutdown_signal();

    tokio::select! {
        _ = tokio::signal::ctrl_c()  => tracing::info!("shutdown signal received"),
        _ = shutdown_rx.recv()       => tracing::info!("shutdown requested"),
        r = capture_task             => tracing::error!("capture task exited: {:?}", r),
        r = stats_printer            => tracing::error!("stats printer exited: {:?}", r),
    }

    session.shutdown();
    session.stats_registry().log_stats();
    // Let tasks observe the shutdown before the runtime is torn down.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
