use crate::pipeline::orchestrator::PerceptionSystem;
use crate::web::api;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn router(system: Arc<PerceptionSystem>) -> Router {
    Router::new()
        .route("/api/state", get(api::get_state))
        .route("/api/performance", get(api::get_performance))
        .route("/api/results", get(api::get_results))
        .route("/api/tracks", get(api::get_tracks))
        .route("/api/config", get(api::get_config).put(api::put_config))
        .route("/api/start", post(api::start))
        .route("/api/stop", post(api::stop))
        .route("/api/pause", post(api::pause))
        .route("/api/resume", post(api::resume))
        .route("/api/reset", post(api::reset))
        .route("/api/vehicle-speed", post(api::set_vehicle_speed))
        .route("/api/events", get(api::events))
        .layer(TraceLayer::new_for_http())
        .with_state(system)
}

pub async fn run_server(host: IpAddr, port: u16, system: Arc<PerceptionSystem>) -> Result<()> {
    let mut current_port = port;
    let listener = loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port.wrapping_add(1);
                if current_port == 0 {
                    return Err(anyhow::anyhow!("No available ports found"));
                }
            }
        }
    };

    let app = router(system);

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Hazard perception control server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    Ok(())
}
