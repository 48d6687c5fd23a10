//! Control surface: `/stats` and `/config` over HTTP

use crate::config::ConfigStore;
use crate::errors::{ConfigError, Result};
use crate::types::SimulationConfig;
use crate::StatsSnapshot;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use observability::StatsAggregator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared state for the control handlers
#[derive(Clone)]
pub struct ControlState {
    pub config: Arc<ConfigStore>,
    pub stats: Arc<StatsAggregator>,
}

impl ControlState {
    pub fn new(config: Arc<ConfigStore>, stats: Arc<StatsAggregator>) -> Self {
        Self { config, stats }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(self.config.current())
    }
}

pub fn create_router(state: ControlState) -> Router {
    Router::new()
        .route("/stats", get(stats_handler))
        .route(
            "/config",
            get(get_config_handler)
                .put(replace_config_handler)
                .post(replace_config_handler),
        )
        .with_state(state)
}

async fn stats_handler(State(state): State<ControlState>) -> Json<StatsSnapshot> {
    Json(state.snapshot())
}

async fn get_config_handler(State(state): State<ControlState>) -> Json<SimulationConfig> {
    Json(state.config.current())
}

/// Parse, validate and publish a candidate config
async fn replace_config_handler(State(state): State<ControlState>, body: Bytes) -> Response {
    let candidate = match SimulationConfig::from_json(&body) {
        Ok(candidate) => candidate,
        Err(e) => return rejection(e),
    };

    match state.config.replace(candidate) {
        Ok(()) => (StatusCode::OK, Json(candidate)).into_response(),
        Err(e) => rejection(e),
    }
}

fn rejection(err: ConfigError) -> Response {
    warn!(field = err.field(), "Rejected config: {}", err);
    (StatusCode::BAD_REQUEST, Json(err.to_rejection())).into_response()
}

/// Handle for a running control server
pub struct ControlServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ControlServerHandle {
    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for in-flight requests
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            debug!("Control server task ended abnormally: {}", e);
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for ControlServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct ControlServer {
    addr: SocketAddr,
    state: ControlState,
}

impl ControlServer {
    pub fn new(addr: SocketAddr, state: ControlState) -> Self {
        Self { addr, state }
    }

    /// Bind and serve in the background
    pub async fn start(self) -> Result<ControlServerHandle> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let router = create_router(self.state);
        info!(addr = %local_addr, "Control server listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                error!(error = ?e, "Control server error");
            }
            info!(addr = %local_addr, "Control server stopped");
        });

        Ok(ControlServerHandle {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }
}
