use std::sync::Arc;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::Response,
    routing::{any, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use shared::protocol::API_PREFIX;
use shared::types::DeviceRecord;
use crate::discovery::DiscoveryCache;
use crate::proxy::{Gateway, ProxyError, ProxyRequest};

#[derive(Clone)]
pub struct AppState {
    pub discovery: Arc<DiscoveryCache>,
    pub gateway: Arc<Gateway>,
    pub hash_rx: watch::Receiver<String>,
    pub service_type: String,
    pub check_period_secs: u64,
}

#[derive(Serialize)]
pub struct ConfigResponse {
    pub service_type: String,
    pub proxy_mount: String,
    pub check_period_secs: u64,
}

#[derive(Deserialize)]
pub struct DeviceQuery {
    pub restart: Option<String>,
}

impl DeviceQuery {
    /// `?restart`, `?restart=1` and `?restart=true` all ask for a restart.
    fn wants_restart(&self) -> bool {
        self.restart
            .as_deref()
            .is_some_and(|value| !matches!(value, "0" | "false" | "no"))
    }
}

pub fn router(state: AppState) -> Router {
    let proxy_route = format!("{}/*path", state.gateway.mount());

    Router::new()
        .route(&format!("{API_PREFIX}/config"), get(get_config))
        .route(&format!("{API_PREFIX}/devices"), get(get_devices))
        .route(&format!("{API_PREFIX}/devices/hash"), get(get_hash))
        .route(&format!("{API_PREFIX}/devices/:name"), get(get_device))
        .route(&proxy_route, any(proxy))
        .with_state(state)
}

async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        service_type: state.service_type.clone(),
        proxy_mount: state.gateway.mount().to_string(),
        check_period_secs: state.check_period_secs,
    })
}

async fn get_devices(
    State(state): State<AppState>,
    Query(params): Query<DeviceQuery>,
) -> Result<Json<Vec<DeviceRecord>>, StatusCode> {
    if params.wants_restart() {
        if let Err(e) = state.discovery.restart().await {
            tracing::error!("Failed to restart discovery: {:#}", e);
        }
    }

    state
        .discovery
        .list_devices()
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!("Failed to list devices: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_device(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DeviceRecord>, StatusCode> {
    state
        .discovery
        .get_device(&name)
        .await
        .map_err(|e| {
            tracing::error!("Failed to query device: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let path = uri
        .path()
        .strip_prefix(state.gateway.mount())
        .unwrap_or(uri.path())
        .to_string();

    state
        .gateway
        .forward(ProxyRequest {
            method,
            path,
            query: uri.query().map(str::to_string),
            headers,
            body,
        })
        .await
}
