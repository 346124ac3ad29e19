use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use crate::catalog;
use crate::host_manager::{HostHandle, MaintenanceReport};
use shared::types::{DeviceExport, DeviceStats, HostEvent, TrafficStats};

#[derive(Clone)]
pub struct AppState {
    pub hosts: HostHandle,
    pub hash_rx: watch::Receiver<String>,
    pub catalog_path: Arc<PathBuf>,
    pub event_tx: mpsc::Sender<HostEvent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ViewQuery {
    pub force: bool,
    pub detailed: bool,
}

#[derive(Debug, Serialize)]
pub struct CatalogResponse {
    pub profiles: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/devices", get(get_devices))
        .route("/v1/devices/hash", get(get_hash))
        .route("/v1/devices/:mac", get(get_device))
        .route("/v1/stats/devices", get(get_device_stats))
        .route("/v1/stats/traffic", get(get_traffic_stats))
        .route("/v1/events", post(post_event))
        .route("/v1/prune", post(post_prune))
        .route("/v1/catalog/reload", post(post_catalog_reload))
        .with_state(state)
}

fn internal_error(context: &str, e: anyhow::Error) -> StatusCode {
    tracing::error!("{}: {}", context, e);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn get_devices(
    State(state): State<AppState>,
    Query(params): Query<ViewQuery>,
) -> Result<Json<Vec<DeviceExport>>, StatusCode> {
    state
        .hosts
        .export(params.detailed)
        .await
        .map(Json)
        .map_err(|e| internal_error("Failed to export devices", e))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_device(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<DeviceExport>, StatusCode> {
    state
        .hosts
        .get_one(mac.to_ascii_lowercase())
        .await
        .map_err(|e| internal_error("Failed to query device", e))?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_device_stats(
    State(state): State<AppState>,
    Query(params): Query<ViewQuery>,
) -> Result<Json<BTreeMap<String, DeviceStats>>, StatusCode> {
    state
        .hosts
        .device_stats(params.force, params.detailed)
        .await
        .map(Json)
        .map_err(|e| internal_error("Failed to collect device stats", e))
}

async fn get_traffic_stats(
    State(state): State<AppState>,
    Query(params): Query<ViewQuery>,
) -> Result<Json<BTreeMap<String, TrafficStats>>, StatusCode> {
    state
        .hosts
        .traffic_stats(params.force)
        .await
        .map(Json)
        .map_err(|e| internal_error("Failed to collect traffic stats", e))
}

async fn post_event(State(state): State<AppState>, Json(event): Json<HostEvent>) -> StatusCode {
    match state.event_tx.send(event).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            tracing::error!("Failed to queue host event: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn post_prune(
    State(state): State<AppState>,
    Query(params): Query<ViewQuery>,
) -> Result<Json<MaintenanceReport>, StatusCode> {
    state
        .hosts
        .maintenance(params.force)
        .await
        .map(Json)
        .map_err(|e| internal_error("Failed to prune hosts", e))
}

async fn post_catalog_reload(State(state): State<AppState>) -> Result<Json<CatalogResponse>, StatusCode> {
    let path = state.catalog_path.clone();
    let catalog = tokio::task::spawn_blocking(move || catalog::load_catalog(path.as_path()))
        .await
        .map_err(|e| internal_error("Catalog loader panicked", e.into()))?
        .map_err(|e| {
            tracing::error!("Keeping current catalog: {:#}", e);
            StatusCode::UNPROCESSABLE_ENTITY
        })?;

    let profiles = state
        .hosts
        .reload_catalog(catalog)
        .await
        .map_err(|e| internal_error("Failed to swap catalog", e))?;

    Ok(Json(CatalogResponse { profiles }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use shared::types::DhcpRequest;
    use crate::config::CacheConfig;
    use crate::store::db::HostDb;

    const MAC: &str = "00:17:88:aa:bb:cc";

    fn test_state(catalog_path: PathBuf) -> (AppState, mpsc::Receiver<HostEvent>) {
        let (hash_tx, hash_rx) = watch::channel(String::new());
        let (location_tx, _location_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);
        let hosts = HostHandle::spawn(
            HostDb::open(":memory:").unwrap(),
            Default::default(),
            CacheConfig::default(),
            hash_tx,
            location_tx,
        );
        let state = AppState {
            hosts,
            hash_rx,
            catalog_path: Arc::new(catalog_path),
            event_tx,
        };
        (state, event_rx)
    }

    fn dhcp_event() -> HostEvent {
        HostEvent::Dhcp(DhcpRequest {
            ip_address: "192.168.1.20".to_string(),
            mac_address: MAC.to_string(),
            hostname: "Philips-hue".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_post_event_is_queued() {
        let (state, mut event_rx) = test_state(PathBuf::from("/nonexistent"));
        let status = post_event(State(state), Json(dhcp_event())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(event_rx.recv().await.unwrap().mac_address(), MAC);
    }

    #[tokio::test]
    async fn test_device_views() {
        let (state, _event_rx) = test_state(PathBuf::from("/nonexistent"));
        state.hosts.event(dhcp_event()).await.unwrap();

        let Json(devices) = get_devices(State(state.clone()), Query(ViewQuery::default())).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].ipv4_address, "192.168.1.20");

        let Json(device) = get_device(State(state.clone()), Path(MAC.to_uppercase())).await.unwrap();
        assert!(device.details.is_some());
        assert_eq!(
            get_device(State(state.clone()), Path("ff:ff:ff:ff:ff:ff".to_string())).await.unwrap_err(),
            StatusCode::NOT_FOUND
        );

        let Json(stats) = get_device_stats(State(state.clone()), Query(ViewQuery::default())).await.unwrap();
        assert_eq!(stats[MAC].hostname, "Philips-hue");

        let Json(traffic) = get_traffic_stats(State(state.clone()), Query(ViewQuery::default())).await.unwrap();
        assert!(traffic.is_empty(), "Unmatched hosts have no traffic stats");

        assert!(!get_hash(State(state.clone())).await.is_empty());
        state.hosts.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_catalog_reload() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"[{ "DeviceProfileUuid": "hue-bridge", "LastUpdated": 1500000000 }]"#)
            .unwrap();

        let (state, _event_rx) = test_state(file.path().to_path_buf());
        let Json(response) = post_catalog_reload(State(state.clone())).await.unwrap();
        assert_eq!(response.profiles, 1);

        let (missing, _event_rx) = test_state(PathBuf::from("/nonexistent/DeviceProfiles.json"));
        assert_eq!(
            post_catalog_reload(State(missing)).await.unwrap_err(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
