// Growbox Dashboard - HTTP API
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! HTTP handlers and router.
//!
//! Store access runs on the blocking pool; a read failure becomes a 500
//! with a JSON `{error}` body. Every handler returns whatever data exists,
//! so an empty store yields empty objects rather than an error.

use std::collections::BTreeMap;
use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use growbox::sample::{self, wire_time};
use growbox::{
    DeviceClass, HistoryEngine, Reading, SensorHistory, SensorId, SharedLiveCache, StorageError,
    Store, Timestamp, MAX_HISTORY_WINDOW,
};
use growbox_gateway::AcquisitionStats;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::export::{write_csv, ExportError, EXPORT_FILENAME};
use crate::metrics::{encode_metrics, update_acquisition_metrics, update_storage_metrics};
use crate::relay::RelayState;
use crate::system::{SystemMonitor, SystemStats};

/// Rows returned by `/api/readings` without `limit`
pub const DEFAULT_READINGS_LIMIT: usize = 100;
const MAX_READINGS_LIMIT: usize = 10_000;
const MAX_HISTORY_HOURS: f64 = (MAX_HISTORY_WINDOW.as_secs() / 3600) as f64;

/// Application state shared across handlers.
pub struct AppState {
    pub store: Arc<Store>,
    pub live: SharedLiveCache,
    pub history: HistoryEngine,
    /// Configured power meters; empty when the power class is disabled
    pub power_meters: Vec<SensorId>,
    pub acquisition: Vec<(DeviceClass, Arc<AcquisitionStats>)>,
    pub relay: Option<Arc<RelayState>>,
    pub system: SystemMonitor,
    pub hls_dir: PathBuf,
    pub start_time: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(store: Arc<Store>, live: SharedLiveCache, history: HistoryEngine) -> Self {
        Self {
            store,
            live,
            history,
            power_meters: Vec::new(),
            acquisition: Vec::new(),
            relay: None,
            system: SystemMonitor::default(),
            hls_dir: PathBuf::from("hls"),
            start_time: Instant::now(),
        }
    }

    fn power_enabled(&self) -> bool {
        !self.power_meters.is_empty()
    }
}

/// Errors surfaced to HTTP clients.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Export failed: {0}")]
    Export(#[from] ExportError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Metrics encoding failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Live cache unavailable")]
    LiveCachePoisoned,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found")]
    NotFound,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run a store call on the blocking pool.
async fn with_store<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Store) -> growbox::Result<T> + Send + 'static,
{
    let store = Arc::clone(&state.store);
    let value = tokio::task::spawn_blocking(move || f(&store)).await??;
    Ok(value)
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/data", get(data))
        .route("/sensor/:id", get(sensor))
        .route("/history", get(history))
        .route("/clear", post(clear))
        .route("/export", get(export))
        .route("/live", get(live))
        .route("/api/readings", get(readings))
        .route("/power", get(power))
        .route("/system", get(system))
        .route("/ping", get(ping))
        .route("/hls/*path", get(hls))
        .route("/metrics", get(metrics))
        .with_state(state)
}

// ============================================================================
// Latest values
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct DataParams {
    pub since: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestEntry {
    #[serde(with = "wire_time")]
    pub timestamp: Timestamp,
    pub temp: Option<f64>,
    pub hum: Option<f64>,
}

/// `GET /data[?since=]`: latest climate sample per sensor.
pub async fn data(
    State(state): State<SharedState>,
    Query(params): Query<DataParams>,
) -> ApiResult<Json<BTreeMap<SensorId, LatestEntry>>> {
    let since = match params.since.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            sample::parse_timestamp(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("invalid since: {}", raw)))?,
        ),
    };

    let latest = with_store(&state, move |store| store.latest_per_sensor(since)).await?;
    let body = latest
        .into_iter()
        .map(|(id, sample)| {
            let entry = LatestEntry {
                timestamp: sample.timestamp,
                temp: sample.temperature(),
                hum: sample.humidity(),
            };
            (id, entry)
        })
        .collect();
    Ok(Json(body))
}

/// `GET /sensor/:id`: last climate sample of one sensor, 404 when it never
/// reported.
pub async fn sensor(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<LatestEntry>> {
    let sensor_id = SensorId::new(id);
    let sample = with_store(&state, move |store| store.latest_for(&sensor_id))
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(LatestEntry {
        timestamp: sample.timestamp,
        temp: sample.temperature(),
        hum: sample.humidity(),
    }))
}

// ============================================================================
// History
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub hours: Option<f64>,
}

/// `GET /history[?hours=]`: downsampled series per sensor.
pub async fn history(
    State(state): State<SharedState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<BTreeMap<SensorId, SensorHistory>>> {
    let window = match params.hours {
        None => state.history.config().window,
        Some(hours) if hours > 0.0 && hours <= MAX_HISTORY_HOURS => {
            std::time::Duration::from_secs_f64(hours * 3600.0)
        }
        Some(hours) => {
            return Err(ApiError::BadRequest(format!(
                "hours must be in (0, {}], got {}",
                MAX_HISTORY_HOURS, hours
            )))
        }
    };
    let since = chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| sample::now().checked_sub_signed(window))
        .ok_or_else(|| ApiError::BadRequest("hours out of range".to_string()))?;

    let samples = with_store(&state, move |store| store.range_since(since)).await?;
    Ok(Json(state.history.build(&samples)))
}

// ============================================================================
// Maintenance
// ============================================================================

/// `POST /clear`: wipe the store and the live buffers.
pub async fn clear(State(state): State<SharedState>) -> ApiResult<Json<serde_json::Value>> {
    with_store(&state, |store| store.clear()).await?;
    state
        .live
        .write()
        .map_err(|_| ApiError::LiveCachePoisoned)?
        .clear();
    Ok(Json(json!({ "status": "ok" })))
}

/// `GET /export`: CSV attachment of every stored row.
pub async fn export(State(state): State<SharedState>) -> ApiResult<Response> {
    let with_power = state.power_enabled();
    let (climate, power) = with_store(&state, move |store| {
        let climate = store.dump_all()?;
        let power = if with_power {
            Some(store.dump_power()?)
        } else {
            None
        };
        Ok((climate, power))
    })
    .await?;

    let body = write_csv(&climate, power.as_deref())?;
    let disposition = format!("attachment; filename=\"{}\"", EXPORT_FILENAME);
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

// ============================================================================
// Live buffers and raw rows
// ============================================================================

/// `GET /live`: live buffer contents per sensor, oldest first.
pub async fn live(
    State(state): State<SharedState>,
) -> ApiResult<Json<BTreeMap<SensorId, Vec<growbox::Sample>>>> {
    let live = state.live.read().map_err(|_| ApiError::LiveCachePoisoned)?;
    let body = live
        .iter()
        .map(|(id, buffer)| (id.clone(), buffer.iter().cloned().collect()))
        .collect();
    Ok(Json(body))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadingsParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingEntry {
    pub sensor: SensorId,
    #[serde(with = "wire_time")]
    pub timestamp: Timestamp,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

/// `GET /api/readings[?limit=]`: newest climate rows first.
pub async fn readings(
    State(state): State<SharedState>,
    Query(params): Query<ReadingsParams>,
) -> ApiResult<Json<Vec<ReadingEntry>>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_READINGS_LIMIT)
        .min(MAX_READINGS_LIMIT);
    let rows = with_store(&state, move |store| store.recent(limit)).await?;
    let body = rows
        .into_iter()
        .rev()
        .map(|row| ReadingEntry {
            temperature: row.sample.temperature(),
            humidity: row.sample.humidity(),
            timestamp: row.sample.timestamp,
            sensor: row.sample.sensor_id,
        })
        .collect();
    Ok(Json(body))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerEntry {
    #[serde(with = "wire_time")]
    pub timestamp: Timestamp,
    pub apower: Option<f64>,
    pub aenergy: Option<f64>,
    pub temperature: Option<f64>,
}

/// `GET /power`: latest sample of each configured meter, `null` if none yet.
pub async fn power(
    State(state): State<SharedState>,
) -> ApiResult<Json<BTreeMap<SensorId, Option<PowerEntry>>>> {
    let meters = state.power_meters.clone();
    let latest = with_store(&state, move |store| {
        meters
            .into_iter()
            .map(|id| store.latest_power(&id).map(|sample| (id, sample)))
            .collect::<growbox::Result<Vec<_>>>()
    })
    .await?;

    let body = latest
        .into_iter()
        .map(|(id, sample)| {
            let entry = sample.and_then(|s| match s.reading {
                Reading::Power(p) => Some(PowerEntry {
                    timestamp: s.timestamp,
                    apower: p.apower,
                    aenergy: p.aenergy,
                    temperature: p.temperature,
                }),
                Reading::Climate(_) => None,
            });
            (id, entry)
        })
        .collect();
    Ok(Json(body))
}

// ============================================================================
// Host, video and health
// ============================================================================

/// `GET /system`: CPU load and SoC temperature.
pub async fn system(State(state): State<SharedState>) -> Json<SystemStats> {
    Json(state.system.sample().await)
}

/// `GET /ping`
pub async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Resolve `requested` below `root`, refusing anything but plain names.
pub fn hls_file_path(root: &FsPath, requested: &str) -> Option<PathBuf> {
    let relative = FsPath::new(requested);
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if requested.is_empty() || !plain {
        return None;
    }
    Some(root.join(relative))
}

fn hls_content_type(path: &FsPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("m4s") | Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// `GET /hls/*path`: playlist and segments written by the video relay.
pub async fn hls(
    State(state): State<SharedState>,
    Path(requested): Path<String>,
) -> ApiResult<Response> {
    let path = hls_file_path(&state.hls_dir, &requested)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid path: {}", requested)))?;
    let body = match tokio::fs::read(&path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ApiError::NotFound),
        Err(e) => return Err(ApiError::Io(e)),
    };
    Ok((
        [
            (header::CONTENT_TYPE, hls_content_type(&path)),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

/// `GET /metrics`: Prometheus text format.
pub async fn metrics(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    for (class, stats) in &state.acquisition {
        update_acquisition_metrics(*class, &stats.snapshot());
    }
    let rows = with_store(&state, |store| store.row_count()).await?;
    let live_samples = state
        .live
        .read()
        .map_err(|_| ApiError::LiveCachePoisoned)?
        .total_samples();
    update_storage_metrics(rows, live_samples);

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        encode_metrics()?,
    ))
}

// ============================================================================
// Index page
// ============================================================================

#[derive(Debug)]
struct StatusLine {
    sensors: usize,
    power_meters: usize,
    uptime_secs: u64,
    relay_running: bool,
}

/// `GET /`: minimal index of sensors and endpoints.
pub async fn index(State(state): State<SharedState>) -> ApiResult<Html<String>> {
    let sensors: Vec<SensorId> = {
        let live = state.live.read().map_err(|_| ApiError::LiveCachePoisoned)?;
        live.iter()
            .map(|(id, _)| id.clone())
            .filter(|id| !state.power_meters.contains(id))
            .collect()
    };
    let status = StatusLine {
        sensors: sensors.len(),
        power_meters: state.power_meters.len(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        relay_running: state
            .relay
            .as_ref()
            .map(|r| r.running.load(std::sync::atomic::Ordering::SeqCst))
            .unwrap_or(false),
    };

    let list = |ids: &[SensorId]| -> String {
        if ids.is_empty() {
            return "<li><em>none</em></li>".to_string();
        }
        ids.iter()
            .map(|id| format!("<li><code>{}</code></li>", escape_html(id.as_str())))
            .collect()
    };

    Ok(Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Growbox</title>
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }}
        h1 {{ color: #2c3e50; }}
        a {{ color: #3498db; text-decoration: none; }}
        .endpoints {{ background: #f8f9fa; padding: 20px; border-radius: 8px; margin: 20px 0; }}
        code {{ background: #e9ecef; padding: 2px 6px; border-radius: 4px; }}
    </style>
</head>
<body>
    <h1>Growbox</h1>
    <p>Up {uptime}s, video relay {relay}.</p>

    <h2>Climate sensors</h2>
    <ul>{climate}</ul>

    <h2>Power meters</h2>
    <ul>{power}</ul>

    <div class="endpoints">
        <h2>Endpoints</h2>
        <div><a href="/data">/data</a> - Latest value per sensor</div>
        <div><code>/sensor/&lt;id&gt;</code> - Latest value of one sensor</div>
        <div><a href="/history">/history</a> - Downsampled chart series</div>
        <div><a href="/live">/live</a> - Live buffers</div>
        <div><a href="/api/readings">/api/readings</a> - Newest rows</div>
        <div><a href="/power">/power</a> - Power meters</div>
        <div><a href="/system">/system</a> - Host CPU and temperature</div>
        <div><a href="/export">/export</a> - CSV download</div>
        <div><a href="/hls/stream.m3u8">/hls/stream.m3u8</a> - Video playlist</div>
        <div><a href="/metrics">/metrics</a> - Prometheus metrics</div>
    </div>
</body>
</html>"#,
        uptime = status.uptime_secs,
        relay = if status.relay_running {
            "running"
        } else {
            "stopped"
        },
        climate = list(sensors.as_slice()),
        power = list(state.power_meters.as_slice()),
    )))
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
