use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::fs;
use tokio_util::io::ReaderStream;

use crate::AppState;
use crate::error::{CoreError, CoreResult};
use crate::helpers::epoch_millis;
use crate::logs::StreamKey;
use crate::registry::extract_cluster_tag;
use crate::registry::record::{AccessEntry, ClusterStatus, EnvMap};
use crate::status::ResourceKind;

#[derive(Debug, Default, Deserialize)]
pub struct RefreshQuery {
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct OffsetQuery {
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CacheQuery {
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub cluster_tag: Option<String>,
    #[serde(default)]
    pub env: EnvMap,
    pub access_entry: Option<AccessEntry>,
}

pub async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": epoch_millis() }))
}

// Clusters

pub async fn handle_list_clusters(State(state): State<AppState>) -> Json<Value> {
    let registry = &state.coordinator.registry;
    let clusters = registry.list_clusters().await;
    Json(json!({
        "clusters": clusters,
        "activeCluster": registry.get_active().await,
    }))
}

/// The active pointer, plus the tag found in the working `init_envs` (they
/// differ when the working area was edited by hand).
pub async fn handle_active_cluster(State(state): State<AppState>) -> Json<Value> {
    let registry = &state.coordinator.registry;
    let working_tag = fs::read_to_string(registry.working_dir().join("init_envs"))
        .await
        .ok()
        .and_then(|envs| extract_cluster_tag(&envs).ok());
    Json(json!({
        "activeCluster": registry.get_active().await,
        "workingTag": working_tag,
    }))
}

pub async fn handle_get_cluster(
    State(state): State<AppState>,
    Path(tag): Path<String>,
) -> CoreResult<Response> {
    let record = state.coordinator.registry.get_record(&tag).await?;
    Ok(Json(record).into_response())
}

pub async fn handle_save_cluster(
    State(state): State<AppState>,
    Path(tag): Path<String>,
    Json(config): Json<Value>,
) -> CoreResult<Response> {
    let record = state
        .coordinator
        .registry
        .save_record(&tag, config, ClusterStatus::Configured)
        .await?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

pub async fn handle_switch_cluster(
    State(state): State<AppState>,
    Path(tag): Path<String>,
) -> CoreResult<Response> {
    let switched = state.coordinator.switch_cluster(&tag).await?;
    Ok(Json(json!({ "success": true, "result": switched })).into_response())
}

pub async fn handle_import_cluster(
    State(state): State<AppState>,
    Json(req): Json<ImportRequest>,
) -> CoreResult<Response> {
    let tag = req
        .cluster_tag
        .or_else(|| req.env.get("CLUSTER_TAG").cloned())
        .ok_or_else(|| CoreError::InvalidInput("clusterTag is required".to_string()))?;
    let record = state
        .coordinator
        .registry
        .import_cluster(&tag, &req.env, req.access_entry)
        .await?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

pub async fn handle_phase_status(
    State(state): State<AppState>,
    Path((tag, phase)): Path<(String, String)>,
) -> Response {
    match state.coordinator.registry.read_phase_status(&tag, &phase).await {
        Some(status) => Json(status).into_response(),
        None => CoreError::NotFound(format!("{} status for {}", phase, tag)).into_response(),
    }
}

pub async fn handle_log_history(
    State(state): State<AppState>,
    Path(tag): Path<String>,
) -> Json<Value> {
    let logs = state.coordinator.registry.phase_log_history(&tag).await;
    Json(json!({ "logs": logs }))
}

pub async fn handle_phase_log(
    State(state): State<AppState>,
    Path((tag, phase)): Path<(String, String)>,
    Query(q): Query<OffsetQuery>,
) -> Response {
    let chunk = state
        .coordinator
        .registry
        .read_phase_log(&tag, &phase, q.offset)
        .await;
    Json(chunk).into_response()
}

pub async fn handle_launch_phase(
    State(state): State<AppState>,
    Path(phase): Path<String>,
    Query(q): Query<ForceQuery>,
) -> CoreResult<Response> {
    let launch = state.coordinator.launch_phase(&phase, q.force).await?;
    Ok((StatusCode::ACCEPTED, Json(launch)).into_response())
}

// Status

pub async fn handle_app_status(
    State(state): State<AppState>,
    Query(q): Query<RefreshQuery>,
) -> CoreResult<Response> {
    let status = state.coordinator.app.get_app_status(q.refresh).await?;
    Ok(Json(status).into_response())
}

pub async fn handle_pods(
    State(state): State<AppState>,
    Query(q): Query<RefreshQuery>,
) -> CoreResult<Response> {
    let pods = state.coordinator.app.get_pods(q.refresh).await?;
    Ok(Json(pods).into_response())
}

pub async fn handle_services(
    State(state): State<AppState>,
    Query(q): Query<RefreshQuery>,
) -> CoreResult<Response> {
    let services = state.coordinator.app.get_services(q.refresh).await?;
    Ok(Json(services).into_response())
}

pub async fn handle_cluster_status(
    State(state): State<AppState>,
    Query(q): Query<RefreshQuery>,
) -> CoreResult<Response> {
    let status = state.coordinator.cluster.get_cluster_status(q.refresh).await?;
    Ok(Json(status).into_response())
}

pub async fn handle_cache_status(State(state): State<AppState>) -> Json<Value> {
    let status: serde_json::Map<String, Value> = state
        .coordinator
        .cache_status()
        .into_iter()
        .map(|(kind, s)| (kind.as_str().to_string(), json!(s)))
        .collect();
    Json(Value::Object(status))
}

pub async fn handle_clear_cache(
    State(state): State<AppState>,
    Query(q): Query<CacheQuery>,
) -> CoreResult<Response> {
    let kind = match q.kind.as_deref() {
        None | Some("all") => None,
        Some(k) => Some(k.parse::<ResourceKind>()?),
    };
    state.coordinator.clear_cache(kind);
    Ok(Json(json!({ "success": true, "cleared": q.kind.unwrap_or_else(|| "all".into()) }))
        .into_response())
}

// Job logs

pub async fn handle_stream_list(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "streams": state.coordinator.logs.active_streams() }))
}

pub async fn handle_job_log(
    State(state): State<AppState>,
    Path((job, pod)): Path<(String, String)>,
    Query(q): Query<OffsetQuery>,
) -> CoreResult<Response> {
    let chunk = state
        .coordinator
        .logs
        .tail_log(&StreamKey::new(job, pod), q.offset)
        .await?;
    Ok(Json(chunk).into_response())
}

pub async fn handle_job_log_info(
    State(state): State<AppState>,
    Path((job, pod)): Path<(String, String)>,
) -> CoreResult<Response> {
    let key = StreamKey::new(job, pod);
    match state.coordinator.logs.log_info(&key).await? {
        Some(info) => Ok(Json(info).into_response()),
        None => Err(CoreError::NotFound(format!("log for {}", key))),
    }
}

pub async fn handle_job_log_download(
    State(state): State<AppState>,
    Path((job, pod)): Path<(String, String)>,
) -> CoreResult<Response> {
    let key = StreamKey::new(job, pod);
    let path = state.coordinator.logs.log_path(&key).await?;
    let file = match fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CoreError::NotFound(format!("log for {}", key)));
        }
        Err(e) => return Err(e.into()),
    };

    let disposition = format!("attachment; filename=\"{}-{}.log\"", key.job, key.unit);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

pub async fn handle_start_collection(
    State(state): State<AppState>,
    Path((job, pod)): Path<(String, String)>,
) -> CoreResult<Response> {
    let started = state
        .coordinator
        .logs
        .start_auto_collection(StreamKey::new(job, pod))?;
    Ok(Json(json!({ "success": true, "started": started })).into_response())
}

pub async fn handle_stop_collection(
    State(state): State<AppState>,
    Path((job, pod)): Path<(String, String)>,
) -> Json<Value> {
    let stopped = state
        .coordinator
        .logs
        .stop_auto_collection(&StreamKey::new(job, pod));
    Json(json!({ "success": true, "stopped": stopped }))
}
