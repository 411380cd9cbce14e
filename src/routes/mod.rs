pub mod api;
pub mod ws;

use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(api::handle_health))
        // Cluster registry
        .route("/api/clusters", get(api::handle_list_clusters))
        .route("/api/clusters/active", get(api::handle_active_cluster))
        .route("/api/clusters/import", post(api::handle_import_cluster))
        .route(
            "/api/clusters/{tag}",
            get(api::handle_get_cluster).put(api::handle_save_cluster),
        )
        .route("/api/clusters/{tag}/switch", post(api::handle_switch_cluster))
        .route("/api/clusters/{tag}/logs", get(api::handle_log_history))
        .route("/api/clusters/{tag}/logs/{phase}", get(api::handle_phase_log))
        .route("/api/clusters/{tag}/status/{phase}", get(api::handle_phase_status))
        // Provisioning
        .route("/api/provision/{phase}", post(api::handle_launch_phase))
        // Status
        .route("/api/app/status", get(api::handle_app_status))
        .route("/api/app/pods", get(api::handle_pods))
        .route("/api/app/services", get(api::handle_services))
        .route("/api/cluster/status", get(api::handle_cluster_status))
        .route("/api/cache/status", get(api::handle_cache_status))
        .route("/api/cache/clear", post(api::handle_clear_cache))
        // Job logs
        .route("/api/logs/streams", get(api::handle_stream_list))
        .route("/api/jobs/{job}/pods/{pod}/logs", get(api::handle_job_log))
        .route("/api/jobs/{job}/pods/{pod}/logs/info", get(api::handle_job_log_info))
        .route(
            "/api/jobs/{job}/pods/{pod}/logs/download",
            get(api::handle_job_log_download),
        )
        .route(
            "/api/jobs/{job}/pods/{pod}/logs/collect",
            put(api::handle_start_collection).delete(api::handle_stop_collection),
        )
        .route("/ws", get(ws::handle_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
