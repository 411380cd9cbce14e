use serde::Serialize;
use std::collections::BTreeMap;

use super::k8s::{Pod, Service, ServicePort};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProcessedStatus {
    pub phase: String,
    /// Lower-cased phase, or `not-ready` for a running pod failing readiness.
    pub status: String,
    pub ready: bool,
    pub reason: Option<String>,
    pub conditions: usize,
    pub containers: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodView {
    #[serde(flatten)]
    pub pod: Pod,
    pub processed_status: ProcessedStatus,
    pub gpu: u32,
    pub age: String,
    pub ready: bool,
    pub restarts: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoints {
    #[serde(rename = "clusterIP")]
    pub cluster_ip: Option<String>,
    #[serde(rename = "type")]
    pub service_type: String,
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
    #[serde(flatten)]
    pub service: Service,
    pub endpoints: ServiceEndpoints,
    pub age: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodsSnapshot {
    pub pods: Vec<PodView>,
    pub count: usize,
    pub fetch_time_ms: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicesSnapshot {
    pub services: Vec<ServiceView>,
    pub count: usize,
    pub fetch_time_ms: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodStats {
    pub total: usize,
    pub ready: usize,
    pub with_gpu: usize,
    pub by_status: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppStats {
    pub pods: PodStats,
    pub services: ServiceStats,
    /// Percentage of ready pods; 100 when there are none.
    pub health_score: u32,
}

/// Error text per branch of a composite query.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubQueryErrors {
    pub pods: Option<String>,
    pub services: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatusView {
    pub pods: Vec<PodView>,
    pub services: Vec<ServiceView>,
    pub stats: AppStats,
    pub errors: SubQueryErrors,
    pub fetch_time_ms: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeGpuInfo {
    pub node_name: String,
    pub instance_type: String,
    pub total_gpu: u32,
    pub used_gpu: u32,
    pub available_gpu: u32,
    pub allocatable_gpu: u32,
    pub node_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStats {
    pub total_nodes: usize,
    pub ready_nodes: usize,
    pub error_nodes: usize,
    pub total_gpus: u32,
    pub used_gpus: u32,
    pub available_gpus: u32,
    pub allocatable_gpus: u32,
    /// Requested by pending pods cluster-wide; not attributable to a node.
    pub pending_gpus: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    pub nodes: Vec<NodeGpuInfo>,
    pub node_count: usize,
    pub stats: ClusterStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_error: Option<String>,
    pub fetch_time_ms: u64,
    pub timestamp: i64,
}
