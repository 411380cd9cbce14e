use futures_util::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::cache::{CacheEntry, CacheStatus, Cached, ResourceKind, read_through};
use super::single_flight::SingleFlight;
use crate::config::CacheConfig;
use crate::error::{CoreError, CoreResult};
use crate::helpers::{elapsed_ms, epoch_millis, lock};
use crate::models::k8s::{List, Node, Pod};
use crate::models::views::{ClusterStats, ClusterView, NodeGpuInfo};

/// Cached node list joined with per-node GPU accounting.
pub struct ClusterStatusService {
    flights: Arc<SingleFlight>,
    query_timeout: Duration,
    node_timeout: Duration,
    join_timeout: Duration,
    entry: Mutex<CacheEntry<ClusterView>>,
}

/// `allocatable - used`, never below zero.
pub fn available_gpus(allocatable: u32, used: u32) -> u32 {
    allocatable.saturating_sub(used)
}

impl ClusterStatusService {
    pub fn new(flights: Arc<SingleFlight>, cfg: &CacheConfig) -> Self {
        Self {
            flights,
            query_timeout: cfg.query_timeout(),
            node_timeout: cfg.node_query_timeout(),
            join_timeout: cfg.join_timeout(),
            entry: Mutex::new(CacheEntry::new(Duration::from_millis(cfg.cluster_ttl_ms))),
        }
    }

    pub async fn get_cluster_status(&self, force_refresh: bool) -> CoreResult<Cached<ClusterView>> {
        read_through(&self.entry, ResourceKind::Cluster, force_refresh, || async {
            tokio::time::timeout(self.join_timeout, self.fetch())
                .await
                .map_err(|_| CoreError::Timeout {
                    command: "cluster status".to_string(),
                    timeout_ms: self.join_timeout.as_millis() as u64,
                })?
        })
        .await
    }

    pub fn clear(&self) {
        self.flights.invalidate();
        lock(&self.entry).clear();
        info!("cluster status cache cleared");
    }

    pub fn cache_status(&self) -> CacheStatus {
        lock(&self.entry).status()
    }

    async fn fetch(&self) -> CoreResult<ClusterView> {
        let start = Instant::now();
        let output = self
            .flights
            .execute(args(&["get", "nodes", "-o", "json"]), self.query_timeout)
            .await?;
        let nodes: List<Node> =
            serde_json::from_str(&output).map_err(|e| CoreError::parse("nodes", e))?;
        if nodes.items.is_empty() {
            return Err(CoreError::NotFound("nodes in cluster".to_string()));
        }

        info!("fetching GPU info for {} nodes in parallel", nodes.items.len());
        let (infos, pending) = tokio::join!(
            join_all(nodes.items.iter().map(|n| self.node_gpu_info(n))),
            self.pending_gpus(),
        );

        let (pending_gpus, pending_error) = match pending {
            Ok(n) => (n, None),
            Err(e) => {
                warn!("failed to get pending pods: {}", e);
                (0, Some(e.to_string()))
            }
        };
        let stats = calculate_cluster_stats(&infos, pending_gpus);

        info!(
            "cluster status fetched in {}ms: {} nodes",
            elapsed_ms(start),
            infos.len()
        );
        Ok(ClusterView {
            node_count: infos.len(),
            nodes: infos,
            stats,
            pending_error,
            fetch_time_ms: elapsed_ms(start),
            timestamp: epoch_millis(),
        })
    }

    /// Never fails: a failed lookup is recorded on the node itself.
    async fn node_gpu_info(&self, node: &Node) -> NodeGpuInfo {
        let node_name = node.metadata.name.clone();
        let mut info = NodeGpuInfo {
            node_name: node_name.clone(),
            instance_type: node.instance_type(),
            total_gpu: node.gpu_capacity(),
            allocatable_gpu: node.gpu_allocatable(),
            node_ready: node.is_ready(),
            ..Default::default()
        };

        let selector = format!("spec.nodeName={},status.phase=Running", node_name);
        let query = args(&["get", "pods", "--field-selector", &selector, "-o", "json"]);
        let used = match self.flights.execute(query, self.query_timeout).await {
            Ok(out) => serde_json::from_str::<List<Pod>>(&out)
                .map(|pods| pods.items.iter().map(Pod::gpu_requests).sum::<u32>())
                .map_err(|e| CoreError::parse(format!("pods on {}", node_name), e)),
            Err(e) => Err(e),
        };

        match used {
            Ok(used) => {
                info.used_gpu = used;
                info.available_gpu = available_gpus(info.allocatable_gpu, used);
            }
            Err(e) => {
                warn!("error fetching GPU info for node {}: {}", node_name, e);
                info.error = Some(e.to_string());
            }
        }
        info
    }

    /// GPUs requested by pending pods. Pending pods have no node yet, so this
    /// is cluster-wide.
    async fn pending_gpus(&self) -> CoreResult<u32> {
        let query = args(&[
            "get",
            "pods",
            "--field-selector",
            "status.phase=Pending",
            "-o",
            "json",
        ]);
        let out = self.flights.execute(query, self.node_timeout).await?;
        let pods: List<Pod> =
            serde_json::from_str(&out).map_err(|e| CoreError::parse("pending pods", e))?;
        Ok(pods.items.iter().map(Pod::gpu_requests).sum())
    }
}

fn args(a: &[&str]) -> Vec<String> {
    a.iter().map(|s| s.to_string()).collect()
}

pub fn calculate_cluster_stats(nodes: &[NodeGpuInfo], pending_gpus: u32) -> ClusterStats {
    nodes.iter().fold(
        ClusterStats {
            pending_gpus,
            ..Default::default()
        },
        |mut s, n| {
            s.total_nodes += 1;
            s.ready_nodes += usize::from(n.node_ready);
            s.error_nodes += usize::from(n.error.is_some());
            s.total_gpus += n.total_gpu;
            s.used_gpus += n.used_gpu;
            s.available_gpus += n.available_gpu;
            s.allocatable_gpus += n.allocatable_gpu;
            s
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::single_flight::testing::FakeRunner;

    const NODES: &str = r#"{"items": [
        {"metadata": {"name": "n1", "labels": {"node.kubernetes.io/instance-type": "p5.48xlarge"}},
         "status": {"capacity": {"nvidia.com/gpu": "8"}, "allocatable": {"nvidia.com/gpu": "4"},
                    "conditions": [{"type": "Ready", "status": "True"}]}},
        {"metadata": {"name": "n2"},
         "status": {"capacity": {"nvidia.com/gpu": "8"}, "allocatable": {"nvidia.com/gpu": "8"},
                    "conditions": [{"type": "Ready", "status": "False"}]}}
    ]}"#;

    fn gpu_pods(counts: &[u32]) -> String {
        let items: Vec<String> = counts
            .iter()
            .map(|n| {
                format!(
                    r#"{{"spec": {{"containers": [{{"resources": {{"requests": {{"nvidia.com/gpu": "{}"}}}}}}]}}}}"#,
                    n
                )
            })
            .collect();
        format!(r#"{{"items": [{}]}}"#, items.join(","))
    }

    fn service(runner: Arc<FakeRunner>) -> ClusterStatusService {
        ClusterStatusService::new(
            Arc::new(SingleFlight::new(runner)),
            &CacheConfig::default(),
        )
    }

    #[test]
    fn available_is_clamped() {
        for (allocatable, used) in [(0, 1), (4, 6), (1, u32::MAX)] {
            assert_eq!(available_gpus(allocatable, used), 0);
        }
        assert_eq!(available_gpus(8, 3), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn per_node_failure_is_isolated() {
        let runner = FakeRunner::new(Duration::from_millis(20));
        runner.respond("get nodes -o json", Ok(NODES.into()));
        runner.respond(
            "get pods --field-selector spec.nodeName=n1,status.phase=Running -o json",
            Ok(gpu_pods(&[4, 2])),
        );
        runner.respond(
            "get pods --field-selector status.phase=Pending -o json",
            Ok(gpu_pods(&[1])),
        );
        let svc = service(runner.clone());

        let view = svc.get_cluster_status(true).await.unwrap().data;
        assert_eq!(view.node_count, 2);

        let n1 = &view.nodes[0];
        assert_eq!(n1.instance_type, "p5.48xlarge");
        assert_eq!(n1.used_gpu, 6);
        assert_eq!(n1.available_gpu, 0);
        assert!(n1.error.is_none());

        let n2 = &view.nodes[1];
        assert!(n2.error.is_some());
        assert_eq!(n2.total_gpu, 8);
        assert_eq!(n2.available_gpu, 0);

        assert_eq!(view.stats.total_nodes, 2);
        assert_eq!(view.stats.ready_nodes, 1);
        assert_eq!(view.stats.error_nodes, 1);
        assert_eq!(view.stats.total_gpus, 16);
        assert_eq!(view.stats.pending_gpus, 1);
        assert!(view.pending_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cluster_fetch_times_out() {
        let runner = FakeRunner::new(Duration::from_secs(30));
        runner.respond("get nodes -o json", Ok(NODES.into()));
        let svc = service(runner.clone());

        let err = svc.get_cluster_status(true).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout { timeout_ms: 20_000, .. }));
        assert!(!svc.cache_status().cached);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_cluster_is_an_error_only_when_forced() {
        let runner = FakeRunner::new(Duration::from_millis(5));
        runner.respond("get nodes -o json", Ok(r#"{"items": []}"#.into()));
        let svc = service(runner.clone());

        assert!(matches!(
            svc.get_cluster_status(true).await,
            Err(CoreError::NotFound(_))
        ));

        let plain = svc.get_cluster_status(false).await.unwrap();
        assert!(plain.data.nodes.is_empty());
        assert!(plain.error.is_some());
        assert!(!svc.cache_status().cached);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_until_cleared() {
        let runner = FakeRunner::new(Duration::from_millis(5));
        runner.respond("get nodes -o json", Ok(NODES.into()));
        runner.respond(
            "get pods --field-selector status.phase=Pending -o json",
            Ok(gpu_pods(&[])),
        );
        let svc = service(runner.clone());

        svc.get_cluster_status(false).await.unwrap();
        assert!(svc.get_cluster_status(false).await.unwrap().cached);
        assert_eq!(runner.calls_for("get nodes -o json"), 1);

        svc.clear();
        assert!(!svc.get_cluster_status(false).await.unwrap().cached);
        assert_eq!(runner.calls_for("get nodes -o json"), 2);
    }
}
