use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

use super::cache::{CacheEntry, CacheStatus, Cached, ResourceKind, read_through};
use super::single_flight::SingleFlight;
use crate::config::CacheConfig;
use crate::error::{CoreError, CoreResult};
use crate::helpers::{elapsed_ms, epoch_millis, lock, parse_age};
use crate::models::k8s::{List, Pod, Service};
use crate::models::views::{
    AppStats, AppStatusView, PodStats, PodView, PodsSnapshot, ProcessedStatus, ServiceEndpoints,
    ServiceStats, ServiceView, ServicesSnapshot, SubQueryErrors,
};

/// Cached pod, service and combined application views.
pub struct AppStatusService {
    flights: Arc<SingleFlight>,
    timeout: Duration,
    join_timeout: Duration,
    pods: Mutex<CacheEntry<PodsSnapshot>>,
    services: Mutex<CacheEntry<ServicesSnapshot>>,
    combined: Mutex<CacheEntry<AppStatusView>>,
}

fn kubectl_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

impl AppStatusService {
    pub fn new(flights: Arc<SingleFlight>, cfg: &CacheConfig) -> Self {
        Self {
            flights,
            timeout: cfg.query_timeout(),
            join_timeout: cfg.join_timeout(),
            pods: Mutex::new(CacheEntry::new(Duration::from_millis(cfg.pods_ttl_ms))),
            services: Mutex::new(CacheEntry::new(Duration::from_millis(cfg.services_ttl_ms))),
            combined: Mutex::new(CacheEntry::new(Duration::from_millis(cfg.combined_ttl_ms))),
        }
    }

    pub async fn get_pods(&self, force_refresh: bool) -> CoreResult<Cached<PodsSnapshot>> {
        read_through(&self.pods, ResourceKind::Pods, force_refresh, || self.fetch_pods()).await
    }

    pub async fn get_services(&self, force_refresh: bool) -> CoreResult<Cached<ServicesSnapshot>> {
        read_through(&self.services, ResourceKind::Services, force_refresh, || {
            self.fetch_services()
        })
        .await
    }

    /// Pods and services fetched in parallel. A failing branch is reported in
    /// `errors` next to whatever the other branch returned.
    pub async fn get_app_status(&self, force_refresh: bool) -> CoreResult<Cached<AppStatusView>> {
        read_through(&self.combined, ResourceKind::Combined, force_refresh, || {
            self.fetch_combined(force_refresh)
        })
        .await
    }

    /// Also detaches in-flight queries so later reads start a new execution.
    pub fn clear(&self, kind: Option<ResourceKind>) {
        self.flights.invalidate();
        for k in [ResourceKind::Pods, ResourceKind::Services, ResourceKind::Combined] {
            if kind.is_none() || kind == Some(k) {
                match k {
                    ResourceKind::Pods => lock(&self.pods).clear(),
                    ResourceKind::Services => lock(&self.services).clear(),
                    _ => lock(&self.combined).clear(),
                }
                info!("app status cache cleared: {}", k.as_str());
            }
        }
    }

    pub fn cache_status(&self) -> HashMap<ResourceKind, CacheStatus> {
        HashMap::from([
            (ResourceKind::Pods, lock(&self.pods).status()),
            (ResourceKind::Services, lock(&self.services).status()),
            (ResourceKind::Combined, lock(&self.combined).status()),
        ])
    }

    async fn fetch_pods(&self) -> CoreResult<PodsSnapshot> {
        let start = Instant::now();
        let output = self
            .flights
            .execute(kubectl_args(&["get", "pods", "-o", "json"]), self.timeout)
            .await?;
        let list: List<Pod> =
            serde_json::from_str(&output).map_err(|e| CoreError::parse("pods", e))?;

        let now = Utc::now();
        let pods: Vec<PodView> = list.items.into_iter().map(|p| process_pod(p, now)).collect();
        info!("pods fetched in {}ms: {} pods", elapsed_ms(start), pods.len());

        Ok(PodsSnapshot {
            count: pods.len(),
            pods,
            fetch_time_ms: elapsed_ms(start),
            timestamp: epoch_millis(),
        })
    }

    async fn fetch_services(&self) -> CoreResult<ServicesSnapshot> {
        let start = Instant::now();
        let output = self
            .flights
            .execute(kubectl_args(&["get", "services", "-o", "json"]), self.timeout)
            .await?;
        let list: List<Service> =
            serde_json::from_str(&output).map_err(|e| CoreError::parse("services", e))?;

        let now = Utc::now();
        let services: Vec<ServiceView> = list
            .items
            .into_iter()
            .map(|s| process_service(s, now))
            .collect();

        Ok(ServicesSnapshot {
            count: services.len(),
            services,
            fetch_time_ms: elapsed_ms(start),
            timestamp: epoch_millis(),
        })
    }

    async fn fetch_combined(&self, force_refresh: bool) -> CoreResult<AppStatusView> {
        let start = Instant::now();
        let joined = async {
            tokio::join!(self.get_pods(force_refresh), self.get_services(force_refresh))
        };
        let (pods, services) = tokio::time::timeout(self.join_timeout, joined)
            .await
            .map_err(|_| CoreError::Timeout {
                command: "app status".to_string(),
                timeout_ms: self.join_timeout.as_millis() as u64,
            })?;

        let (pods, pods_error) = settle(pods, |s: PodsSnapshot| s.pods);
        let (services, services_error) = settle(services, |s: ServicesSnapshot| s.services);
        let stats = calculate_app_stats(&pods, &services);

        Ok(AppStatusView {
            pods,
            services,
            stats,
            errors: SubQueryErrors {
                pods: pods_error,
                services: services_error,
            },
            fetch_time_ms: elapsed_ms(start),
            timestamp: epoch_millis(),
        })
    }
}

/// Splits one branch of a composite into its items and its error, if any.
fn settle<S, T>(result: CoreResult<Cached<S>>, items: impl FnOnce(S) -> Vec<T>) -> (Vec<T>, Option<String>) {
    match result {
        Ok(c) => (items(c.data), c.error),
        Err(e) => (Vec::new(), Some(e.to_string())),
    }
}

pub fn calculate_pod_status(pod: &Pod) -> ProcessedStatus {
    let phase = pod.status.phase.clone();
    let ready_condition = pod
        .status
        .conditions
        .iter()
        .find(|c| c.condition_type == "Ready");
    let ready = ready_condition.is_some_and(|c| c.status == "True");

    let mut status = if phase.is_empty() {
        "unknown".to_string()
    } else {
        phase.to_lowercase()
    };
    let mut reason = None;

    if phase == "Running" && !ready {
        status = "not-ready".to_string();
        reason = Some(
            ready_condition
                .and_then(|c| c.reason.clone())
                .unwrap_or_else(|| "ContainerNotReady".to_string()),
        );
    }

    let container_reason = pod.status.container_statuses.iter().find_map(|cs| {
        let waiting = cs.state.waiting.as_ref().and_then(|w| w.reason.clone());
        waiting.or_else(|| cs.state.terminated.as_ref().and_then(|t| t.reason.clone()))
    });
    if container_reason.is_some() {
        reason = container_reason;
    }

    ProcessedStatus {
        phase,
        status,
        ready,
        reason,
        conditions: pod.status.conditions.len(),
        containers: pod.status.container_statuses.len(),
    }
}

fn process_pod(pod: Pod, now: DateTime<Utc>) -> PodView {
    let processed_status = calculate_pod_status(&pod);
    PodView {
        ready: processed_status.ready,
        gpu: pod.gpu_requests(),
        restarts: pod.restarts(),
        age: parse_age(pod.metadata.creation_timestamp.as_deref(), now),
        processed_status,
        pod,
    }
}

fn process_service(service: Service, now: DateTime<Utc>) -> ServiceView {
    let endpoints = ServiceEndpoints {
        cluster_ip: service.spec.cluster_ip.clone(),
        service_type: service
            .spec
            .service_type
            .clone()
            .unwrap_or_else(|| "ClusterIP".to_string()),
        ports: service.spec.ports.clone(),
    };
    ServiceView {
        age: parse_age(service.metadata.creation_timestamp.as_deref(), now),
        endpoints,
        service,
    }
}

pub fn calculate_app_stats(pods: &[PodView], services: &[ServiceView]) -> AppStats {
    let mut pod_stats = PodStats::default();
    for pod in pods {
        pod_stats.total += 1;
        *pod_stats
            .by_status
            .entry(pod.processed_status.status.clone())
            .or_default() += 1;
        if pod.ready {
            pod_stats.ready += 1;
        }
        if pod.gpu > 0 {
            pod_stats.with_gpu += 1;
        }
    }

    let mut service_stats = ServiceStats::default();
    for service in services {
        service_stats.total += 1;
        *service_stats
            .by_type
            .entry(service.endpoints.service_type.clone())
            .or_default() += 1;
    }

    let health_score = if pod_stats.total > 0 {
        ((pod_stats.ready as f64 / pod_stats.total as f64) * 100.0).round() as u32
    } else {
        100
    };

    AppStats {
        pods: pod_stats,
        services: service_stats,
        health_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::single_flight::testing::FakeRunner;
    use futures_util::future::join_all;

    const PODS: &str = r#"{"items": [
        {"metadata": {"name": "web-1"},
         "spec": {"containers": [{"name": "c", "resources": {"requests": {"nvidia.com/gpu": "1"}}}]},
         "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}},
        {"metadata": {"name": "web-2"},
         "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "False"}]}}
    ]}"#;
    const SERVICES: &str = r#"{"items": [
        {"metadata": {"name": "api"}, "spec": {"type": "LoadBalancer", "ports": [{"port": 80, "targetPort": 8080}]}},
        {"metadata": {"name": "db"}, "spec": {"clusterIP": "10.0.0.5"}}
    ]}"#;

    fn service(runner: Arc<FakeRunner>) -> AppStatusService {
        let flights = Arc::new(SingleFlight::new(runner));
        AppStatusService::new(flights, &CacheConfig::default())
    }

    fn pod(json: &str) -> Pod {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn running_but_unready_is_not_ready() {
        let status = calculate_pod_status(&pod(
            r#"{"status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "False"}]}}"#,
        ));
        assert_eq!(status.status, "not-ready");
        assert!(!status.ready);
        assert_eq!(status.reason.as_deref(), Some("ContainerNotReady"));

        let status = calculate_pod_status(&pod(
            r#"{"status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}}"#,
        ));
        assert_eq!(status.status, "running");
        assert!(status.ready);
        assert_eq!(status.reason, None);
    }

    #[test]
    fn container_reason_wins() {
        let status = calculate_pod_status(&pod(
            r#"{"status": {
                "phase": "Pending",
                "containerStatuses": [{"state": {"waiting": {"reason": "ImagePullBackOff"}}}]
            }}"#,
        ));
        assert_eq!(status.status, "pending");
        assert_eq!(status.reason.as_deref(), Some("ImagePullBackOff"));
        assert_eq!(status.containers, 1);

        assert_eq!(calculate_pod_status(&Pod::default()).status, "unknown");
    }

    #[tokio::test(start_paused = true)]
    async fn second_read_within_ttl_is_cached() {
        let runner = FakeRunner::new(Duration::from_millis(50));
        runner.respond("get pods -o json", Ok(PODS.into()));
        let svc = service(runner.clone());

        let first = svc.get_pods(false).await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        let second = svc.get_pods(false).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(
            serde_json::to_value(&first.data).unwrap(),
            serde_json::to_value(&second.data).unwrap()
        );
        assert_eq!(runner.calls(), 1);

        tokio::time::advance(Duration::from_millis(15_000)).await;
        assert!(!svc.get_pods(false).await.unwrap().cached);
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_forced_reads_execute_once() {
        let runner = FakeRunner::new(Duration::from_millis(200));
        runner.respond("get pods -o json", Ok(PODS.into()));
        let svc = service(runner.clone());

        let results = join_all((0..5).map(|_| svc.get_pods(true))).await;
        assert_eq!(runner.calls(), 1);
        for r in results {
            let r = r.unwrap();
            assert!(!r.cached);
            assert_eq!(r.data.count, 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn combined_tolerates_a_failing_branch() {
        let runner = FakeRunner::new(Duration::from_millis(10));
        runner.respond("get pods -o json", Ok(PODS.into()));
        runner.respond(
            "get services -o json",
            Err(CoreError::ExternalExecution {
                command: "kubectl get services -o json".into(),
                stderr: "forbidden".into(),
            }),
        );
        let svc = service(runner.clone());

        let view = svc.get_app_status(true).await.unwrap();
        assert_eq!(view.data.pods.len(), 2);
        assert!(view.data.services.is_empty());
        assert!(view.data.errors.pods.is_none());
        assert!(view.data.errors.services.as_deref().unwrap().contains("forbidden"));
        assert_eq!(view.data.stats.pods.ready, 1);
        assert_eq!(view.data.stats.pods.with_gpu, 1);
        assert_eq!(view.data.stats.health_score, 50);

        let again = svc.get_app_status(false).await.unwrap();
        assert!(again.cached);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_finishing_after_clear_is_not_cached() {
        let runner = FakeRunner::new(Duration::from_millis(500));
        runner.respond("get pods -o json", Ok(PODS.into()));
        let svc = Arc::new(service(runner.clone()));

        let early = tokio::spawn({
            let svc = svc.clone();
            async move { svc.get_pods(false).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        svc.clear(None);

        let early = early.await.unwrap().unwrap();
        assert_eq!(early.data.count, 2);
        assert!(!early.cached);
        assert!(!svc.cache_status()[&ResourceKind::Pods].cached);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_read_after_clear_does_not_join_the_old_query() {
        let runner = FakeRunner::new(Duration::from_millis(500));
        runner.respond("get pods -o json", Ok(PODS.into()));
        let svc = Arc::new(service(runner.clone()));

        let early = tokio::spawn({
            let svc = svc.clone();
            async move { svc.get_pods(false).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        svc.clear(None);

        svc.get_pods(true).await.unwrap();
        assert_eq!(runner.calls_for("get pods -o json"), 2);
        early.await.unwrap().unwrap();

        let status = svc.cache_status();
        assert!(status[&ResourceKind::Pods].cached);
        assert!(svc.get_pods(false).await.unwrap().cached);
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn combined_read_is_bounded_by_the_join_timeout() {
        let runner = FakeRunner::new(Duration::from_secs(25));
        runner.respond("get pods -o json", Ok(PODS.into()));
        runner.respond("get services -o json", Ok(SERVICES.into()));
        let svc = service(runner.clone());

        let started = tokio::time::Instant::now();
        let err = svc.get_app_status(true).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout { timeout_ms: 20_000, .. }));
        assert!(started.elapsed() < Duration::from_secs(25));
        assert!(!svc.cache_status()[&ResourceKind::Combined].cached);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_forces_reexecution() {
        let runner = FakeRunner::new(Duration::from_millis(10));
        runner.respond("get services -o json", Ok(SERVICES.into()));
        let svc = service(runner.clone());

        let first = svc.get_services(false).await.unwrap();
        assert_eq!(first.data.services[0].endpoints.service_type, "LoadBalancer");
        assert_eq!(first.data.services[1].endpoints.service_type, "ClusterIP");

        svc.clear(Some(ResourceKind::Services));
        assert!(!svc.cache_status()[&ResourceKind::Services].cached);
        assert!(!svc.get_services(false).await.unwrap().cached);
        assert_eq!(runner.calls(), 2);

        svc.clear(None);
        assert!(svc.cache_status().values().all(|s| !s.cached));
    }

    #[test]
    fn stats_without_pods_are_healthy() {
        let stats = calculate_app_stats(&[], &[]);
        assert_eq!(stats.health_score, 100);
        assert_eq!(stats.pods.total, 0);
    }
}
