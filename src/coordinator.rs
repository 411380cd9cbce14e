use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::config::Config;
use crate::error::CoreResult;
use crate::helpers::lock;
use crate::logs::{KubectlLogTailer, LogMultiplexer, LogTailer};
use crate::registry::ClusterRegistry;
use crate::status::{
    AppStatusService, CacheStatus, ClusterStatusService, CommandRunner, KubectlRunner,
    ResourceKind, SingleFlight,
};

/// Owns the registry, the status caches and the log multiplexer for the
/// lifetime of the process.
pub struct Coordinator {
    pub registry: Arc<ClusterRegistry>,
    pub app: AppStatusService,
    pub cluster: ClusterStatusService,
    pub logs: LogMultiplexer,
    config: Config,
    /// `(cluster, phase)` pairs with a provisioning script still running.
    pub(crate) running: Mutex<HashSet<(String, String)>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Switched {
    pub active_cluster: String,
    pub restored_files: usize,
}

impl Coordinator {
    pub async fn new(config: Config) -> CoreResult<Self> {
        let registry =
            ClusterRegistry::open(config.data_dir.clone(), config.working_dir.clone()).await?;
        let runner = Arc::new(KubectlRunner::new(config.kubectl.clone()));
        let tailer = Arc::new(KubectlLogTailer::new(config.kubectl.clone()));
        Ok(Self::with_parts(Arc::new(registry), runner, tailer, config))
    }

    pub fn with_parts(
        registry: Arc<ClusterRegistry>,
        runner: Arc<dyn CommandRunner>,
        tailer: Arc<dyn LogTailer>,
        config: Config,
    ) -> Self {
        let flights = Arc::new(SingleFlight::new(runner));
        Self {
            app: AppStatusService::new(Arc::clone(&flights), &config.cache),
            cluster: ClusterStatusService::new(flights, &config.cache),
            logs: LogMultiplexer::new(Arc::clone(&registry), tailer),
            registry,
            config,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Activates `tag`, restores its working configuration, then drops every
    /// cached status view. Nothing changes if the pointer cannot be moved.
    pub async fn switch_cluster(&self, tag: &str) -> CoreResult<Switched> {
        self.registry.set_active(tag).await?;
        let restored_files = self.registry.restore_working_config(tag).await?;
        self.clear_cache(None);

        info!(
            "switched to cluster {} ({} config files restored)",
            tag, restored_files
        );
        Ok(Switched {
            active_cluster: tag.to_string(),
            restored_files,
        })
    }

    pub fn clear_cache(&self, kind: Option<ResourceKind>) {
        match kind {
            Some(ResourceKind::Cluster) => self.cluster.clear(),
            Some(k) => self.app.clear(Some(k)),
            None => {
                self.app.clear(None);
                self.cluster.clear();
            }
        }
    }

    pub fn cache_status(&self) -> HashMap<ResourceKind, CacheStatus> {
        let mut status = self.app.cache_status();
        status.insert(ResourceKind::Cluster, self.cluster.cache_status());
        status
    }

    pub fn running_phases(&self) -> Vec<(String, String)> {
        let mut phases: Vec<_> = lock(&self.running).iter().cloned().collect();
        phases.sort();
        phases
    }
}
