use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Root of the per-cluster namespaces and the active pointer file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Shared working area read by the provisioning scripts.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    #[serde(default = "default_status_push_secs")]
    pub status_push_secs: u64,
    #[serde(default = "default_log_retention")]
    pub log_retention: usize,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Provisioning phase name -> script, relative to `working_dir`.
    #[serde(default)]
    pub phases: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_pods_ttl_ms")]
    pub pods_ttl_ms: u64,
    #[serde(default = "default_services_ttl_ms")]
    pub services_ttl_ms: u64,
    #[serde(default = "default_pods_ttl_ms")]
    pub combined_ttl_ms: u64,
    #[serde(default = "default_cluster_ttl_ms")]
    pub cluster_ttl_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_node_query_timeout_ms")]
    pub node_query_timeout_ms: u64,
    /// Upper bound on a composite fetch that joins several queries.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pods_ttl_ms: default_pods_ttl_ms(),
            services_ttl_ms: default_services_ttl_ms(),
            combined_ttl_ms: default_pods_ttl_ms(),
            cluster_ttl_ms: default_cluster_ttl_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            node_query_timeout_ms: default_node_query_timeout_ms(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl CacheConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn node_query_timeout(&self) -> Duration {
        Duration::from_millis(self.node_query_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

fn default_listen_port() -> u16 {
    3001
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cluster-console/managed_clusters_info")
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("/var/lib/cluster-console/cli")
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_status_push_secs() -> u64 {
    60
}

fn default_log_retention() -> usize {
    10
}

fn default_pods_ttl_ms() -> u64 {
    15_000
}

fn default_services_ttl_ms() -> u64 {
    30_000
}

fn default_cluster_ttl_ms() -> u64 {
    30_000
}

fn default_query_timeout_ms() -> u64 {
    15_000
}

fn default_node_query_timeout_ms() -> u64 {
    10_000
}

fn default_join_timeout_ms() -> u64 {
    20_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            data_dir: default_data_dir(),
            working_dir: default_working_dir(),
            kubectl: default_kubectl(),
            status_push_secs: default_status_push_secs(),
            log_retention: default_log_retention(),
            cache: CacheConfig::default(),
            phases: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            tracing::warn!("config {} not found, using defaults", path.display());
            return Ok(Config::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| format!("reading config {}: {}", path.display(), e))?;
        let cfg: Config =
            serde_yaml::from_str(&data).map_err(|e| format!("parsing config: {}", e))?;

        if cfg.data_dir == cfg.working_dir {
            return Err("data_dir and working_dir must be different directories".into());
        }
        if cfg.cache.query_timeout_ms == 0
            || cfg.cache.node_query_timeout_ms == 0
            || cfg.cache.join_timeout_ms == 0
        {
            return Err("cache query timeouts must be non-zero".into());
        }

        Ok(cfg)
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }

    pub fn phase_script(&self, phase: &str) -> Option<&str> {
        self.phases.get(phase).map(String::as_str)
    }
}
