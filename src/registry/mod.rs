pub mod phase_logs;
pub mod record;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use record::{
    AccessEntry, ActivePointer, ClusterRecord, ClusterStatus, EnvMap, ImportMetadata, PhaseStatus,
};

const ACTIVE_POINTER_FILE: &str = "active_cluster.json";
const RECORD_FILE: &str = "cluster_info.json";
const IMPORT_METADATA_FILE: &str = "import_metadata.json";
const STATUS_CACHE_SUFFIX: &str = "_status_cache.json";
/// Log sinks for job output when no cluster is active.
const UNSCOPED_JOB_LOGS: &str = "_unscoped";

/// Makes every atomic write use its own temp file.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

const SUB_NAMESPACES: [&str; 4] = ["config", "logs", "current", "metadata"];

/// Files copied from a cluster's `config/` into the working area on activation.
const WORKING_FILES: [&str; 3] = ["init_envs", "stack_envs", "mlflow-server-info.json"];

/// Files a provisioning phase leaves in the working area.
fn generated_files(phase: &str) -> &'static [&'static str] {
    match phase {
        "step1" => &["stack_envs"],
        "step2" => &["mlflow-server-info.json"],
        _ => &[],
    }
}

/// Directory-backed registry of managed clusters.
///
/// Layout under `root`:
/// ```text
/// active_cluster.json
/// <tag>/config/      persisted working configuration
/// <tag>/logs/        provisioning and job logs
/// <tag>/current/     newest-log pointer records
/// <tag>/metadata/    cluster_info.json and status caches
/// ```
pub struct ClusterRegistry {
    root: PathBuf,
    working_dir: PathBuf,
    /// Serializes check-then-write of the active pointer.
    pointer_lock: Mutex<()>,
}

impl ClusterRegistry {
    pub async fn open(root: PathBuf, working_dir: PathBuf) -> CoreResult<Self> {
        fs::create_dir_all(&root).await?;
        fs::create_dir_all(&working_dir).await?;
        Ok(Self {
            root,
            working_dir,
            pointer_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn cluster_dir(&self, tag: &str) -> PathBuf {
        self.root.join(tag)
    }

    pub fn config_dir(&self, tag: &str) -> PathBuf {
        self.cluster_dir(tag).join("config")
    }

    pub fn logs_dir(&self, tag: &str) -> PathBuf {
        self.cluster_dir(tag).join("logs")
    }

    pub fn current_dir(&self, tag: &str) -> PathBuf {
        self.cluster_dir(tag).join("current")
    }

    pub fn metadata_dir(&self, tag: &str) -> PathBuf {
        self.cluster_dir(tag).join("metadata")
    }

    fn record_path(&self, tag: &str) -> PathBuf {
        self.metadata_dir(tag).join(RECORD_FILE)
    }

    fn status_cache_path(&self, tag: &str, phase: &str) -> PathBuf {
        self.metadata_dir(tag)
            .join(format!("{}{}", phase, STATUS_CACHE_SUFFIX))
    }

    pub async fn exists(&self, tag: &str) -> bool {
        validate_tag(tag).is_ok() && is_dir(&self.cluster_dir(tag)).await
    }

    pub async fn create_cluster_namespace(&self, tag: &str) -> CoreResult<()> {
        validate_tag(tag)?;
        for sub in SUB_NAMESPACES {
            fs::create_dir_all(self.cluster_dir(tag).join(sub)).await?;
        }
        debug!("namespace ready for cluster {}", tag);
        Ok(())
    }

    pub async fn list_clusters(&self) -> Vec<ClusterRecord> {
        let mut clusters = Vec::new();

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) => {
                warn!("cannot read registry root {}: {}", self.root.display(), e);
                return clusters;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("error scanning registry root: {}", e);
                    break;
                }
            };
            let Some(tag) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_dir(&entry.path()).await {
                continue;
            }
            match read_json::<ClusterRecord>(&self.record_path(&tag)).await {
                Ok(Some(record)) => clusters.push(record),
                Ok(None) => debug!("skipping cluster {} without a record", tag),
                Err(e) => warn!("skipping cluster {}: {}", tag, e),
            }
        }

        clusters.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        clusters
    }

    pub async fn get_record(&self, tag: &str) -> CoreResult<ClusterRecord> {
        validate_tag(tag)?;
        read_json(&self.record_path(tag))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("cluster {}", tag)))
    }

    pub async fn save_record(
        &self,
        tag: &str,
        config: serde_json::Value,
        status: ClusterStatus,
    ) -> CoreResult<ClusterRecord> {
        self.create_cluster_namespace(tag).await?;

        let now = Utc::now();
        let created_at = match read_json::<ClusterRecord>(&self.record_path(tag)).await {
            Ok(Some(existing)) => existing.created_at,
            _ => now,
        };

        let record = ClusterRecord {
            cluster_tag: tag.to_string(),
            created_at,
            last_modified: now,
            status,
            config,
        };
        write_json_atomic(&self.record_path(tag), &record).await?;
        info!("saved record for cluster {} ({:?})", tag, status);
        Ok(record)
    }

    /// Reads the active pointer. A missing or unreadable pointer means "none".
    pub async fn get_active(&self) -> Option<String> {
        match read_json::<ActivePointer>(&self.root.join(ACTIVE_POINTER_FILE)).await {
            Ok(Some(p)) => p.active_cluster,
            Ok(None) => None,
            Err(e) => {
                warn!("failed to read active cluster: {}", e);
                None
            }
        }
    }

    /// Points the registry at `tag`. The target is checked before the write,
    /// and the write is a rename, so a failure leaves the old pointer intact.
    pub async fn set_active(&self, tag: &str) -> CoreResult<()> {
        let _guard = self.pointer_lock.lock().await;
        if !self.exists(tag).await {
            return Err(CoreError::NotFound(format!("cluster {}", tag)));
        }
        for sub in SUB_NAMESPACES {
            if !is_dir(&self.cluster_dir(tag).join(sub)).await {
                return Err(CoreError::Conflict(tag.to_string()));
            }
        }

        let pointer = ActivePointer {
            active_cluster: Some(tag.to_string()),
            last_updated: Utc::now(),
        };
        write_json_atomic(&self.root.join(ACTIVE_POINTER_FILE), &pointer).await?;
        info!("active cluster set to {}", tag);
        Ok(())
    }

    /// Copies the cluster's persisted configuration into the shared working
    /// area. Must finish before anything provisions against `tag`.
    pub async fn restore_working_config(&self, tag: &str) -> CoreResult<usize> {
        validate_tag(tag)?;
        let config_dir = self.config_dir(tag);
        let mut restored = 0;

        for file in WORKING_FILES {
            let source = config_dir.join(file);
            let target = self.working_dir.join(file);
            match fs::copy(&source, &target).await {
                Ok(_) => {
                    restored += 1;
                    info!("restored {} for cluster {}", file, tag);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    // Stale copies from the previous cluster must not survive.
                    if let Err(e) = fs::remove_file(&target).await {
                        if e.kind() != ErrorKind::NotFound {
                            warn!("failed to remove stale {}: {}", file, e);
                        }
                    }
                }
                Err(e) => {
                    warn!("failed to restore {} for cluster {}: {}", file, tag, e);
                    return Err(e.into());
                }
            }
        }

        Ok(restored)
    }

    /// Copies the files produced by `phase` back into the cluster's `config/`.
    pub async fn backup_working_config(&self, tag: &str, phase: &str) -> usize {
        let config_dir = self.config_dir(tag);
        let mut saved = 0;

        for file in generated_files(phase) {
            let source = self.working_dir.join(file);
            if !fs::try_exists(&source).await.unwrap_or(false) {
                continue;
            }
            match fs::copy(&source, config_dir.join(file)).await {
                Ok(_) => {
                    saved += 1;
                    info!("backed up {} for cluster {}", file, tag);
                }
                Err(e) => warn!("failed to back up {} for cluster {}: {}", file, tag, e),
            }
        }

        saved
    }

    /// Deletes the on-disk status caches of `tag`.
    pub async fn clear_derived_cache(&self, tag: &str) -> usize {
        let mut cleared = 0;

        let Ok(mut entries) = fs::read_dir(self.metadata_dir(tag)).await else {
            return cleared;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(STATUS_CACHE_SUFFIX) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    cleared += 1;
                    info!("cleared cache file {} for cluster {}", name, tag);
                }
                Err(e) => warn!("failed to clear cache {}: {}", name, e),
            }
        }

        cleared
    }

    pub async fn read_phase_status(&self, tag: &str, phase: &str) -> Option<PhaseStatus> {
        if validate_tag(tag).is_err() || validate_tag(phase).is_err() {
            return None;
        }
        match read_json(&self.status_cache_path(tag, phase)).await {
            Ok(status) => status,
            Err(e) => {
                warn!("failed to read {} status cache for {}: {}", phase, tag, e);
                None
            }
        }
    }

    pub async fn write_phase_status(
        &self,
        tag: &str,
        phase: &str,
        status: &PhaseStatus,
    ) -> CoreResult<()> {
        validate_tag(tag)?;
        validate_tag(phase)?;
        write_json_atomic(&self.status_cache_path(tag, phase), status).await
    }

    /// Registers an existing cluster: writes `config/init_envs`, the import
    /// metadata and an `imported` record, in that order.
    pub async fn import_cluster(
        &self,
        tag: &str,
        env: &EnvMap,
        access: Option<AccessEntry>,
    ) -> CoreResult<ClusterRecord> {
        if let Some(key) = env.keys().find(|k| !is_env_name(k)) {
            return Err(CoreError::InvalidInput(format!(
                "invalid variable name {:?}",
                key
            )));
        }
        self.create_cluster_namespace(tag).await?;

        let mut content = String::from("#!/bin/bash\n\n# Imported cluster configuration\n");
        for (key, value) in env {
            content.push_str(&format!("export {}={}\n", key, shell_quote(value)));
        }
        fs::write(self.config_dir(tag).join("init_envs"), content).await?;

        let metadata = ImportMetadata {
            kind: "imported".to_string(),
            imported_at: Utc::now(),
            eks_cluster_name: env.get("EKS_CLUSTER_NAME").cloned(),
            aws_region: env.get("AWS_REGION").cloned(),
            access_entry: access,
        };
        write_json_atomic(&self.metadata_dir(tag).join(IMPORT_METADATA_FILE), &metadata).await?;

        let config = serde_json::json!({
            "clusterTag": tag,
            "awsRegion": metadata.aws_region,
            "eksClusterName": metadata.eks_cluster_name,
            "clusterType": "imported",
        });
        self.save_record(tag, config, ClusterStatus::Imported).await
    }

    /// Where the output of one job unit is persisted: under the active
    /// cluster's `logs/` if there is one.
    pub async fn job_log_path(&self, job: &str, unit: &str) -> CoreResult<PathBuf> {
        validate_tag(job)?;
        validate_tag(unit)?;
        let base = match self.get_active().await {
            Some(tag) => self.logs_dir(&tag),
            None => self.root.join(UNSCOPED_JOB_LOGS),
        };
        Ok(base.join("jobs").join(job).join(format!("{}.log", unit)))
    }
}

/// Pulls `CLUSTER_TAG` out of an `init_envs` document.
pub fn extract_cluster_tag(init_envs: &str) -> CoreResult<String> {
    init_envs
        .lines()
        .filter_map(|l| l.trim().strip_prefix("export CLUSTER_TAG="))
        .map(|v| v.replace(['"', '\''], "").trim().to_string())
        .find(|v| !v.is_empty())
        .ok_or_else(|| CoreError::InvalidInput("CLUSTER_TAG not found in configuration".into()))
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Single-quotes `value` for a POSIX shell; nothing inside is expanded.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Tags and job/unit names become path components.
pub fn validate_tag(tag: &str) -> CoreResult<()> {
    let ok = !tag.is_empty()
        && tag != "."
        && tag != ".."
        && !tag.starts_with('_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(format!("invalid name {:?}", tag)))
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

/// `Ok(None)` when the file does not exist.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> CoreResult<Option<T>> {
    let data = match fs::read(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| CoreError::parse(path.display().to_string(), e))
}

pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| CoreError::parse(path.display().to_string(), e))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), seq));
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
