use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Configured,
    Imported,
    Created,
    Migrated,
}

/// Persisted as `metadata/cluster_info.json`. Its presence is the marker that
/// makes a cluster visible in listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    pub cluster_tag: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub status: ClusterStatus,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePointer {
    pub active_cluster: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Completion cache for one provisioning phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseStatus {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl PhaseStatus {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

/// Access entry configured on an imported cluster, if any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessEntry {
    pub action: String,
    pub role_arn: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMetadata {
    #[serde(rename = "type")]
    pub kind: String,
    pub imported_at: DateTime<Utc>,
    pub eks_cluster_name: Option<String>,
    pub aws_region: Option<String>,
    pub access_entry: Option<AccessEntry>,
}

/// Indirection record for "the newest log of a phase", stored in `current/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseLogPointer {
    pub phase: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFileInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Result of an incremental read: `offset` is where the next read starts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogChunk {
    pub content: String,
    pub offset: u64,
    pub exists: bool,
}

/// Ordered `KEY=value` pairs written to an imported cluster's `init_envs`.
pub type EnvMap = BTreeMap<String, String>;
