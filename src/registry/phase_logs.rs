use chrono::{DateTime, Utc};
use std::io::{ErrorKind, SeekFrom};
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{info, warn};

use super::record::{LogChunk, LogFileInfo, PhaseLogPointer};
use super::{ClusterRegistry, read_json, validate_tag, write_json_atomic};
use crate::error::CoreResult;

impl ClusterRegistry {
    /// Creates an empty, timestamped log file for `phase` and repoints
    /// `current/<phase>.json` at it.
    pub async fn create_phase_log(&self, tag: &str, phase: &str) -> CoreResult<PhaseLogPointer> {
        validate_tag(tag)?;
        validate_tag(phase)?;
        self.create_cluster_namespace(tag).await?;

        let now = Utc::now();
        let name = format!("{}_{}.log", now.format("%Y-%m-%dT%H-%M-%S-%3f"), phase);
        let path = self.logs_dir(tag).join(name);
        fs::write(&path, b"").await?;

        let pointer = PhaseLogPointer {
            phase: phase.to_string(),
            path,
            created_at: now,
        };
        write_json_atomic(&self.phase_pointer_path(tag, phase), &pointer).await?;
        info!(
            "created {} log for cluster {}: {}",
            phase,
            tag,
            pointer.path.display()
        );
        Ok(pointer)
    }

    pub async fn current_phase_log(&self, tag: &str, phase: &str) -> Option<PhaseLogPointer> {
        if validate_tag(tag).is_err() || validate_tag(phase).is_err() {
            return None;
        }
        match read_json(&self.phase_pointer_path(tag, phase)).await {
            Ok(p) => p,
            Err(e) => {
                warn!("bad log pointer for {}/{}: {}", tag, phase, e);
                None
            }
        }
    }

    /// Reads the newest `phase` log from `offset` to its current end.
    pub async fn read_phase_log(&self, tag: &str, phase: &str, offset: u64) -> LogChunk {
        match self.current_phase_log(tag, phase).await {
            Some(pointer) => read_from_offset(&pointer.path, offset).await,
            None => LogChunk::default(),
        }
    }

    /// Phase log files of `tag`, newest first.
    pub async fn phase_log_history(&self, tag: &str) -> Vec<LogFileInfo> {
        let mut files = Vec::new();
        if validate_tag(tag).is_err() {
            return files;
        }

        let Ok(mut entries) = fs::read_dir(self.logs_dir(tag)).await else {
            return files;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if !name.ends_with(".log") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            files.push(LogFileInfo {
                name,
                path,
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        // File names start with a sortable timestamp.
        files.sort_by(|a, b| b.name.cmp(&a.name));
        files
    }

    /// Keeps the `keep` newest phase logs and deletes the rest.
    pub async fn cleanup_phase_logs(&self, tag: &str, keep: usize) -> usize {
        let mut deleted = 0;
        for file in self.phase_log_history(tag).await.into_iter().skip(keep) {
            match fs::remove_file(&file.path).await {
                Ok(()) => {
                    deleted += 1;
                    info!("deleted old log file {}", file.name);
                }
                Err(e) => warn!("failed to delete log file {}: {}", file.name, e),
            }
        }
        deleted
    }

    fn phase_pointer_path(&self, tag: &str, phase: &str) -> std::path::PathBuf {
        self.current_dir(tag).join(format!("{}.json", phase))
    }
}

/// Reads `path` from `offset` to EOF. Never fails: an absent file reports
/// `exists = false`, an offset past EOF returns no content.
pub async fn read_from_offset(path: &Path, offset: u64) -> LogChunk {
    let mut file = match fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                warn!("error opening log {}: {}", path.display(), e);
            }
            return LogChunk::default();
        }
    };

    let size = match file.metadata().await {
        Ok(m) => m.len(),
        Err(e) => {
            warn!("error reading log {}: {}", path.display(), e);
            return LogChunk::default();
        }
    };
    if offset >= size {
        return LogChunk {
            content: String::new(),
            offset: size,
            exists: true,
        };
    }

    let mut buf = Vec::with_capacity((size - offset) as usize);
    let read = async {
        file.seek(SeekFrom::Start(offset)).await?;
        (&mut file).take(size - offset).read_to_end(&mut buf).await
    };
    if let Err(e) = read.await {
        warn!("error reading log {}: {}", path.display(), e);
        return LogChunk::default();
    }

    LogChunk {
        content: String::from_utf8_lossy(&buf).into_owned(),
        offset: offset + buf.len() as u64,
        exists: true,
    }
}
