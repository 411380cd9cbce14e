use axum::body::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::ServerEvent;
use super::tailer::LogTailer;
use crate::error::{CoreError, CoreResult};
use crate::helpers::lock;
use crate::registry::phase_logs::read_from_offset;
use crate::registry::record::{LogChunk, LogFileInfo};
use crate::registry::{ClusterRegistry, validate_tag};

pub type ConnectionId = u64;
pub type EventSender = mpsc::Sender<ServerEvent>;

/// Events buffered per connection. A subscriber whose queue is full is
/// dropped from the stream rather than buffered without limit.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// One logical stream: a job and one of its workload units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub job: String,
    pub unit: String,
}

impl StreamKey {
    pub fn new(job: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            unit: unit.into(),
        }
    }

    fn validate(&self) -> CoreResult<()> {
        validate_tag(&self.job)?;
        validate_tag(&self.unit)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job, self.unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamMode {
    /// Kept alive with zero subscribers so the output is always captured.
    AutoCollected,
    /// Lives only while someone is watching.
    OnDemand,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub job_name: String,
    pub pod_name: String,
    pub mode: StreamMode,
    pub subscribers: usize,
    pub started_at: DateTime<Utc>,
    pub path: Option<PathBuf>,
}

struct LogStream {
    /// Distinguishes this stream from a later one under the same key.
    id: u64,
    mode: StreamMode,
    subscribers: HashMap<ConnectionId, EventSender>,
    cancel: CancellationToken,
    path: Option<PathBuf>,
    started_at: DateTime<Utc>,
}

type StreamTable = Arc<Mutex<HashMap<StreamKey, LogStream>>>;

/// Fans one tailing subprocess per key out to any number of subscribers and
/// appends everything it prints to the key's log file.
///
/// All table mutations happen under one lock with no await in between, so a
/// key never has two subprocesses.
pub struct LogMultiplexer {
    registry: Arc<ClusterRegistry>,
    tailer: Arc<dyn LogTailer>,
    streams: StreamTable,
    next_id: AtomicU64,
}

impl LogMultiplexer {
    pub fn new(registry: Arc<ClusterRegistry>, tailer: Arc<dyn LogTailer>) -> Self {
        Self {
            registry,
            tailer,
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attaches `conn` to the stream for `key`, starting it if absent.
    /// Returns whether a new subprocess was started.
    pub fn subscribe(
        &self,
        conn: ConnectionId,
        sender: EventSender,
        key: StreamKey,
    ) -> CoreResult<bool> {
        key.validate()?;
        let mut streams = lock(&self.streams);

        let started = !streams.contains_key(&key);
        if started {
            let stream = self.start(&key, StreamMode::OnDemand);
            streams.insert(key.clone(), stream);
        }
        if let Some(stream) = streams.get_mut(&key) {
            stream.subscribers.insert(conn, sender.clone());
            // Sent under the lock so it precedes any data from the pump.
            let _ = sender.try_send(ServerEvent::LogStreamStarted {
                job_name: key.job.clone(),
                pod_name: key.unit.clone(),
                mode: stream.mode,
            });
            debug!(
                "connection {} subscribed to {} ({} subscribers)",
                conn,
                key,
                stream.subscribers.len()
            );
        }
        Ok(started)
    }

    /// Detaches `conn` from `key`. An on-demand stream left without
    /// subscribers is torn down.
    pub fn unsubscribe(&self, conn: ConnectionId, key: &StreamKey) -> bool {
        let mut streams = lock(&self.streams);
        let Some(stream) = streams.get_mut(key) else {
            return false;
        };
        let Some(sender) = stream.subscribers.remove(&conn) else {
            return false;
        };
        let _ = sender.try_send(ServerEvent::LogStreamStopped {
            job_name: key.job.clone(),
            pod_name: key.unit.clone(),
        });

        if stream.mode == StreamMode::OnDemand && stream.subscribers.is_empty() {
            teardown(&mut streams, key);
        }
        true
    }

    /// Detaches `conn` from every stream. Returns how many it was attached to.
    pub fn unsubscribe_all(&self, conn: ConnectionId) -> usize {
        let keys: Vec<StreamKey> = lock(&self.streams)
            .iter()
            .filter(|(_, s)| s.subscribers.contains_key(&conn))
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter().filter(|k| self.unsubscribe(conn, k)).count()
    }

    pub fn disconnect(&self, conn: ConnectionId) -> usize {
        let n = self.unsubscribe_all(conn);
        if n > 0 {
            info!("connection {} closed, left {} log streams", conn, n);
        }
        n
    }

    /// Ensures a stream for `key` runs regardless of subscribers, upgrading an
    /// existing on-demand stream. Returns whether a new subprocess was started.
    pub fn start_auto_collection(&self, key: StreamKey) -> CoreResult<bool> {
        key.validate()?;
        let mut streams = lock(&self.streams);

        if let Some(stream) = streams.get_mut(&key) {
            if stream.mode != StreamMode::AutoCollected {
                stream.mode = StreamMode::AutoCollected;
                info!("log stream {} upgraded to auto-collected", key);
            }
            return Ok(false);
        }

        info!("auto-collecting logs for {}", key);
        let stream = self.start(&key, StreamMode::AutoCollected);
        streams.insert(key, stream);
        Ok(true)
    }

    /// Drops the auto-collected guarantee; the stream then behaves as
    /// on-demand and stops at once if nobody is watching.
    pub fn stop_auto_collection(&self, key: &StreamKey) -> bool {
        let mut streams = lock(&self.streams);
        let Some(stream) = streams.get_mut(key) else {
            return false;
        };
        if stream.mode != StreamMode::AutoCollected {
            return false;
        }

        stream.mode = StreamMode::OnDemand;
        if stream.subscribers.is_empty() {
            teardown(&mut streams, key);
        }
        true
    }

    pub fn active_streams(&self) -> Vec<StreamInfo> {
        let mut infos: Vec<StreamInfo> = lock(&self.streams)
            .iter()
            .map(|(key, s)| StreamInfo {
                job_name: key.job.clone(),
                pod_name: key.unit.clone(),
                mode: s.mode,
                subscribers: s.subscribers.len(),
                started_at: s.started_at,
                path: s.path.clone(),
            })
            .collect();
        infos.sort_by(|a, b| (&a.job_name, &a.pod_name).cmp(&(&b.job_name, &b.pod_name)));
        infos
    }

    pub fn stream_mode(&self, key: &StreamKey) -> Option<StreamMode> {
        lock(&self.streams).get(key).map(|s| s.mode)
    }

    pub fn subscriber_count(&self, key: &StreamKey) -> usize {
        lock(&self.streams)
            .get(key)
            .map_or(0, |s| s.subscribers.len())
    }

    /// Stops every stream. Used on process shutdown.
    pub fn shutdown(&self) {
        let mut streams = lock(&self.streams);
        for (key, stream) in streams.drain() {
            debug!("stopping log stream {}", key);
            stream.cancel.cancel();
        }
    }

    /// File backing `key`: the live stream's sink if there is one, otherwise
    /// where a stream would write now.
    pub async fn log_path(&self, key: &StreamKey) -> CoreResult<PathBuf> {
        key.validate()?;
        let live = lock(&self.streams).get(key).and_then(|s| s.path.clone());
        match live {
            Some(path) => Ok(path),
            None => self.registry.job_log_path(&key.job, &key.unit).await,
        }
    }

    pub async fn read_log(&self, key: &StreamKey) -> CoreResult<LogChunk> {
        self.tail_log(key, 0).await
    }

    pub async fn tail_log(&self, key: &StreamKey, offset: u64) -> CoreResult<LogChunk> {
        let path = self.log_path(key).await?;
        Ok(read_from_offset(&path, offset).await)
    }

    pub async fn log_info(&self, key: &StreamKey) -> CoreResult<Option<LogFileInfo>> {
        let path = self.log_path(key).await?;
        let meta = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(LogFileInfo {
            name: format!("{}.log", key.unit),
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            path,
        }))
    }

    /// Builds the table entry and spawns its pump. Called with the table
    /// locked; the pump cannot observe the table until the caller inserts it.
    fn start(&self, key: &StreamKey, mode: StreamMode) -> LogStream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let pump = Pump {
            key: key.clone(),
            id,
            registry: Arc::clone(&self.registry),
            tailer: Arc::clone(&self.tailer),
            streams: Arc::clone(&self.streams),
            cancel: cancel.clone(),
        };
        tokio::spawn(pump.run());

        LogStream {
            id,
            mode,
            subscribers: HashMap::new(),
            cancel,
            path: None,
            started_at: Utc::now(),
        }
    }
}

fn teardown(streams: &mut HashMap<StreamKey, LogStream>, key: &StreamKey) {
    if let Some(stream) = streams.remove(key) {
        stream.cancel.cancel();
        info!("stopped log stream {}", key);
    }
}

enum Chunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

enum End {
    Exited,
    Cancelled,
    Failed(String),
}

/// Drives one subprocess: copies its output to the sink and subscribers until
/// it exits, fails, or is cancelled.
struct Pump {
    key: StreamKey,
    id: u64,
    registry: Arc<ClusterRegistry>,
    tailer: Arc<dyn LogTailer>,
    streams: StreamTable,
    cancel: CancellationToken,
}

impl Pump {
    async fn run(self) {
        match self.open().await {
            Ok((sink, child)) => self.pump(sink, child).await,
            Err(e) => {
                warn!("failed to start log stream {}: {}", self.key, e);
                self.finish(|job_name, pod_name| ServerEvent::LogStreamError {
                    job_name,
                    pod_name,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn open(&self) -> CoreResult<(File, Child)> {
        let path = self
            .registry
            .job_log_path(&self.key.job, &self.key.unit)
            .await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let sink = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        if let Some(stream) = lock(&self.streams)
            .get_mut(&self.key)
            .filter(|s| s.id == self.id)
        {
            stream.path = Some(path.clone());
        }

        let child = self
            .tailer
            .spawn(&self.key.unit)
            .map_err(|e| CoreError::ExternalExecution {
                command: format!("logs -f {}", self.key.unit),
                stderr: e.to_string(),
            })?;
        info!("log stream {} writing to {}", self.key, path.display());
        Ok((sink, child))
    }

    async fn pump(&self, mut sink: File, mut child: Child) {
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            self.finish(|job_name, pod_name| ServerEvent::LogStreamError {
                job_name,
                pod_name,
                error: "tailer output is not captured".to_string(),
            });
            return;
        };

        let chunks = ReaderStream::new(stdout)
            .map(|r| r.map(Chunk::Stdout))
            .merge(ReaderStream::new(stderr).map(|r| r.map(Chunk::Stderr)));
        tokio::pin!(chunks);

        let end = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break End::Cancelled,
                next = chunks.next() => match next {
                    Some(Ok(chunk)) => self.deliver(&mut sink, chunk).await,
                    Some(Err(e)) => break End::Failed(e.to_string()),
                    None => break End::Exited,
                },
            }
        };

        if let Err(e) = sink.flush().await {
            warn!("error flushing log for {}: {}", self.key, e);
        }

        match end {
            End::Cancelled => {
                let _ = child.kill().await;
                debug!("log stream {} cancelled", self.key);
            }
            End::Exited => {
                let code = match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!("error reaping tailer for {}: {}", self.key, e);
                        None
                    }
                };
                info!("log stream {} closed with code {:?}", self.key, code);
                self.finish(|job_name, pod_name| ServerEvent::LogStreamClosed {
                    job_name,
                    pod_name,
                    code,
                });
            }
            End::Failed(error) => {
                let _ = child.kill().await;
                warn!("log stream {} failed: {}", self.key, error);
                self.finish(|job_name, pod_name| ServerEvent::LogStreamError {
                    job_name,
                    pod_name,
                    error,
                });
            }
        }
    }

    async fn deliver(&self, sink: &mut File, chunk: Chunk) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let job_name = self.key.job.clone();
        let pod_name = self.key.unit.clone();

        let (line, event) = match chunk {
            Chunk::Stdout(bytes) => {
                let data = String::from_utf8_lossy(&bytes).into_owned();
                let line = format!("[{}] {}", timestamp, data);
                let event = ServerEvent::LogData {
                    job_name,
                    pod_name,
                    data,
                    timestamp,
                };
                (line, event)
            }
            Chunk::Stderr(bytes) => {
                let error = String::from_utf8_lossy(&bytes).into_owned();
                let line = format!("[{}] ERROR: {}", timestamp, error);
                let event = ServerEvent::LogError {
                    job_name,
                    pod_name,
                    error,
                    timestamp,
                };
                (line, event)
            }
        };

        let written = async {
            sink.write_all(line.as_bytes()).await?;
            sink.flush().await
        };
        if let Err(e) = written.await {
            warn!("error writing log for {}: {}", self.key, e);
        }

        let mut lagging = Vec::new();
        for (conn, sender) in self.subscribers() {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("connection {} is not keeping up with {}, dropping it", conn, self.key);
                    lagging.push(conn);
                }
                Err(TrySendError::Closed(_)) => lagging.push(conn),
            }
        }
        if !lagging.is_empty() {
            self.drop_subscribers(&lagging);
        }
    }

    fn subscribers(&self) -> Vec<(ConnectionId, EventSender)> {
        lock(&self.streams)
            .get(&self.key)
            .filter(|s| s.id == self.id)
            .map(|s| s.subscribers.iter().map(|(c, tx)| (*c, tx.clone())).collect())
            .unwrap_or_default()
    }

    /// Same rule as `unsubscribe`: an on-demand stream left empty stops.
    fn drop_subscribers(&self, conns: &[ConnectionId]) {
        let mut streams = lock(&self.streams);
        let Some(stream) = streams.get_mut(&self.key).filter(|s| s.id == self.id) else {
            return;
        };
        for conn in conns {
            stream.subscribers.remove(conn);
        }
        if stream.mode == StreamMode::OnDemand && stream.subscribers.is_empty() {
            teardown(&mut streams, &self.key);
        }
    }

    /// Terminal: removes this stream's entry whatever its mode and tells the
    /// remaining subscribers why.
    fn finish(&self, event: impl FnOnce(String, String) -> ServerEvent) {
        let removed = {
            let mut streams = lock(&self.streams);
            if streams.get(&self.key).is_some_and(|s| s.id == self.id) {
                streams.remove(&self.key)
            } else {
                None
            }
        };
        let Some(stream) = removed else {
            return;
        };

        let event = event(self.key.job.clone(), self.key.unit.clone());
        for sender in stream.subscribers.values() {
            let _ = sender.try_send(event.clone());
        }
    }
}
