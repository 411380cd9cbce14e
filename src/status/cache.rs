use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::helpers::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pods,
    Services,
    Combined,
    Cluster,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Pods,
        ResourceKind::Services,
        ResourceKind::Combined,
        ResourceKind::Cluster,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Pods => "pods",
            ResourceKind::Services => "services",
            ResourceKind::Combined => "combined",
            ResourceKind::Cluster => "cluster",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown cache kind {:?}", s)))
    }
}

pub struct CacheEntry<T> {
    data: Option<T>,
    timestamp: Option<Instant>,
    ttl: Duration,
    /// Bumped by `clear`; a fetch started under an older generation is not
    /// stored.
    generation: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub cached: bool,
    pub age_ms: Option<u64>,
    pub ttl_ms: u64,
}

impl<T: Clone> CacheEntry<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            data: None,
            timestamp: None,
            ttl,
            generation: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        match (&self.data, self.timestamp) {
            (Some(_), Some(ts)) => ts.elapsed() < self.ttl,
            _ => false,
        }
    }

    pub fn fresh(&self) -> Option<T> {
        if self.is_valid() { self.data.clone() } else { None }
    }

    /// Last stored data regardless of age.
    pub fn stale(&self) -> Option<T> {
        self.data.clone()
    }

    pub fn store(&mut self, data: T) {
        self.data = Some(data);
        self.timestamp = Some(Instant::now());
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stores `data` only if the entry was not cleared since `generation`.
    pub fn store_if(&mut self, generation: u64, data: T) -> bool {
        if self.generation != generation {
            return false;
        }
        self.store(data);
        true
    }

    /// Empties the entry so the next read must execute.
    pub fn clear(&mut self) {
        self.data = None;
        self.timestamp = None;
        self.generation += 1;
    }

    pub fn status(&self) -> CacheStatus {
        CacheStatus {
            cached: self.is_valid(),
            age_ms: self.timestamp.map(|ts| ts.elapsed().as_millis() as u64),
            ttl_ms: self.ttl.as_millis() as u64,
        }
    }
}

/// A status payload tagged with where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct Cached<T> {
    #[serde(flatten)]
    pub data: T,
    pub cached: bool,
    /// Set when a refresh failed and `data` is stale or empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Serves `entry` if valid, otherwise runs `fetch` and stores its result.
///
/// A forced read surfaces fetch errors. A plain read never fails: it falls
/// back to the last stored data, or `T::default()`, with `error` set.
pub async fn read_through<T, F, Fut>(
    entry: &Mutex<CacheEntry<T>>,
    kind: ResourceKind,
    force_refresh: bool,
    fetch: F,
) -> CoreResult<Cached<T>>
where
    T: Clone + Default,
    F: FnOnce() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let (fresh, generation) = {
        let entry = lock(entry);
        (entry.fresh(), entry.generation())
    };
    if !force_refresh {
        if let Some(data) = fresh {
            info!("returning cached {} data", kind.as_str());
            return Ok(Cached {
                data,
                cached: true,
                error: None,
            });
        }
    }

    match fetch().await {
        Ok(data) => {
            if !lock(entry).store_if(generation, data.clone()) {
                debug!("{} cache cleared during fetch, result not stored", kind.as_str());
            }
            Ok(Cached {
                data,
                cached: false,
                error: None,
            })
        }
        Err(e) if force_refresh => Err(e),
        Err(e) => {
            warn!("{} refresh failed, serving stale data: {}", kind.as_str(), e);
            let stale = lock(entry).stale();
            Ok(Cached {
                cached: stale.is_some(),
                data: stale.unwrap_or_default(),
                error: Some(e.to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(15_000);
    const EPS: Duration = Duration::from_millis(1);

    #[tokio::test(start_paused = true)]
    async fn ttl_boundary() {
        let mut entry = CacheEntry::new(TTL);
        assert!(!entry.is_valid());

        entry.store(7u32);
        tokio::time::advance(TTL - EPS).await;
        assert!(entry.is_valid());
        assert_eq!(entry.fresh(), Some(7));

        tokio::time::advance(EPS * 2).await;
        assert!(!entry.is_valid());
        assert_eq!(entry.fresh(), None);
        assert_eq!(entry.stale(), Some(7));
    }

    #[test]
    fn store_after_clear_is_discarded() {
        let mut entry = CacheEntry::new(TTL);
        let before = entry.generation();
        entry.clear();
        assert!(!entry.store_if(before, 1u32));
        assert_eq!(entry.stale(), None);
        assert!(entry.store_if(entry.generation(), 2));
        assert_eq!(entry.fresh(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_resets_data_and_timestamp() {
        let mut entry = CacheEntry::new(TTL);
        entry.store("x".to_string());
        entry.clear();

        assert!(!entry.is_valid());
        assert_eq!(entry.stale(), None);
        let status = entry.status();
        assert!(!status.cached);
        assert_eq!(status.age_ms, None);
        assert_eq!(status.ttl_ms, 15_000);
    }

    #[tokio::test(start_paused = true)]
    async fn plain_read_degrades_forced_read_fails() {
        let entry = Mutex::new(CacheEntry::<Vec<u8>>::new(Duration::from_millis(10)));

        let first = read_through(&entry, ResourceKind::Pods, false, || async { Ok(vec![1]) })
            .await
            .unwrap();
        assert!(!first.cached);

        tokio::time::advance(Duration::from_millis(20)).await;
        let failing = || async { Err::<Vec<u8>, _>(CoreError::NotFound("nodes".into())) };

        let degraded = read_through(&entry, ResourceKind::Pods, false, failing)
            .await
            .unwrap();
        assert_eq!(degraded.data, vec![1]);
        assert!(degraded.cached);
        assert!(degraded.error.is_some());

        assert!(
            read_through(&entry, ResourceKind::Pods, true, failing)
                .await
                .is_err()
        );

        lock(&entry).clear();
        let empty = read_through(&entry, ResourceKind::Pods, false, failing)
            .await
            .unwrap();
        assert!(empty.data.is_empty());
        assert!(!empty.cached);
    }

    #[test]
    fn kinds_parse() {
        assert_eq!("combined".parse::<ResourceKind>().unwrap(), ResourceKind::Combined);
        assert!("volumes".parse::<ResourceKind>().is_err());
    }
}
