use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Locks a mutex that is never held across an await; a poisoned lock still
/// holds consistent state, so it is recovered rather than propagated.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn human_age_secs(total_secs: i64) -> String {
    let total_secs = total_secs.max(0);
    let days = total_secs / 86400;
    let hours = (total_secs % 86400) / 3600;
    let minutes = (total_secs % 3600) / 60;

    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

/// Age of a Kubernetes object from its RFC 3339 creation timestamp.
pub fn parse_age(creation_timestamp: Option<&str>, now: DateTime<Utc>) -> String {
    let ts = match creation_timestamp {
        Some(s) if !s.is_empty() => s,
        _ => return "Unknown".to_string(),
    };

    match DateTime::parse_from_rfc3339(ts) {
        Ok(dt) => human_age_secs((now - dt.to_utc()).num_seconds()),
        Err(_) => "Unknown".to_string(),
    }
}

pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
