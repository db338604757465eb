//! On-demand Bambu status.
//!
//! Entries are created by the first query for a serial and only then start absorbing reports.
//! An entry that nobody queried for the idle window is dropped by the reaper.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::normalizer::{apply_report, BambuSnapshot};
use super::pool::{BambuMqttPool, ConnectionState, ListenerError, ReportListener};

pub const STATUS_CONNECTING: &str = "CONNECTING";
pub const STATUS_UNREACHABLE: &str = "UNREACHABLE";
pub const STATUS_ONLINE: &str = "ONLINE";

struct CacheEntry {
    snapshot: BambuSnapshot,
    /// Epoch milliseconds of the last merged report, 0 until the first one.
    last_updated: i64,
    last_query: Instant,
}

impl CacheEntry {
    fn new(now: Instant) -> Self {
        Self {
            snapshot: BambuSnapshot::default(),
            last_updated: 0,
            last_query: now,
        }
    }
}

/// What a status query returns.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub serial: String,
    /// `ONLINE` once a report arrived, else `CONNECTING` or `UNREACHABLE`.
    pub status: String,
    pub gcode_state: Option<String>,
    pub last_updated: i64,
    pub snapshot: Option<BambuSnapshot>,
}

pub struct BambuStatusCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    idle: Duration,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl BambuStatusCache {
    pub fn new(idle: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle,
            reaper: Mutex::new(None),
        }
    }

    /// Current status of `serial`, registering interest in it. Asks the printer for a full
    /// dump when nothing has been received yet.
    pub async fn query(&self, serial: &str, pool: &BambuMqttPool) -> StatusView {
        let (view, never_reported) = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let entry = entries
                .entry(serial.to_string())
                .or_insert_with(|| CacheEntry::new(Instant::now()));
            entry.last_query = Instant::now();
            (view_of(serial, entry), entry.last_updated == 0)
        };

        let state = pool.connection_state(serial);
        if never_reported && state == ConnectionState::Connected {
            if let Err(e) = pool.request_pushall(serial).await {
                tracing::warn!("Status request to {} failed: {}", serial, e);
            }
        }

        match (state, view.last_updated) {
            (ConnectionState::Absent, _) => StatusView {
                status: STATUS_UNREACHABLE.to_string(),
                ..view
            },
            (_, 0) => StatusView {
                status: STATUS_CONNECTING.to_string(),
                ..view
            },
            _ => view,
        }
    }

    /// Last known snapshot without registering interest.
    pub fn peek(&self, serial: &str) -> Option<(BambuSnapshot, i64)> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(serial)
            .filter(|entry| entry.last_updated > 0)
            .map(|entry| (entry.snapshot.clone(), entry.last_updated))
    }

    pub fn tracked(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop entries whose last query is at least the idle window before `now`.
    pub fn evict_idle_at(&self, now: Instant) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let idle = self.idle;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_query) >= idle)
            .map(|(serial, _)| serial.clone())
            .collect();
        for serial in &expired {
            entries.remove(serial);
            tracing::debug!("Status monitor for {} idle, dropped", serial);
        }
        expired
    }

    pub fn start_reaper(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        let period = (self.idle / 5).max(Duration::from_secs(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                cache.evict_idle_at(Instant::now());
            }
        });
        if let Some(previous) = self.reaper.lock().unwrap_or_else(|e| e.into_inner()).replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_reaper(&self) {
        if let Some(handle) = self.reaper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

fn view_of(serial: &str, entry: &CacheEntry) -> StatusView {
    StatusView {
        serial: serial.to_string(),
        status: STATUS_ONLINE.to_string(),
        gcode_state: entry.snapshot.gcode_state().map(str::to_string),
        last_updated: entry.last_updated,
        snapshot: (entry.last_updated > 0).then(|| entry.snapshot.clone()),
    }
}

impl ReportListener for BambuStatusCache {
    fn on_report(&self, serial: &str, _printer_name: &str, report: &Value) -> Result<(), ListenerError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(serial) {
            if apply_report(&mut entry.snapshot, report) {
                entry.last_updated = Utc::now().timestamp_millis();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded(cache: &BambuStatusCache, serial: &str, at: Instant) {
        cache
            .entries
            .lock()
            .unwrap()
            .insert(serial.to_string(), CacheEntry::new(at));
    }

    #[test]
    fn reports_for_unqueried_printers_are_ignored() {
        let cache = BambuStatusCache::new(Duration::from_secs(300));
        cache.on_report("S1", "p", &json!({"print": {"gcode_state": "IDLE"}})).unwrap();
        assert_eq!(cache.tracked(), 0);
        assert!(cache.peek("S1").is_none());
    }

    #[test]
    fn reports_merge_into_tracked_entries() {
        let cache = BambuStatusCache::new(Duration::from_secs(300));
        seeded(&cache, "S1", Instant::now());
        assert!(cache.peek("S1").is_none());
        cache.on_report("S1", "p", &json!({"print": {"gcode_state": "RUNNING"}})).unwrap();
        cache.on_report("S1", "p", &json!({"print": {"mc_percent": 40}})).unwrap();
        let (snapshot, updated) = cache.peek("S1").unwrap();
        assert!(updated > 0);
        assert_eq!(snapshot.gcode_state(), Some("RUNNING"));
        assert_eq!(snapshot.gauge("print_progress_percent"), Some(40.0));
    }

    #[test]
    fn idle_entries_are_evicted() {
        let cache = BambuStatusCache::new(Duration::from_secs(300));
        let start = Instant::now();
        seeded(&cache, "old", start);
        seeded(&cache, "fresh", start + Duration::from_secs(200));
        let evicted = cache.evict_idle_at(start + Duration::from_secs(300));
        assert_eq!(evicted, vec!["old".to_string()]);
        assert_eq!(cache.tracked(), 1);
    }
}
