//! Bounded event ring with per-source dedupe, plus per-key health tracking.
//!
//! Grounded on `original_source/src/roi/core/diagnostics.py`: a ring buffer
//! sized for UI display (not heavy structured logging), a short dedupe
//! window that collapses identical repeated messages, and a health map
//! keyed by device name.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DiagEvent {
    pub ts_unix: f64,
    #[serde(skip)]
    pub ts_mono: Instant,
    pub level: String,
    pub source: String,
    pub message: String,
}

struct LastEvent {
    message: String,
    ts_mono: Instant,
    count: u32,
}

#[derive(Default)]
struct HealthRecord {
    last_ok_mono: Option<Instant>,
    last_error_mono: Option<Instant>,
    error_count: u64,
    last_error: Option<String>,
}

#[derive(Serialize)]
pub struct HealthSnapshot {
    pub last_ok_age_s: Option<f64>,
    pub last_error_age_s: Option<f64>,
    pub error_count: u64,
    pub last_error: Option<String>,
}

struct Inner {
    events: VecDeque<DiagEvent>,
    max_events: usize,
    dedupe_window_sec: f64,
    last_event: HashMap<String, LastEvent>,
    health: HashMap<String, HealthRecord>,
}

pub struct Diagnostics {
    inner: Mutex<Inner>,
}

impl Diagnostics {
    pub fn new(max_events: usize, dedupe_window_sec: f64) -> Self {
        Diagnostics {
            inner: Mutex::new(Inner {
                events: VecDeque::with_capacity(max_events),
                max_events: max_events.max(1),
                dedupe_window_sec: dedupe_window_sec.max(0.0),
                last_event: HashMap::new(),
                health: HashMap::new(),
            }),
        }
    }

    pub fn log(&self, level: &str, source: &str, message: impl Into<String>) {
        let message = message.into();
        let now_m = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        if inner.dedupe_window_sec > 0.0 {
            if let Some(prev) = inner.last_event.get_mut(source) {
                if prev.message == message
                    && now_m.saturating_duration_since(prev.ts_mono).as_secs_f64() < inner.dedupe_window_sec
                {
                    prev.count += 1;
                    prev.ts_mono = now_m;
                    return;
                }
            }
            inner.last_event.insert(
                source.to_string(),
                LastEvent { message: message.clone(), ts_mono: now_m, count: 1 },
            );
        }

        let ts_unix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
        if inner.events.len() >= inner.max_events {
            inner.events.pop_front();
        }
        inner.events.push_back(DiagEvent {
            ts_unix,
            ts_mono: now_m,
            level: level.to_string(),
            source: source.to_string(),
            message,
        });
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.log("info", source, message);
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.log("error", source, message);
    }

    /// Records a successful interaction for `key`.
    pub fn mark_ok(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.health.entry(key.to_string()).or_default().last_ok_mono = Some(Instant::now());
    }

    /// Records a failure for `key`; also emits a (dedupe-throttled) event.
    pub fn mark_error(&self, key: &str, err: &dyn std::fmt::Display) {
        let now_m = Instant::now();
        let msg = err.to_string();
        {
            let mut inner = self.inner.lock().unwrap();
            let rec = inner.health.entry(key.to_string()).or_default();
            rec.error_count += 1;
            rec.last_error_mono = Some(now_m);
            rec.last_error = Some(msg.clone());
        }
        self.log("error", key, msg);
    }

    pub fn events_snapshot(&self) -> Vec<DiagEvent> {
        self.inner.lock().unwrap().events.iter().cloned().collect()
    }

    pub fn health_snapshot(&self) -> HashMap<String, HealthSnapshot> {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        inner
            .health
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    HealthSnapshot {
                        last_ok_age_s: v.last_ok_mono.map(|t| now.saturating_duration_since(t).as_secs_f64()),
                        last_error_age_s: v.last_error_mono.map(|t| now.saturating_duration_since(t).as_secs_f64()),
                        error_count: v.error_count,
                        last_error: v.last_error.clone(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn dedupes_repeated_messages_within_window() {
        let d = Diagnostics::new(10, 10.0);
        d.info("k1", "stale");
        d.info("k1", "stale");
        d.info("k1", "stale");
        assert_eq!(d.events_snapshot().len(), 1);
    }

    #[test]
    fn distinct_messages_are_not_deduped() {
        let d = Diagnostics::new(10, 10.0);
        d.info("k1", "a");
        d.info("k1", "b");
        assert_eq!(d.events_snapshot().len(), 2);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let d = Diagnostics::new(3, 0.0);
        for i in 0..10 {
            d.info("src", format!("msg-{i}"));
        }
        assert_eq!(d.events_snapshot().len(), 3);
    }

    #[test]
    fn health_tracks_ok_and_error() {
        let d = Diagnostics::new(10, 0.0);
        d.mark_ok("eload");
        d.mark_error("eload", &"boom");
        sleep(Duration::from_millis(5));
        let snap = d.health_snapshot();
        let rec = &snap["eload"];
        assert_eq!(rec.error_count, 1);
        assert!(rec.last_ok_age_s.unwrap() >= 0.0);
    }
}
