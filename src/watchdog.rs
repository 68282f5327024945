//! Control watchdog: per-key freshness tracking with grace, warn/timeout
//! states, and idempotent idle enforcement.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchdogState {
    Fresh,
    Warn,
    Timeout,
}

struct KeyState {
    last_seen: Option<Instant>,
    state: Option<WatchdogState>,
    timeout_sec: f64,
}

pub struct Watchdog {
    grace_sec: f64,
    keys: Mutex<HashMap<String, KeyState>>,
}

/// One watchdog transition the caller must act on by driving the named key
/// to its idle state.
pub struct IdleTransition {
    pub key: String,
}

impl Watchdog {
    pub fn new(grace_sec: f64) -> Self {
        Watchdog { grace_sec: grace_sec.max(0.0), keys: Mutex::new(HashMap::new()) }
    }

    /// Registers `key` with its own timeout if not already known.
    pub fn register(&self, key: &str, timeout_sec: f64) {
        let mut keys = self.keys.lock().unwrap();
        keys.entry(key.to_string()).or_insert(KeyState {
            last_seen: None,
            state: None,
            timeout_sec,
        });
    }

    /// Marks `key` as having just seen control traffic.
    pub fn mark(&self, key: &str) {
        let mut keys = self.keys.lock().unwrap();
        let entry = keys.entry(key.to_string()).or_insert(KeyState {
            last_seen: None,
            state: None,
            timeout_sec: f64::INFINITY,
        });
        entry.last_seen = Some(Instant::now());
        entry.state = Some(WatchdogState::Fresh);
    }

    /// Evaluates all keys against `now`, returning the keys that just
    /// transitioned into `Timeout` (the caller applies the idle action for
    /// each exactly once).
    pub fn enforce(&self, now: Instant) -> Vec<IdleTransition> {
        let mut keys = self.keys.lock().unwrap();
        let mut transitions = Vec::new();
        for (name, st) in keys.iter_mut() {
            let age = st.last_seen.map(|t| now.saturating_duration_since(t).as_secs_f64());
            let new_state = match age {
                None => WatchdogState::Timeout,
                Some(age) if age > st.timeout_sec => WatchdogState::Timeout,
                Some(age) if age > (st.timeout_sec - self.grace_sec) => WatchdogState::Warn,
                Some(_) => WatchdogState::Fresh,
            };
            if new_state == WatchdogState::Timeout && st.state != Some(WatchdogState::Timeout) {
                transitions.push(IdleTransition { key: name.clone() });
            }
            st.state = Some(new_state);
        }
        transitions
    }

    pub fn state_of(&self, key: &str) -> Option<WatchdogState> {
        self.keys.lock().unwrap().get(key).and_then(|k| k.state)
    }

    /// Per-key badge states for the observability surface (sticky
    /// `ok -> warn -> timeout` badges).
    pub fn snapshot(&self) -> HashMap<String, WatchdogState> {
        self.keys
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(k, st)| st.state.map(|s| (k.clone(), s)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn times_out_exactly_once_per_transition() {
        let wd = Watchdog::new(0.0);
        wd.register("afg", 0.05);
        wd.mark("afg");
        assert!(wd.enforce(Instant::now()).is_empty());

        sleep(Duration::from_millis(80));
        let t1 = wd.enforce(Instant::now());
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].key, "afg");

        // Still timed out, but no repeat transition until re-marked.
        let t2 = wd.enforce(Instant::now());
        assert!(t2.is_empty());

        wd.mark("afg");
        assert!(wd.enforce(Instant::now()).is_empty());
    }

    #[test]
    fn unmarked_key_starts_in_timeout() {
        let wd = Watchdog::new(0.0);
        wd.register("k1", 1.0);
        let t = wd.enforce(Instant::now());
        assert_eq!(t.len(), 1);
    }
}
