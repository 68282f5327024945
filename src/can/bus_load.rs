//! Sliding-window CAN bus-load estimator.
//!
//! Grounded on `original_source/can_metrics.py::BusLoadMeter`: bits are
//! estimated (not measured) as `(overhead_bits + 8*dlc) * stuffing_factor`,
//! summed over a trailing time window to produce a load percentage and
//! frame rates.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_STUFFING_FACTOR: f64 = 1.2;
const DEFAULT_OVERHEAD_BITS: u32 = 48;

struct Event {
    at: Instant,
    bits: u32,
    is_tx: bool,
}

struct Inner {
    events: VecDeque<Event>,
    sum_bits: i64,
    rx_frames: i64,
    tx_frames: i64,
    ema_load_pct: Option<f64>,
}

pub struct BusLoadMeter {
    enabled: bool,
    bitrate: u32,
    window: Duration,
    stuffing_factor: f64,
    overhead_bits: u32,
    ema_alpha: f64,
    inner: Mutex<Inner>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BusLoadSnapshot {
    pub load_pct: Option<f64>,
    pub rx_fps: Option<f64>,
    pub tx_fps: Option<f64>,
}

impl BusLoadMeter {
    pub fn new(bitrate: u32, window_sec: f64, enabled: bool) -> Self {
        Self::with_ema(bitrate, window_sec, enabled, 0.0)
    }

    /// `ema_alpha` smooths the displayed load percentage: `0.0` disables
    /// smoothing (the snapshot reports the raw windowed value); otherwise
    /// `ema = alpha*raw + (1-alpha)*ema_prev`.
    pub fn with_ema(bitrate: u32, window_sec: f64, enabled: bool, ema_alpha: f64) -> Self {
        BusLoadMeter {
            enabled,
            bitrate: bitrate.max(1),
            window: Duration::from_secs_f64(window_sec.max(0.1)),
            stuffing_factor: DEFAULT_STUFFING_FACTOR,
            overhead_bits: DEFAULT_OVERHEAD_BITS,
            ema_alpha: ema_alpha.clamp(0.0, 1.0),
            inner: Mutex::new(Inner { events: VecDeque::new(), sum_bits: 0, rx_frames: 0, tx_frames: 0, ema_load_pct: None }),
        }
    }

    fn estimate_bits(&self, dlc: usize) -> u32 {
        (((self.overhead_bits as f64) + 8.0 * dlc as f64) * self.stuffing_factor).round() as u32
    }

    fn purge(&self, inner: &mut Inner, now: Instant) {
        while let Some(front) = inner.events.front() {
            if now.saturating_duration_since(front.at) > self.window {
                let ev = inner.events.pop_front().unwrap();
                inner.sum_bits -= ev.bits as i64;
                if ev.is_tx {
                    inner.tx_frames -= 1;
                } else {
                    inner.rx_frames -= 1;
                }
            } else {
                break;
            }
        }
    }

    fn record(&self, dlc: usize, is_tx: bool) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let bits = self.estimate_bits(dlc);
        let mut inner = self.inner.lock().unwrap();
        self.purge(&mut inner, now);
        inner.events.push_back(Event { at: now, bits, is_tx });
        inner.sum_bits += bits as i64;
        if is_tx {
            inner.tx_frames += 1;
        } else {
            inner.rx_frames += 1;
        }
    }

    pub fn record_rx(&self, dlc: usize) {
        self.record(dlc, false);
    }

    pub fn record_tx(&self, dlc: usize) {
        self.record(dlc, true);
    }

    pub fn snapshot(&self) -> BusLoadSnapshot {
        if !self.enabled {
            return BusLoadSnapshot::default();
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        self.purge(&mut inner, now);
        let window_s = self.window.as_secs_f64();
        let raw_load = (100.0 * (inner.sum_bits as f64) / (self.bitrate as f64 * window_s)).clamp(0.0, 100.0);
        let displayed = if self.ema_alpha > 0.0 {
            let smoothed = match inner.ema_load_pct {
                Some(prev) => self.ema_alpha * raw_load + (1.0 - self.ema_alpha) * prev,
                None => raw_load,
            };
            inner.ema_load_pct = Some(smoothed);
            smoothed
        } else {
            raw_load
        };
        BusLoadSnapshot {
            load_pct: Some(displayed.clamp(0.0, 100.0)),
            rx_fps: Some(inner.rx_frames as f64 / window_s),
            tx_fps: Some(inner.tx_frames as f64 / window_s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_meter_reports_none() {
        let m = BusLoadMeter::new(250_000, 1.0, false);
        m.record_rx(8);
        let s = m.snapshot();
        assert!(s.load_pct.is_none());
    }

    #[test]
    fn load_increases_with_frames() {
        let m = BusLoadMeter::new(250_000, 1.0, true);
        for _ in 0..50 {
            m.record_rx(8);
        }
        let s = m.snapshot();
        assert!(s.load_pct.unwrap() > 0.0);
        assert_eq!(s.rx_fps.unwrap().round() as i64, 50);
    }

    #[test]
    fn estimate_bits_matches_formula() {
        let m = BusLoadMeter::new(250_000, 1.0, true);
        assert_eq!(m.estimate_bits(8), ((48.0 + 64.0) * 1.2).round() as u32);
    }

    #[test]
    fn ema_smooths_toward_raw_load_gradually() {
        let m = BusLoadMeter::with_ema(250_000, 1.0, true, 0.5);
        for _ in 0..50 {
            m.record_rx(8);
        }
        let first = m.snapshot().load_pct.unwrap();
        // Busier window on the next read should move the EMA only partway
        // toward the new raw value, not jump straight to it.
        for _ in 0..50 {
            m.record_rx(8);
        }
        let second = m.snapshot().load_pct.unwrap();
        assert!(second > first);
    }
}
