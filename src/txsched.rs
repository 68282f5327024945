//! Multi-rate CAN TX scheduler: one task per readback frame
//! family, each on its own period with drift correction, optional
//! presence-gating, and optional send-on-change.
//!
//! Grounded on `original_source/can_comm.py::can_tx_loop`: advance the
//! schedule before sending so a slow send doesn't accumulate drift, and
//! treat each frame's send failure independently so one bad write never
//! blocks the others.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::can::backend::{CanBackend, CanFrame};
use crate::can::bus_load::BusLoadMeter;
use crate::ids;
use crate::txstate::OutgoingTxState;

/// One scheduled readback task: builds and (if present) sends a frame on
/// its own period. `build` doubles as the presence predicate:
/// it returns `None` when the underlying value is absent.
struct Task {
    name: &'static str,
    period: Duration,
    next_due: Instant,
    present_last: bool,
    last_payload: Option<Vec<u8>>,
    last_sent_at: Option<Instant>,
    build: Box<dyn Fn(&OutgoingTxState) -> Option<(u32, Vec<u8>)> + Send>,
}

impl Task {
    fn new(name: &'static str, period_ms: u64, build: impl Fn(&OutgoingTxState) -> Option<(u32, Vec<u8>)> + Send + 'static) -> Option<Task> {
        if period_ms == 0 {
            return None;
        }
        Some(Task {
            name,
            period: Duration::from_millis(period_ms),
            next_due: Instant::now(),
            present_last: false,
            last_payload: None,
            last_sent_at: None,
            build: Box::new(build),
        })
    }
}

pub struct TxScheduler {
    tasks: Vec<Task>,
    send_on_change: bool,
    send_on_change_min: Duration,
}

impl TxScheduler {
    pub fn build(cfg: &crate::config::Config) -> Self {
        let mut tasks = Vec::new();

        if let Some(t) = Task::new("meter_current", cfg.tx_period_meter_ms, |tx| {
            tx.snapshot().meter_current_ma.map(|ma| {
                let data = crate::frames::dmm::encode_meter_legacy(ma);
                (ids::MMETER_READ, data.to_vec())
            })
        }) {
            tasks.push(t);
        }

        if let Some(t) = Task::new("meter_ext", cfg.tx_period_meter_ext_ms, |tx| {
            let s = tx.snapshot();
            if s.meter_primary.is_none() && s.meter_secondary.is_none() {
                return None;
            }
            let data = crate::frames::dmm::encode_meter_ext(
                s.meter_primary.unwrap_or(f32::NAN),
                s.meter_secondary.unwrap_or(f32::NAN),
            );
            Some((ids::MMETER_READ_EXT, data.to_vec()))
        }) {
            tasks.push(t);
        }

        if let Some(t) = Task::new("meter_status", cfg.tx_period_meter_status_ms, |tx| {
            let s = tx.snapshot();
            let func = s.meter_func?;
            let flags = s.meter_flags.unwrap_or(0);
            let data = crate::frames::dmm::encode_meter_status(
                crate::frames::dmm::MmeterFunc::from_u8(func).unwrap_or(crate::frames::dmm::MmeterFunc::Vdc),
                flags,
            );
            Some((ids::MMETER_STATUS, data.to_vec()))
        }) {
            tasks.push(t);
        }

        if let Some(t) = Task::new("eload", cfg.tx_period_eload_ms, |tx| {
            let s = tx.snapshot();
            if s.load_volts_mv.is_none() && s.load_current_ma.is_none() {
                return None;
            }
            let data = crate::frames::eload::encode_readback(
                s.load_volts_mv.unwrap_or(0),
                s.load_current_ma.unwrap_or(0),
            );
            Some((ids::ELOAD_READ, data.to_vec()))
        }) {
            tasks.push(t);
        }

        if let Some(t) = Task::new("afg_ext", cfg.tx_period_afg_ext_ms, |tx| {
            let s = tx.snapshot();
            if s.afg_offset_mv.is_none() && s.afg_duty_pct.is_none() {
                return None;
            }
            let data = crate::frames::afg::encode_ext_readback(
                s.afg_offset_mv.unwrap_or(0),
                s.afg_duty_pct.unwrap_or(0),
            );
            Some((ids::AFG_READ_EXT, data.to_vec()))
        }) {
            tasks.push(t);
        }

        if let Some(t) = Task::new("mrsignal_status", cfg.tx_period_mrsignal_status_ms, |tx| {
            let status = tx.snapshot().mrs_status?;
            let data = crate::frames::mrsignal::encode_status(status.on, status.mode, status.value);
            Some((ids::MRSIGNAL_READ_STATUS, data.to_vec()))
        }) {
            tasks.push(t);
        }

        if let Some(t) = Task::new("mrsignal_input", cfg.tx_period_mrsignal_input_ms, |tx| {
            let value = tx.snapshot().mrs_input?;
            let data = crate::frames::mrsignal::encode_input(value);
            Some((ids::MRSIGNAL_READ_INPUT, data.to_vec()))
        }) {
            tasks.push(t);
        }

        TxScheduler {
            tasks,
            send_on_change: cfg.tx_send_on_change,
            send_on_change_min: Duration::from_millis(cfg.tx_send_on_change_min_ms),
        }
    }

    /// Runs until `stop` is set, following this per-tick algorithm
    /// §4.9: evaluate presence (forcing an immediate due-date on an
    /// absent→present transition), send when due, and otherwise send early
    /// only if send-on-change is enabled, the payload changed, and the
    /// minimum change interval has elapsed.
    pub fn run(
        mut self,
        backend: Arc<Mutex<Box<dyn CanBackend>>>,
        tx_state: Arc<OutgoingTxState>,
        bus_load: Arc<BusLoadMeter>,
        stop: Arc<AtomicBool>,
    ) {
        if self.tasks.is_empty() {
            return;
        }
        let mut err_count: u64 = 0;

        while !stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            let earliest_due = self.tasks.iter().map(|t| t.next_due).min().unwrap_or(now + Duration::from_millis(100));
            let sleep_for = earliest_due.saturating_duration_since(now).min(Duration::from_millis(100));
            if sleep_for > Duration::ZERO {
                std::thread::sleep(sleep_for);
            }

            let now = Instant::now();
            for task in self.tasks.iter_mut() {
                let payload = (task.build)(&tx_state);
                let present = payload.is_some();

                if present && !task.present_last {
                    task.next_due = now;
                }
                task.present_last = present;

                let Some((arb_id, data)) = payload else {
                    task.last_payload = None;
                    continue;
                };

                let due = now >= task.next_due;
                if !due && !self.send_on_change {
                    continue;
                }

                let changed = task.last_payload.as_deref() != Some(data.as_slice());
                let change_ready = self.send_on_change
                    && changed
                    && task.last_sent_at.map_or(true, |t| now.duration_since(t) >= self.send_on_change_min);

                if !due && !change_ready {
                    continue;
                }

                let frame = CanFrame::extended(arb_id, &data);
                let send_result = { backend.lock().unwrap().send(&frame) };
                match send_result {
                    Ok(()) => {
                        bus_load.record_tx(data.len());
                        task.last_payload = Some(data);
                        task.last_sent_at = Some(now);
                        if due {
                            task.next_due += task.period;
                            if task.next_due < now.saturating_sub(task.period * 10) {
                                task.next_due = now + task.period;
                            }
                        }
                    }
                    Err(e) => {
                        err_count += 1;
                        if matches!(err_count, 1 | 10 | 100) {
                            warn!(task = task.name, error = %e, count = err_count, "TX send failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::AtomicBool;

    struct RecordingBackend {
        sent: Arc<Mutex<Vec<CanFrame>>>,
    }

    impl CanBackend for RecordingBackend {
        fn send(&mut self, frame: &CanFrame) -> crate::error::GwResult<()> {
            self.sent.lock().unwrap().push(frame.clone());
            Ok(())
        }
        fn recv(&mut self, _timeout: Duration) -> crate::error::GwResult<Option<CanFrame>> {
            Ok(None)
        }
        fn shutdown(&mut self) -> crate::error::GwResult<()> {
            Ok(())
        }
    }

    #[test]
    fn no_send_while_absent_then_sends_promptly_once_present() {
        let mut cfg = Config::for_test();
        cfg.tx_period_eload_ms = 20;
        cfg.tx_period_meter_ms = 0;
        cfg.tx_period_meter_ext_ms = 0;
        cfg.tx_period_meter_status_ms = 0;
        cfg.tx_period_afg_ext_ms = 0;
        cfg.tx_period_mrsignal_status_ms = 0;
        cfg.tx_period_mrsignal_input_ms = 0;

        let sched = TxScheduler::build(&cfg);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let backend: Arc<Mutex<Box<dyn CanBackend>>> = Arc::new(Mutex::new(Box::new(RecordingBackend { sent: sent.clone() })));
        let tx_state = Arc::new(OutgoingTxState::new());
        let bus_load = Arc::new(BusLoadMeter::new(250_000, 1.0, false));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let backend = backend.clone();
            let tx_state = tx_state.clone();
            let bus_load = bus_load.clone();
            let stop = stop.clone();
            std::thread::spawn(move || sched.run(backend, tx_state, bus_load, stop))
        };

        std::thread::sleep(Duration::from_millis(60));
        assert!(sent.lock().unwrap().is_empty(), "no frame should be sent while the eload readback is absent");

        tx_state.update_eload(5000, 1000);
        std::thread::sleep(Duration::from_millis(60));

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let frames = sent.lock().unwrap();
        assert!(!frames.is_empty(), "a frame should be sent promptly after becoming present");
        assert!(frames.iter().all(|f| f.arbitration_id == crate::ids::ELOAD_READ));
    }
}
