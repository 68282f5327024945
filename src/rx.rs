//! CAN RX loop: records bus load, marks the "can" watchdog key,
//! captures PAT_Jx matrix traffic, and forwards control-ID frames to the
//! bounded command queue with drop-oldest/drop-newest backpressure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::can::backend::CanBackend;
use crate::can::bus_load::BusLoadMeter;
use crate::cmdqueue::{CmdQueue, PushOutcome};
use crate::frames::pat::decode_payload;
use crate::ids;
use crate::watchdog::Watchdog;

/// Latest decoded PAT_Jx matrix, one slot per PAT_Jx index.
#[derive(Default)]
pub struct PatCapture {
    slots: Mutex<[Option<[u8; 12]>; ids::PAT_J_COUNT as usize]>,
}

impl PatCapture {
    pub fn set(&self, index: u32, fields: [u8; 12]) {
        if let Ok(mut s) = self.slots.lock() {
            if let Some(slot) = s.get_mut(index as usize) {
                *slot = Some(fields);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Option<[u8; 12]>> {
        self.slots.lock().unwrap().to_vec()
    }
}

pub struct DropCounters {
    dropped: AtomicU64,
}

impl Default for DropCounters {
    fn default() -> Self {
        DropCounters { dropped: AtomicU64::new(0) }
    }
}

impl DropCounters {
    fn bump_and_should_log(&self) -> Option<u64> {
        let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 1 || n == 10 || n == 100 || n % 500 == 0 {
            Some(n)
        } else {
            None
        }
    }
}

/// Enqueues a control frame; the queue itself drops the oldest entry on
/// backpressure so the worker always sees the freshest command.
fn enqueue_drop_oldest(queue: &CmdQueue<(u32, Vec<u8>)>, item: (u32, Vec<u8>), drops: &DropCounters) {
    if !matches!(queue.push(item), PushOutcome::Enqueued) {
        if let Some(n) = drops.bump_and_should_log() {
            warn!(total_dropped = n, "command queue full, dropping control frame");
        }
    }
}

pub fn run(
    mut backend: Box<dyn CanBackend>,
    cmd_queue: Arc<CmdQueue<(u32, Vec<u8>)>>,
    watchdog: Arc<Watchdog>,
    bus_load: Arc<BusLoadMeter>,
    pat: Arc<PatCapture>,
    stop: Arc<AtomicBool>,
) {
    let drops = DropCounters::default();
    watchdog.register("can", f64::INFINITY);

    while !stop.load(Ordering::Relaxed) {
        match backend.recv(Duration::from_millis(200)) {
            Ok(Some(frame)) => {
                watchdog.mark("can");
                bus_load.record_rx(frame.data.len());

                if let Some(idx) = ids::pat_j_index(frame.arbitration_id) {
                    if frame.data.len() >= 3 {
                        let mut buf = [0u8; 8];
                        let n = frame.data.len().min(8);
                        buf[..n].copy_from_slice(&frame.data[..n]);
                        pat.set(idx, decode_payload(&buf));
                    }
                    continue;
                }

                if ids::control_ids().contains(&frame.arbitration_id) {
                    enqueue_drop_oldest(&cmd_queue, (frame.arbitration_id, frame.data), &drops);
                }
            }
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "CAN recv error");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    let _ = backend.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pat_capture_stores_by_index() {
        let p = PatCapture::default();
        p.set(2, [1; 12]);
        let snap = p.snapshot();
        assert_eq!(snap[2], Some([1; 12]));
        assert_eq!(snap[0], None);
    }

    #[test]
    fn drop_counters_log_at_expected_milestones() {
        let d = DropCounters::default();
        let mut logged = Vec::new();
        for _ in 0..12 {
            if let Some(n) = d.bump_and_should_log() {
                logged.push(n);
            }
        }
        assert_eq!(logged, vec![1, 10]);
    }
}
