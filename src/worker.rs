//! Command worker: drains the bounded control-frame queue, coalesces bursts
//! by arbitration ID, and applies them to devices in a fixed order so
//! dependent frames behave predictably.
//!
//! Grounded on `original_source/device_comm.py::device_command_loop`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cmdqueue::CmdQueue;
use crate::devicecmd::DeviceCommandProcessor;
use crate::hwstate::HardwareState;
use crate::ids;
use crate::watchdog::Watchdog;

/// Maximum number of queued frames drained into one coalescing pass before
/// applying.
const DRAIN_BURST_CAP: usize = 1024;

/// Apply order for coalesced control IDs; any other ID seen is applied last.
fn apply_order() -> [u32; 7] {
    [
        ids::RLY_CTRL,
        ids::LOAD_CTRL,
        ids::AFG_CTRL,
        ids::AFG_CTRL_EXT,
        ids::MMETER_CTRL,
        ids::MMETER_CTRL_EXT,
        ids::MRSIGNAL_CTRL,
    ]
}

fn watchdog_key_for(arb: u32) -> Option<&'static str> {
    match arb {
        ids::RLY_CTRL => Some("k1"),
        ids::AFG_CTRL | ids::AFG_CTRL_EXT => Some("afg"),
        ids::MMETER_CTRL | ids::MMETER_CTRL_EXT => Some("mmeter"),
        ids::LOAD_CTRL => Some("eload"),
        ids::MRSIGNAL_CTRL => Some("mrsignal"),
        _ => None,
    }
}

pub fn run(
    queue: Arc<CmdQueue<(u32, Vec<u8>)>>,
    hw: Arc<HardwareState>,
    tx_state: Arc<crate::txstate::OutgoingTxState>,
    diag: Arc<crate::diagnostics::Diagnostics>,
    cfg: Arc<crate::config::Config>,
    watchdog: Arc<Watchdog>,
    stop: Arc<AtomicBool>,
    idle_on_stop: bool,
) {
    info!("command worker started");
    let proc = DeviceCommandProcessor::new(&hw, &tx_state, &diag, &cfg);
    let order = apply_order();

    while !stop.load(Ordering::Relaxed) {
        let Some(first) = queue.take(Duration::from_millis(500)) else { continue };

        let mut latest: HashMap<u32, Vec<u8>> = HashMap::new();
        latest.insert(first.0, first.1);

        for (arb, data) in queue.drain_up_to(DRAIN_BURST_CAP) {
            latest.insert(arb, data);
        }

        let mut applied = std::collections::HashSet::new();
        for &arb in &order {
            if let Some(data) = latest.get(&arb) {
                if let Some(key) = watchdog_key_for(arb) {
                    watchdog.mark(key);
                }
                proc.handle(arb, data);
                applied.insert(arb);
            }
        }
        for (&arb, data) in &latest {
            if applied.contains(&arb) {
                continue;
            }
            proc.handle(arb, data);
        }
    }

    if idle_on_stop {
        hw.apply_idle_all();
    }
    info!("command worker stopped");
}
