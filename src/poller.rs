//! Background measurement/status poller: a fast cadence for
//! live measurements (meter current, e-load volts/current) and a slow
//! cadence for status strings and MrSignal input, skipping the multimeter
//! while a control write is still settling.
//!
//! Grounded on the headless main loop in `original_source/main.py`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::hwstate::HardwareState;
use crate::txstate::OutgoingTxState;

pub fn run(
    hw: Arc<HardwareState>,
    tx_state: Arc<OutgoingTxState>,
    diag: Arc<Diagnostics>,
    cfg: Arc<Config>,
    stop: Arc<AtomicBool>,
) {
    let meas_period = Duration::from_millis(cfg.meas_poll_period_ms.max(1));
    let status_period = Duration::from_millis(cfg.status_poll_period_ms.max(1));
    let mut next_status = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        let loop_start = Instant::now();

        poll_mmeter(&hw, &tx_state, &diag);
        poll_eload_meas(&hw, &tx_state, &diag);
        poll_mrsignal_input(&hw, &tx_state, &diag);

        if loop_start >= next_status {
            next_status = loop_start + status_period;
            poll_eload_status(&hw, &diag);
            poll_afg_status(&hw, &tx_state, &diag);
            poll_mrsignal_status(&hw, &tx_state, &diag);
        }

        let elapsed = loop_start.elapsed();
        if elapsed < meas_period {
            std::thread::sleep(meas_period - elapsed);
        }
    }
}

fn poll_mmeter(hw: &HardwareState, tx_state: &OutgoingTxState, diag: &Diagnostics) {
    let mut st = hw.mmeter.lock().unwrap();
    if let Some(quiet_until) = st.quiet_until {
        if Instant::now() < quiet_until {
            return;
        }
    }
    let func = st.func;
    let Some(link) = st.link.as_mut() else { return };
    match link.fetch_values("FETC?") {
        Ok(r) => {
            if let Some(primary) = r.primary {
                let ma = (primary * 1000.0).round();
                if ma.is_finite() {
                    tx_state.update_meter_current(ma.clamp(0.0, u16::MAX as f64) as u16);
                }
                tx_state.update_meter_ext(Some(primary as f32), r.secondary.map(|v| v as f32));
            }
            tx_state.update_meter_status(func.to_u8(), st.autorange as u8);
            diag.mark_ok("mmeter");
        }
        Err(e) => diag.mark_error("mmeter", &e),
    }
}

fn poll_eload_meas(hw: &HardwareState, tx_state: &OutgoingTxState, diag: &Diagnostics) {
    let mut st = hw.eload.lock().unwrap();
    let Some(link) = st.link.as_mut() else { return };
    let v = link.fetch_values("MEAS:VOLT?");
    let i = link.fetch_values("MEAS:CURR?");
    match (v, i) {
        (Ok(v), Ok(i)) => {
            if let (Some(volts), Some(amps)) = (v.primary, i.primary) {
                let mv = (volts * 1000.0).clamp(0.0, u16::MAX as f64) as u16;
                let ma = (amps * 1000.0).clamp(0.0, u16::MAX as f64) as u16;
                tx_state.update_eload(mv, ma);
                diag.mark_ok("eload");
            }
        }
        (Err(e), _) | (_, Err(e)) => diag.mark_error("eload", &e),
    }
}

fn poll_eload_status(hw: &HardwareState, diag: &Diagnostics) {
    let mut st = hw.eload.lock().unwrap();
    let Some(link) = st.link.as_mut() else { return };
    for q in ["FUNC?", "CURR?", "INP?", "RES?"] {
        if let Err(e) = link.query_line(q, 4) {
            diag.mark_error("eload", &e);
            return;
        }
    }
    diag.mark_ok("eload");
}

fn poll_afg_status(hw: &HardwareState, tx_state: &OutgoingTxState, diag: &Diagnostics) {
    let mut st = hw.afg.lock().unwrap();
    let Some(link) = st.link.as_mut() else { return };

    let offset_v = link.query_line("SOUR1:VOLT:OFFS?", 4).ok().and_then(|s| s.trim().parse::<f64>().ok());
    let duty = link.query_line("SOUR1:SQU:DCYC?", 4).ok().and_then(|s| s.trim().parse::<f64>().ok());

    match (offset_v, duty) {
        (Some(off_v), Some(duty_pct)) => {
            let off_mv = crate::frames::clamp_i16((off_v * 1000.0).round() as i64);
            let duty_u8 = duty_pct.round().clamp(0.0, 100.0) as u8;
            st.offset_mv = Some(off_mv);
            st.duty_pct = Some(duty_u8);
            tx_state.update_afg_ext(off_mv, duty_u8);
            diag.mark_ok("afg");
        }
        _ => diag.mark_error("afg", &crate::error::GwError::Instrument("AFG status query returned no data".to_string())),
    }
}

fn poll_mrsignal_input(hw: &HardwareState, tx_state: &OutgoingTxState, diag: &Diagnostics) {
    let mut st = hw.mrsignal.lock().unwrap();
    let Some(client) = st.client.as_mut() else { return };
    match client.read_input_value() {
        Ok(v) => {
            tx_state.update_mrsignal_input(v);
            diag.mark_ok("mrsignal");
        }
        Err(e) => diag.mark_error("mrsignal", &e),
    }
}

fn poll_mrsignal_status(hw: &HardwareState, tx_state: &OutgoingTxState, diag: &Diagnostics) {
    let mut st = hw.mrsignal.lock().unwrap();
    let Some(client) = st.client.as_mut() else { return };
    match (client.read_output_on(), client.read_output_select(), client.read_output_value()) {
        (Ok(on), Ok(select), Ok(value)) => {
            tx_state.update_mrsignal_status(on, select, value);
            diag.mark_ok("mrsignal");
        }
        _ => diag.mark_error("mrsignal", &crate::error::GwError::Instrument("MrSignal status read failed".to_string())),
    }
}
