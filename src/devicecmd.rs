//! Applies decoded control frames to physical devices.
//!
//! Contains no CAN I/O. Receives `(arbitration_id, payload)` pairs from the
//! command worker and issues the associated SCPI/Modbus/relay writes, with
//! redundancy suppression (skip a write if the target value already matches
//! the last-applied one) per instrument. Grounded on
//! `original_source/device_comm.py::DeviceCommandProcessor`.

use tracing::warn;

use crate::config::{Config, ScpiStyle};
use crate::diagnostics::Diagnostics;
use crate::frames::afg::{decode_ext as decode_afg_ext, decode_primary as decode_afg_primary};
use crate::frames::dmm::{decode_ext as decode_mmeter_ext, decode_legacy, quantize_nplc, target_function, ExtOp, MmeterFunc};
use crate::frames::eload::{decode as decode_eload, EloadMode};
use crate::frames::mrsignal::decode as decode_mrsignal;
use crate::frames::relay::decode as decode_relay;
use crate::hwstate::HardwareState;
use crate::instruments::scpi::{func_range_prefix, func_to_scpi_conf, func_to_scpi_func};
use crate::txstate::OutgoingTxState;

pub struct DeviceCommandProcessor<'a> {
    hw: &'a HardwareState,
    tx: &'a OutgoingTxState,
    diag: &'a Diagnostics,
    mrsignal_max_v: f64,
    mrsignal_max_ma: f64,
}

impl<'a> DeviceCommandProcessor<'a> {
    pub fn new(hw: &'a HardwareState, tx: &'a OutgoingTxState, diag: &'a Diagnostics, cfg: &Config) -> Self {
        DeviceCommandProcessor { hw, tx, diag, mrsignal_max_v: cfg.mrsignal_max_v, mrsignal_max_ma: cfg.mrsignal_max_ma }
    }

    /// Issues a SCPI write and records the outcome to diagnostics; write
    /// failures are contained here so one bad instrument write never
    /// propagates past the device command processor.
    fn write_logged(&self, source: &str, link: &mut crate::instruments::scpi::ScpiLink, cmd: &str, clear_input: bool) {
        match link.write(cmd, clear_input) {
            Ok(()) => self.diag.mark_ok(source),
            Err(e) => self.diag.mark_error(source, &e),
        }
    }

    pub fn handle(&self, arb: u32, data: &[u8]) {
        match arb {
            crate::ids::RLY_CTRL => self.handle_relay(data),
            crate::ids::LOAD_CTRL => self.handle_eload(data),
            crate::ids::AFG_CTRL => self.handle_afg_primary(data),
            crate::ids::AFG_CTRL_EXT => self.handle_afg_ext(data),
            crate::ids::MMETER_CTRL => self.handle_mmeter_legacy(data),
            crate::ids::MMETER_CTRL_EXT => self.handle_mmeter_ext(data),
            crate::ids::MRSIGNAL_CTRL => self.handle_mrsignal(data),
            _ => {}
        }
    }

    fn handle_relay(&self, data: &[u8]) {
        let Some(cmd) = decode_relay(data) else { return };
        let drive = cmd.drive_bit ^ self.hw.k1_invert;
        self.hw.set_k1_drive(drive);
    }

    /// Disable-first / enable-last per the e-load write-ordering invariant
    /// a disabling frame turns the input off before touching
    /// mode/short/setpoint; an enabling frame sets those first and turns the
    /// input on last. Only the setpoint for the newly active mode is ever
    /// written; the other mode's last-commanded value is still tracked (but
    /// not sent) so a later switch back can suppress a redundant write.
    fn handle_eload(&self, data: &[u8]) {
        let Some(cmd) = decode_eload(data) else { return };
        let mut st = self.hw.eload.lock().unwrap();
        let Some(link) = st.link.as_mut() else { return };

        let enable_changed = st.enabled != Some(cmd.enable);
        let mode_byte = match cmd.mode {
            EloadMode::Curr => 0u8,
            EloadMode::Res => 1u8,
        };

        if enable_changed && !cmd.enable {
            self.write_logged("eload", link, "INP OFF", false);
        }

        if st.mode != Some(mode_byte) {
            self.write_logged("eload", link, if cmd.mode == EloadMode::Res { "FUNC RES" } else { "FUNC CURR" }, false);
            st.mode = Some(mode_byte);
        }
        if st.short != Some(cmd.short) {
            self.write_logged("eload", link, if cmd.short { "INP:SHOR ON" } else { "INP:SHOR OFF" }, false);
            st.short = Some(cmd.short);
        }

        match cmd.mode {
            EloadMode::Curr => {
                if st.current_setting_ma != Some(cmd.current_ma) {
                    self.write_logged("eload", link, &format!("CURR {}", py_float(cmd.current_ma as f64 / 1000.0)), false);
                    st.current_setting_ma = Some(cmd.current_ma);
                }
                st.resistance_setting_mohm = Some(cmd.resistance_mohm);
            }
            EloadMode::Res => {
                if st.resistance_setting_mohm != Some(cmd.resistance_mohm) {
                    self.write_logged("eload", link, &format!("RES {}", py_float(cmd.resistance_mohm as f64 / 1000.0)), false);
                    st.resistance_setting_mohm = Some(cmd.resistance_mohm);
                }
                st.current_setting_ma = Some(cmd.current_ma);
            }
        }

        if enable_changed && cmd.enable {
            self.write_logged("eload", link, "INP ON", false);
        }
        if enable_changed {
            st.enabled = Some(cmd.enable);
        }
    }

    /// Toggles the AFG output. Some function-generator dialects (e.g. GW
    /// Instek AFG-2000/2100) take `OUTP1 ON|OFF` directly; others only
    /// accept `SOUR1:OUTP`. Try the former first and fall back on error.
    fn write_afg_output(&self, link: &mut crate::instruments::scpi::ScpiLink, enable: bool) {
        let state = if enable { "ON" } else { "OFF" };
        match link.write(&format!("OUTP1 {state}"), false) {
            Ok(()) => self.diag.mark_ok("afg"),
            Err(_) => self.write_logged("afg", link, &format!("SOUR1:OUTP {state}"), false),
        }
    }

    fn handle_afg_primary(&self, data: &[u8]) {
        let Some(cmd) = decode_afg_primary(data) else { return };
        let mut st = self.hw.afg.lock().unwrap();
        let Some(link) = st.link.as_mut() else { return };

        if st.output != Some(cmd.enable) {
            self.write_afg_output(link, cmd.enable);
            st.output = Some(cmd.enable);
        }
        let shape_byte = cmd.shape as u8;
        if st.shape != Some(shape_byte) {
            self.write_logged("afg", link, &format!("SOUR1:FUNC {}", cmd.shape.scpi_name()), false);
            st.shape = Some(shape_byte);
        }
        if st.freq_hz != Some(cmd.freq_hz) {
            self.write_logged("afg", link, &format!("SOUR1:FREQ {}", cmd.freq_hz), false);
            st.freq_hz = Some(cmd.freq_hz);
        }
        if st.ampl_mv != Some(cmd.ampl_mv) {
            self.write_logged("afg", link, &format!("SOUR1:AMPL {}", py_float(cmd.ampl_mv as f64 / 1000.0)), false);
            st.ampl_mv = Some(cmd.ampl_mv);
        }
    }

    /// Sets the AFG DC offset. GW Instek AFG-2000/2100 takes `SOUR1:DCO`
    /// directly; other dialects only accept `SOUR1:VOLT:OFFS`. Try the
    /// former first and fall back on error, mirroring `write_afg_output`.
    fn write_afg_offset(&self, link: &mut crate::instruments::scpi::ScpiLink, offset_v: f64) {
        let v = py_float(offset_v);
        match link.write(&format!("SOUR1:DCO {v}"), false) {
            Ok(()) => self.diag.mark_ok("afg"),
            Err(_) => self.write_logged("afg", link, &format!("SOUR1:VOLT:OFFS {v}"), false),
        }
    }

    fn handle_afg_ext(&self, data: &[u8]) {
        let Some(cmd) = decode_afg_ext(data) else { return };
        let mut st = self.hw.afg.lock().unwrap();
        let Some(link) = st.link.as_mut() else { return };

        if st.offset_mv != Some(cmd.offset_mv) {
            self.write_afg_offset(link, cmd.offset_mv as f64 / 1000.0);
            st.offset_mv = Some(cmd.offset_mv);
        }
        if st.duty_pct != Some(cmd.duty_pct) {
            self.write_logged("afg", link, &format!("SOUR1:SQU:DCYC {}", cmd.duty_pct), false);
            st.duty_pct = Some(cmd.duty_pct);
        }
        self.tx.update_afg_ext(st.offset_mv.unwrap_or(0), st.duty_pct.unwrap_or(0));
    }

    /// Sets the DMM's primary measurement function, probing SCPI dialect
    /// candidates in order and committing whichever one the instrument
    /// accepts cleanly. `Auto` tries FUNC-style first, then CONF-style
    /// (with `,@1` channel-qualifier variants); `Func`/`Conf` try only
    /// their own dialect. The first candidate whose error queue comes back
    /// clean wins and is recorded as the dialect for subsequent calls.
    fn mmeter_set_func(&self, st: &mut crate::hwstate::MmeterState, func: MmeterFunc) {
        let Some(link) = st.link.as_mut() else { return };

        let func_cmd = func_to_scpi_func(func).to_string();
        let conf_cmd = func_to_scpi_conf(func);

        let mut candidates: Vec<(ScpiStyle, String)> = Vec::new();
        match st.scpi_style {
            ScpiStyle::Auto => {
                candidates.push((ScpiStyle::Func, func_cmd));
                if let Some(conf) = conf_cmd {
                    candidates.extend(conf_candidates(conf).into_iter().map(|c| (ScpiStyle::Conf, c)));
                }
            }
            ScpiStyle::Func => candidates.push((ScpiStyle::Func, func_cmd)),
            ScpiStyle::Conf => {
                if let Some(conf) = conf_cmd {
                    candidates.extend(conf_candidates(conf).into_iter().map(|c| (ScpiStyle::Conf, c)));
                }
            }
        }

        if candidates.is_empty() {
            self.diag.error("mmeter", &format!("unsupported function {func:?} for current SCPI style"));
            return;
        }

        let mut committed = None;
        for (dialect, cmd) in &candidates {
            link.drain_errors(8);
            match link.write(cmd, true) {
                Ok(()) => self.diag.mark_ok("mmeter"),
                Err(e) => {
                    self.diag.mark_error("mmeter", &e);
                    continue;
                }
            }
            let bad = link.drain_errors(4);
            let clean = bad.is_empty() || bad.last().map(|e| is_no_error_line(e)).unwrap_or(true);
            if clean {
                committed = Some(*dialect);
                break;
            }
        }

        match committed {
            Some(dialect) => {
                st.func = func;
                if st.scpi_style == ScpiStyle::Auto {
                    st.scpi_style = dialect;
                }
            }
            None => {
                self.diag.error("mmeter", &format!("failed to set function {func:?}: no dialect accepted it"));
            }
        }
    }

    fn handle_mmeter_legacy(&self, data: &[u8]) {
        let Some(cmd) = decode_legacy(data) else { return };
        let mut st = self.hw.mmeter.lock().unwrap();

        if st.legacy_mode != Some(cmd.mode) {
            match cmd.mode {
                0 => self.mmeter_set_func(&mut st, MmeterFunc::Vdc),
                1 => self.mmeter_set_func(&mut st, MmeterFunc::Idc),
                _ => {}
            }
            st.legacy_mode = Some(cmd.mode);
        }

        if st.legacy_range != Some(cmd.range) {
            if cmd.range == 0 {
                let func = st.func;
                let style = st.scpi_style;
                if let Some(link) = st.link.as_mut() {
                    match style {
                        ScpiStyle::Func => {
                            if let Some(prefix) = func_range_prefix(func) {
                                self.write_logged("mmeter", link, &format!("{prefix}:RANGe:AUTO ON"), false);
                            }
                        }
                        _ => {
                            self.write_logged("mmeter", link, ":CONFigure:RANGe:AUTO 1", false);
                        }
                    }
                }
                st.autorange = true;
            } else {
                st.autorange = false;
            }
            st.legacy_range = Some(cmd.range);
        }
    }

    fn handle_mmeter_ext(&self, data: &[u8]) {
        let Some(cmd) = decode_mmeter_ext(data) else { return };
        let mut st = self.hw.mmeter.lock().unwrap();
        let target_func = target_function(cmd.arg0, st.func);
        let is_secondary = cmd.arg2 == 1;
        let style = st.scpi_style;

        match cmd.op {
            ExtOp::SetFunction => self.mmeter_set_func(&mut st, target_func),
            ExtOp::SetAutorange => {
                let on = cmd.arg1 != 0;
                match style {
                    ScpiStyle::Func => {
                        if let (Some(prefix), Some(link)) = (func_range_prefix(target_func), st.link.as_mut()) {
                            self.write_logged("mmeter", link, &format!("{prefix}:RANGe:AUTO {}", if on { "ON" } else { "OFF" }), false);
                        }
                    }
                    _ => {
                        let conf_no_value = if is_secondary { " ,@2" } else { "" };
                        if let Some(link) = st.link.as_mut() {
                            self.write_logged("mmeter", link, &format!(":CONFigure:RANGe:AUTO {}{conf_no_value}", if on { 1 } else { 0 }), false);
                        }
                    }
                }
                st.autorange = on;
            }
            ExtOp::SetRange => {
                if !cmd.value.is_finite() {
                    return;
                }
                match style {
                    ScpiStyle::Func => {
                        if let (Some(prefix), Some(link)) = (func_range_prefix(target_func), st.link.as_mut()) {
                            self.write_logged("mmeter", link, &format!("{prefix}:RANGe {}", cmd.value), false);
                        }
                    }
                    _ => {
                        let conf_no_value = if is_secondary { " ,@2" } else { "" };
                        let conf_with_value = if is_secondary { ",@2" } else { "" };
                        if let (Some(base), Some(link)) = (func_to_scpi_conf(target_func), st.link.as_mut()) {
                            self.write_logged("mmeter", link, &format!(":CONFigure:RANGe:AUTO 0{conf_no_value}"), false);
                            self.write_logged("mmeter", link, &format!("{base} {}{conf_with_value}", cmd.value), false);
                        }
                    }
                }
                st.autorange = false;
                st.range_value = Some(cmd.value as f64);
            }
            ExtOp::SetNplc => {
                let nplc = quantize_nplc(cmd.value.clamp(0.01, 100.0) as f64);
                match style {
                    ScpiStyle::Func => {
                        if let (Some(prefix), Some(link)) = (func_range_prefix(target_func), st.link.as_mut()) {
                            self.write_logged("mmeter", link, &format!("{prefix}:NPLCycles {nplc}"), false);
                        }
                    }
                    _ => {
                        let rate = if nplc <= 0.1 { "FAST" } else if nplc <= 1.0 { "MED" } else { "SLOW" };
                        if let Some(link) = st.link.as_mut() {
                            self.write_logged("mmeter", link, &format!(":CONFigure:DISPlay:RATE {rate}"), false);
                        }
                    }
                }
                st.nplc = Some(nplc);
            }
            ExtOp::SecondaryEnable => {
                let on = cmd.arg0 != 0;
                if matches!(style, ScpiStyle::Conf | ScpiStyle::Auto) {
                    if !on {
                        if let Some(link) = st.link.as_mut() {
                            self.write_logged("mmeter", link, ":CONFigure:OFFDual", false);
                        }
                        st.func2_enabled = false;
                    } else {
                        let func2 = st.func2;
                        if let (Some(base2), Some(link)) = (func_to_scpi_conf(func2), st.link.as_mut()) {
                            self.write_logged("mmeter", link, &format!("{base2} ,@2"), false);
                        }
                        st.func2_enabled = true;
                    }
                } else {
                    st.func2_enabled = on;
                }
            }
            ExtOp::SecondaryFunction => {
                if matches!(style, ScpiStyle::Conf | ScpiStyle::Auto) {
                    if let (Some(base), Some(link)) = (func_to_scpi_conf(target_func), st.link.as_mut()) {
                        self.write_logged("mmeter", link, &format!("{base} ,@2"), false);
                    }
                    st.func2_enabled = true;
                }
                st.func2 = target_func;
            }
            ExtOp::TrigSource => {
                if matches!(style, ScpiStyle::Func) {
                    let src = match cmd.arg0 {
                        1 => "BUS",
                        2 => "MAN",
                        _ => "IMM",
                    };
                    if let Some(link) = st.link.as_mut() {
                        self.write_logged("mmeter", link, &format!(":TRIGger:SOURce {src}"), false);
                    }
                }
                st.trig_source = Some(cmd.arg0);
            }
            ExtOp::BusTrigger => {
                if let Some(link) = st.link.as_mut() {
                    self.write_logged("mmeter", link, "*TRG", false);
                }
            }
            ExtOp::RelativeEnable => {
                let on = cmd.arg0 != 0;
                if matches!(style, ScpiStyle::Func) {
                    if let (Some(prefix), Some(link)) = (func_range_prefix(target_func), st.link.as_mut()) {
                        self.write_logged("mmeter", link, &format!("{prefix}:REFerence:STATe {}", if on { "ON" } else { "OFF" }), false);
                    }
                }
                st.rel_enabled = on;
            }
            ExtOp::RelativeAcquire => {
                if matches!(style, ScpiStyle::Func) {
                    if let (Some(prefix), Some(link)) = (func_range_prefix(target_func), st.link.as_mut()) {
                        self.write_logged("mmeter", link, &format!("{prefix}:REFerence:ACQuire"), false);
                    }
                }
            }
            ExtOp::Unknown(op) => {
                if op != 0 {
                    warn!(op, arg0 = cmd.arg0, arg1 = cmd.arg1, arg2 = cmd.arg2, "mmeter ext: unknown op");
                }
            }
        }
    }

    fn handle_mrsignal(&self, data: &[u8]) {
        let Some(cmd) = decode_mrsignal(data) else { return };
        let mut st = self.hw.mrsignal.lock().unwrap();
        let Some(client) = st.client.as_mut() else { return };

        let clamped = clamp_mrsignal(cmd.output_select, cmd.value, self.mrsignal_max_v, self.mrsignal_max_ma);

        if st.enabled == Some(cmd.enable) && st.output_select == Some(cmd.output_select) && st.value == Some(clamped) {
            return;
        }
        match client.set_output(cmd.enable, cmd.output_select, clamped) {
            Ok(()) => {
                st.enabled = Some(cmd.enable);
                st.output_select = Some(cmd.output_select);
                st.value = Some(clamped);
                self.diag.mark_ok("mrsignal");
            }
            Err(e) => self.diag.mark_error("mrsignal", &e),
        }
    }
}

/// Builds the CONF-style candidate list for a single target command: the
/// `,@1` channel-qualified form (when the base command looks like a
/// primary-selectable VOLT/CURR/FREQ function and doesn't already carry a
/// channel), the bare base form, and both again with a leading `:`.
/// Duplicates (e.g. when no `,@1` variant applies) are dropped, preserving
/// order so the most-specific form is tried first.
fn conf_candidates(conf_cmd: &str) -> Vec<String> {
    let base = conf_cmd.trim().to_string();
    let with_ch = if !base.contains('@') && (base.contains(":VOLT") || base.contains(":CURR") || base.contains(":FREQ")) {
        format!("{base},@1")
    } else {
        base.clone()
    };

    let mut out = vec![with_ch.clone()];
    if with_ch != base {
        out.push(base.clone());
    }
    out.push(format!(":{with_ch}"));
    if with_ch != base {
        out.push(format!(":{base}"));
    }

    let mut seen = std::collections::HashSet::new();
    out.retain(|c| seen.insert(c.clone()));
    out
}

/// Renders a value the way Python's `str(float)`/f-string formatting would:
/// whole numbers keep a trailing `.0` (`1.0`, `2.0`) instead of Rust's
/// default `Display` which drops it. SCPI setpoints in this gateway are
/// derived from the original Python driver's `f"{cmd} {val}"` writes, so the
/// wire text must match byte-for-byte.
fn py_float(v: f64) -> String {
    format!("{v:?}")
}

fn is_no_error_line(line: &str) -> bool {
    let u = line.trim().to_ascii_uppercase();
    u.is_empty() || u.starts_with('0') || u.contains("NO ERROR")
}

/// Clamps an MrSignal output value to the configured safety ceiling for its
/// selected register (mA/V channels have separate limits).
fn clamp_mrsignal(output_select: u8, value: f32, max_v: f64, max_ma: f64) -> f32 {
    let limit = match output_select {
        1 | 4 => max_v,
        _ => max_ma,
    };
    (value as f64).clamp(-limit, limit) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::instruments::relay::MockRelay;
    use crate::instruments::scpi::ScpiLink;
    use crate::instruments::ScpiTransport;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingTransport {
        written: Arc<Mutex<Vec<String>>>,
    }

    impl ScpiTransport for RecordingTransport {
        fn write_line(&mut self, line: &str) -> GwResult<()> {
            self.written.lock().unwrap().push(line.to_string());
            Ok(())
        }
        fn read_line(&mut self) -> GwResult<String> {
            Ok(String::new())
        }
        fn reset_input(&mut self) -> GwResult<()> {
            Ok(())
        }
    }

    use crate::error::GwResult;

    fn test_hw_with_eload_link() -> (HardwareState, Arc<Mutex<Vec<String>>>) {
        let cfg = Config::for_test();
        let hw = HardwareState::new(&cfg, Box::new(MockRelay::default()));
        let transport = RecordingTransport::default();
        let written = transport.written.clone();
        hw.eload.lock().unwrap().link = Some(ScpiLink::new(Box::new(transport)));
        (hw, written)
    }

    #[test]
    fn eload_turn_on_sequence_enables_in_curr_mode() {
        let cfg = Config::for_test();
        let (hw, written) = test_hw_with_eload_link();
        hw.apply_idle_all();
        written.lock().unwrap().clear();

        let tx = OutgoingTxState::new();
        let diag = Diagnostics::new(16, 0.1);
        let proc = DeviceCommandProcessor::new(&hw, &tx, &diag, &cfg);
        proc.handle(crate::ids::LOAD_CTRL, &[0x04, 0x00, 0xE8, 0x03, 0x00, 0x00]);

        let w = written.lock().unwrap();
        assert_eq!(*w, vec!["FUNC CURR".to_string(), "CURR 1.0".to_string(), "INP ON".to_string()]);
    }

    #[test]
    fn eload_mode_change_to_res_with_short_reorders_writes() {
        let cfg = Config::for_test();
        let (hw, written) = test_hw_with_eload_link();
        hw.apply_idle_all();

        let tx = OutgoingTxState::new();
        let diag = Diagnostics::new(16, 0.1);
        let proc = DeviceCommandProcessor::new(&hw, &tx, &diag, &cfg);
        proc.handle(crate::ids::LOAD_CTRL, &[0x04, 0x00, 0xE8, 0x03, 0x00, 0x00]);
        written.lock().unwrap().clear();

        proc.handle(crate::ids::LOAD_CTRL, &[0x50, 0x00, 0x00, 0x00, 0xD0, 0x07]);

        let w = written.lock().unwrap();
        assert_eq!(
            *w,
            vec!["INP OFF".to_string(), "FUNC RES".to_string(), "INP:SHOR ON".to_string(), "RES 2.0".to_string()]
        );
    }

    #[test]
    fn afg_primary_ramp_command_writes_outp1_first() {
        let cfg = Config::for_test();
        let hw = HardwareState::new(&cfg, Box::new(MockRelay::default()));
        let transport = RecordingTransport::default();
        let written = transport.written.clone();
        hw.afg.lock().unwrap().link = Some(ScpiLink::new(Box::new(transport)));

        let tx = OutgoingTxState::new();
        let diag = Diagnostics::new(16, 0.1);
        let proc = DeviceCommandProcessor::new(&hw, &tx, &diag, &cfg);
        // enable=1, shape=2 (RAMP), freq=100 Hz, ampl=2000 mVpp
        proc.handle(crate::ids::AFG_CTRL, &[0x01, 0x02, 0x64, 0x00, 0x00, 0x00, 0xD0, 0x07]);

        let w = written.lock().unwrap();
        assert_eq!(
            *w,
            vec!["OUTP1 ON".to_string(), "SOUR1:FUNC RAMP".to_string(), "SOUR1:FREQ 100".to_string(), "SOUR1:AMPL 2.0".to_string()]
        );
    }

    #[test]
    fn afg_output_falls_back_to_sour1_outp_when_outp1_errors() {
        #[derive(Default)]
        struct FailOutp1Transport {
            written: Arc<Mutex<Vec<String>>>,
        }
        impl ScpiTransport for FailOutp1Transport {
            fn write_line(&mut self, line: &str) -> GwResult<()> {
                if line.starts_with("OUTP1") {
                    return Err(crate::error::GwError::Protocol("unsupported command".into()));
                }
                self.written.lock().unwrap().push(line.to_string());
                Ok(())
            }
            fn read_line(&mut self) -> GwResult<String> {
                Ok(String::new())
            }
            fn reset_input(&mut self) -> GwResult<()> {
                Ok(())
            }
        }

        let cfg = Config::for_test();
        let hw = HardwareState::new(&cfg, Box::new(MockRelay::default()));
        let transport = FailOutp1Transport::default();
        let written = transport.written.clone();
        hw.afg.lock().unwrap().link = Some(ScpiLink::new(Box::new(transport)));

        let tx = OutgoingTxState::new();
        let diag = Diagnostics::new(16, 0.1);
        let proc = DeviceCommandProcessor::new(&hw, &tx, &diag, &cfg);
        proc.handle(crate::ids::AFG_CTRL, &[0x01, 0x00, 0x64, 0x00, 0x00, 0x00, 0xD0, 0x07]);

        let w = written.lock().unwrap();
        assert_eq!(w[0], "SOUR1:OUTP ON");
    }

    #[test]
    fn afg_ext_writes_sour1_dco_first_for_offset() {
        let cfg = Config::for_test();
        let hw = HardwareState::new(&cfg, Box::new(MockRelay::default()));
        let transport = RecordingTransport::default();
        let written = transport.written.clone();
        hw.afg.lock().unwrap().link = Some(ScpiLink::new(Box::new(transport)));

        let tx = OutgoingTxState::new();
        let diag = Diagnostics::new(16, 0.1);
        let proc = DeviceCommandProcessor::new(&hw, &tx, &diag, &cfg);
        // offset=2000 mV, duty=50%
        proc.handle(crate::ids::AFG_CTRL_EXT, &[0xD0, 0x07, 0x32]);

        let w = written.lock().unwrap();
        assert_eq!(*w, vec!["SOUR1:DCO 2.0".to_string(), "SOUR1:SQU:DCYC 50".to_string()]);
    }

    #[test]
    fn afg_offset_falls_back_to_sour1_volt_offs_when_dco_errors() {
        #[derive(Default)]
        struct FailDcoTransport {
            written: Arc<Mutex<Vec<String>>>,
        }
        impl ScpiTransport for FailDcoTransport {
            fn write_line(&mut self, line: &str) -> GwResult<()> {
                if line.starts_with("SOUR1:DCO") {
                    return Err(crate::error::GwError::Protocol("unsupported command".into()));
                }
                self.written.lock().unwrap().push(line.to_string());
                Ok(())
            }
            fn read_line(&mut self) -> GwResult<String> {
                Ok(String::new())
            }
            fn reset_input(&mut self) -> GwResult<()> {
                Ok(())
            }
        }

        let cfg = Config::for_test();
        let hw = HardwareState::new(&cfg, Box::new(MockRelay::default()));
        let transport = FailDcoTransport::default();
        let written = transport.written.clone();
        hw.afg.lock().unwrap().link = Some(ScpiLink::new(Box::new(transport)));

        let tx = OutgoingTxState::new();
        let diag = Diagnostics::new(16, 0.1);
        let proc = DeviceCommandProcessor::new(&hw, &tx, &diag, &cfg);
        proc.handle(crate::ids::AFG_CTRL_EXT, &[0xD0, 0x07, 0x32]);

        let w = written.lock().unwrap();
        assert_eq!(w[0], "SOUR1:VOLT:OFFS 2.0");
    }

    #[derive(Default)]
    struct DialectTransport {
        written: Arc<Mutex<Vec<String>>>,
        reject_prefix: Option<String>,
        pending_error: bool,
    }

    impl ScpiTransport for DialectTransport {
        fn write_line(&mut self, line: &str) -> GwResult<()> {
            if let Some(prefix) = &self.reject_prefix {
                if line.starts_with(prefix.as_str()) {
                    self.pending_error = true;
                }
            }
            self.written.lock().unwrap().push(line.to_string());
            Ok(())
        }
        fn read_line(&mut self) -> GwResult<String> {
            if self.pending_error {
                self.pending_error = false;
                return Ok("-113,Undefined header".to_string());
            }
            Ok(String::new())
        }
        fn reset_input(&mut self) -> GwResult<()> {
            Ok(())
        }
    }

    #[test]
    fn mmeter_set_func_auto_commits_func_dialect_on_first_clean_write() {
        let cfg = Config::for_test();
        let hw = HardwareState::new(&cfg, Box::new(MockRelay::default()));
        let transport = DialectTransport::default();
        let written = transport.written.clone();
        hw.mmeter.lock().unwrap().link = Some(ScpiLink::new(Box::new(transport)));

        let tx = OutgoingTxState::new();
        let diag = Diagnostics::new(16, 0.1);
        let proc = DeviceCommandProcessor::new(&hw, &tx, &diag, &cfg);
        let mut st = hw.mmeter.lock().unwrap();
        assert_eq!(st.scpi_style, ScpiStyle::Auto);
        proc.mmeter_set_func(&mut st, MmeterFunc::Vdc);

        assert_eq!(st.scpi_style, ScpiStyle::Func);
        assert_eq!(st.func, MmeterFunc::Vdc);
        assert!(written.lock().unwrap().contains(&":FUNCtion VOLTage:DC".to_string()));
        assert!(!written.lock().unwrap().iter().any(|l| l.starts_with("CONF:")));
    }

    #[test]
    fn mmeter_set_func_auto_falls_back_to_conf_when_func_rejected() {
        let cfg = Config::for_test();
        let hw = HardwareState::new(&cfg, Box::new(MockRelay::default()));
        let transport = DialectTransport { reject_prefix: Some(":FUNCtion".to_string()), ..Default::default() };
        let written = transport.written.clone();
        hw.mmeter.lock().unwrap().link = Some(ScpiLink::new(Box::new(transport)));

        let tx = OutgoingTxState::new();
        let diag = Diagnostics::new(16, 0.1);
        let proc = DeviceCommandProcessor::new(&hw, &tx, &diag, &cfg);
        let mut st = hw.mmeter.lock().unwrap();
        proc.mmeter_set_func(&mut st, MmeterFunc::Vdc);

        assert_eq!(st.scpi_style, ScpiStyle::Conf);
        assert_eq!(st.func, MmeterFunc::Vdc);
        let w = written.lock().unwrap();
        let func_idx = w.iter().position(|l| l == ":FUNCtion VOLTage:DC").unwrap();
        let conf_idx = w.iter().position(|l| l == "CONF:VOLT:DC,@1").unwrap();
        assert!(func_idx < conf_idx, "FUNC-style must be tried before CONF-style in auto mode");
    }

    #[test]
    fn clamp_limits_by_output_select() {
        assert_eq!(clamp_mrsignal(0, 100.0, 24.0, 20.0), 20.0);
        assert_eq!(clamp_mrsignal(1, 100.0, 24.0, 20.0), 24.0);
        assert_eq!(clamp_mrsignal(0, -100.0, 24.0, 20.0), -20.0);
    }
}
