//! Shared hardware state: owned instrument handles plus the last-applied
//! values used for redundancy suppression (skip a SCPI/Modbus write if the
//! requested value already matches what was last sent).
//!
//! Grounded on `original_source/hardware.py::HardwareManager` and the
//! per-field redundancy checks scattered through
//! `original_source/device_comm.py::DeviceCommandProcessor.handle`.

use std::sync::Mutex;
use std::time::Instant;

use crate::config::{Config, ScpiStyle};
use crate::frames::dmm::MmeterFunc;
use crate::instruments::modbus::MrSignalModbus;
use crate::instruments::relay::RelayDriver;
use crate::instruments::scpi::ScpiLink;

pub struct AfgState {
    pub link: Option<ScpiLink>,
    pub output: Option<bool>,
    pub shape: Option<u8>,
    pub freq_hz: Option<u32>,
    pub ampl_mv: Option<u16>,
    pub offset_mv: Option<i16>,
    pub duty_pct: Option<u8>,
}

impl Default for AfgState {
    fn default() -> Self {
        AfgState { link: None, output: None, shape: None, freq_hz: None, ampl_mv: None, offset_mv: None, duty_pct: None }
    }
}

pub struct EloadState {
    pub link: Option<ScpiLink>,
    pub enabled: Option<bool>,
    pub mode: Option<u8>,
    pub short: Option<bool>,
    pub current_setting_ma: Option<u16>,
    pub resistance_setting_mohm: Option<u16>,
}

impl Default for EloadState {
    fn default() -> Self {
        EloadState { link: None, enabled: None, mode: None, short: None, current_setting_ma: None, resistance_setting_mohm: None }
    }
}

pub struct MmeterState {
    pub link: Option<ScpiLink>,
    pub scpi_style: ScpiStyle,
    pub legacy_mode: Option<u8>,
    pub legacy_range: Option<u8>,
    pub func: MmeterFunc,
    pub func2: MmeterFunc,
    pub func2_enabled: bool,
    pub autorange: bool,
    pub range_value: Option<f64>,
    pub nplc: Option<f64>,
    pub trig_source: Option<u8>,
    pub rel_enabled: bool,
    /// Monotonic deadline before which the poller should not query the
    /// instrument, to let a just-issued control write settle.
    pub quiet_until: Option<Instant>,
}

impl MmeterState {
    fn new(style: ScpiStyle) -> Self {
        MmeterState {
            link: None,
            scpi_style: style,
            legacy_mode: None,
            legacy_range: None,
            func: MmeterFunc::Vdc,
            func2: MmeterFunc::Vdc,
            func2_enabled: false,
            autorange: false,
            range_value: None,
            nplc: None,
            trig_source: None,
            rel_enabled: false,
            quiet_until: None,
        }
    }
}

#[derive(Default)]
pub struct MrSignalState {
    pub client: Option<MrSignalModbus>,
    pub enabled: Option<bool>,
    pub output_select: Option<u8>,
    pub value: Option<f32>,
}

/// Owns every per-device mutex and the shared config. Each instrument's
/// mutable state lives behind its own lock so one slow SCPI write never
/// blocks unrelated devices.
pub struct HardwareState {
    pub afg: Mutex<AfgState>,
    pub eload: Mutex<EloadState>,
    pub mmeter: Mutex<MmeterState>,
    pub mrsignal: Mutex<MrSignalState>,
    pub relay: Mutex<Box<dyn RelayDriver>>,
    pub k1_invert: bool,
    pub k1_idle_drive: bool,
}

impl HardwareState {
    pub fn new(cfg: &Config, relay: Box<dyn RelayDriver>) -> Self {
        HardwareState {
            afg: Mutex::new(AfgState::default()),
            eload: Mutex::new(EloadState::default()),
            mmeter: Mutex::new(MmeterState::new(cfg.mmeter_scpi_style)),
            mrsignal: Mutex::new(MrSignalState::default()),
            relay: Mutex::new(relay),
            k1_invert: cfg.k1_invert,
            k1_idle_drive: cfg.k1_idle_drive,
        }
    }

    pub fn set_k1_drive(&self, drive: bool) {
        let mut r = self.relay.lock().unwrap();
        if r.get_drive() != drive {
            let _ = r.set_drive(drive);
        }
    }

    /// Drives a single device to its safe idle state, per the watchdog's
    /// per-key idle action table. `mmeter` has no idle action
    /// (read-only measurement instrument).
    pub fn apply_idle_for_key(&self, key: &str) {
        match key {
            "k1" => self.set_k1_drive(self.k1_idle_drive),
            "eload" => {
                if let Ok(mut e) = self.eload.lock() {
                    if let Some(link) = e.link.as_mut() {
                        let _ = link.write("INP OFF", false);
                        let _ = link.write("INP:SHOR OFF", false);
                    }
                    e.enabled = Some(false);
                    e.short = Some(false);
                }
            }
            "afg" => {
                if let Ok(mut a) = self.afg.lock() {
                    if let Some(link) = a.link.as_mut() {
                        // GW Instek AFG-2000/2100 takes OUTP1; other dialects want SOUR1:OUTP.
                        if link.write("OUTP1 OFF", false).is_err() {
                            let _ = link.write("SOUR1:OUTP OFF", false);
                        }
                    }
                    a.output = Some(false);
                }
            }
            "mmeter" => {}
            "mrsignal" => {
                if let Ok(mut m) = self.mrsignal.lock() {
                    if let Some(client) = m.client.as_mut() {
                        let select = m.output_select.unwrap_or(0);
                        let _ = client.set_output(false, select, 0.0);
                    }
                    m.enabled = Some(false);
                }
            }
            "can" => {}
            _ => {}
        }
    }

    /// Best-effort idle transition for every device: relay to its
    /// configured idle level, e-load input/short off, AFG output off,
    /// MrSignal output off. Used at startup and on command-worker shutdown.
    pub fn apply_idle_all(&self) {
        self.apply_idle_for_key("k1");
        self.apply_idle_for_key("eload");
        self.apply_idle_for_key("afg");
        self.apply_idle_for_key("mrsignal");
    }
}
