//! `OutgoingTxState`: thread-safe container of Option-typed readback values.
//!
//! Grounded on `original_source/can_comm.py::OutgoingTxState`. Writers are
//! the poller and the device command processor; the reader is the TX
//! scheduler. "Absent" (`None`) is distinct from "zero".

use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MrSignalStatusVal {
    pub on: bool,
    pub mode: u8,
    pub value: f32,
}

#[derive(Default)]
struct Inner {
    meter_current_ma: Option<u16>,
    meter_primary: Option<f32>,
    meter_secondary: Option<f32>,
    meter_func: Option<u8>,
    meter_flags: Option<u8>,
    load_volts_mv: Option<u16>,
    load_current_ma: Option<u16>,
    afg_offset_mv: Option<i16>,
    afg_duty_pct: Option<u8>,
    mrs_status: Option<MrSignalStatusVal>,
    mrs_input: Option<f32>,
}

#[derive(Default)]
pub struct OutgoingTxState {
    inner: Mutex<Inner>,
}

/// Snapshot of all readback-eligible values at one instant.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TxSnapshot {
    pub meter_current_ma: Option<u16>,
    pub meter_primary: Option<f32>,
    pub meter_secondary: Option<f32>,
    pub meter_func: Option<u8>,
    pub meter_flags: Option<u8>,
    pub load_volts_mv: Option<u16>,
    pub load_current_ma: Option<u16>,
    pub afg_offset_mv: Option<i16>,
    pub afg_duty_pct: Option<u8>,
    pub mrs_status: Option<MrSignalStatusVal>,
    pub mrs_input: Option<f32>,
}

impl OutgoingTxState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_meter_current(&self, ma: u16) {
        self.inner.lock().unwrap().meter_current_ma = Some(ma);
    }

    pub fn update_meter_ext(&self, primary: Option<f32>, secondary: Option<f32>) {
        let mut i = self.inner.lock().unwrap();
        i.meter_primary = primary;
        i.meter_secondary = secondary;
    }

    pub fn update_meter_status(&self, func: u8, flags: u8) {
        let mut i = self.inner.lock().unwrap();
        i.meter_func = Some(func);
        i.meter_flags = Some(flags);
    }

    pub fn update_eload(&self, volts_mv: u16, current_ma: u16) {
        let mut i = self.inner.lock().unwrap();
        i.load_volts_mv = Some(volts_mv);
        i.load_current_ma = Some(current_ma);
    }

    pub fn update_afg_ext(&self, offset_mv: i16, duty_pct: u8) {
        let mut i = self.inner.lock().unwrap();
        i.afg_offset_mv = Some(offset_mv);
        i.afg_duty_pct = Some(duty_pct);
    }

    pub fn update_mrsignal_status(&self, on: bool, mode: u8, value: f32) {
        self.inner.lock().unwrap().mrs_status = Some(MrSignalStatusVal { on, mode, value });
    }

    pub fn update_mrsignal_input(&self, value: f32) {
        self.inner.lock().unwrap().mrs_input = Some(value);
    }

    pub fn snapshot(&self) -> TxSnapshot {
        let i = self.inner.lock().unwrap();
        TxSnapshot {
            meter_current_ma: i.meter_current_ma,
            meter_primary: i.meter_primary,
            meter_secondary: i.meter_secondary,
            meter_func: i.meter_func,
            meter_flags: i.meter_flags,
            load_volts_mv: i.load_volts_mv,
            load_current_ma: i.load_current_ma,
            afg_offset_mv: i.afg_offset_mv,
            afg_duty_pct: i.afg_duty_pct,
            mrs_status: i.mrs_status,
            mrs_input: i.mrs_input,
        }
    }
}
