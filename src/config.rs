//! Immutable process configuration, built once at startup from environment
//! variables. Everywhere else in the crate consumes this struct rather than
//! reading the environment directly.

use std::env;
use std::time::Duration;

use crate::error::{GwError, GwResult};

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => parse_bool(&v).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn env_int(key: &str, default: i64) -> i64 {
    match env::var(key) {
        Ok(v) => parse_int(&v).unwrap_or(default),
        Err(_) => default,
    }
}

/// Accepts decimal or `0x`-prefixed hex, matching the original `int(s, 0)`
/// convenience used throughout the upstream config module.
fn parse_int(s: &str) -> Option<i64> {
    let t = s.trim();
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        t.parse::<i64>().ok()
    }
}

fn env_float(key: &str, default: f64) -> f64 {
    match env::var(key) {
        Ok(v) => v.trim().parse::<f64>().unwrap_or(default),
        Err(_) => default,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFilterMode {
    None,
    Control,
    ControlPat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanInterfaceKind {
    SocketCan,
    RmCanView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayBackend {
    Serial,
    Mock,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScpiStyle {
    Auto,
    Func,
    Conf,
}

#[derive(Debug, Clone)]
pub struct Config {
    // CAN backend
    pub can_interface: CanInterfaceKind,
    pub can_channel: String,
    pub can_bitrate: u32,
    pub can_setup: bool,
    pub can_serial_baud: u32,
    pub can_rx_kernel_filter_mode: KernelFilterMode,
    pub can_cmd_queue_max: usize,

    // TX scheduler periods (ms); 0 disables the task
    pub tx_period_meter_ms: u64,
    pub tx_period_meter_ext_ms: u64,
    pub tx_period_meter_status_ms: u64,
    pub tx_period_eload_ms: u64,
    pub tx_period_afg_ext_ms: u64,
    pub tx_period_mrsignal_status_ms: u64,
    pub tx_period_mrsignal_input_ms: u64,
    pub tx_send_on_change: bool,
    pub tx_send_on_change_min_ms: u64,

    // Bus load estimator
    pub bus_load_enable: bool,
    pub bus_load_window_sec: f64,
    pub bus_load_ema_alpha: f64,

    // Watchdog
    pub control_timeout_sec: f64,
    pub watchdog_grace_sec: f64,
    pub k1_timeout_sec: f64,
    pub eload_timeout_sec: f64,
    pub afg_timeout_sec: f64,
    pub mmeter_timeout_sec: f64,
    pub mrsignal_timeout_sec: f64,
    pub apply_idle_on_startup: bool,

    // Relay (K1)
    pub k1_backend: RelayBackend,
    pub k1_serial_port: Option<String>,
    pub k1_serial_baud: u32,
    pub k1_invert: bool,
    pub k1_idle_drive: bool,
    pub k1_on_byte: u8,
    pub k1_off_byte: u8,
    pub k1_boot_settle_sec: f64,

    // E-load / AFG (VISA-style identifiers; resolved by the instrument layer)
    pub eload_visa_id: String,
    pub eload_timeout_ms: u64,
    pub afg_visa_id: String,
    pub afg_timeout_ms: u64,

    // Multimeter
    pub mmeter_path: String,
    pub mmeter_baud: u32,
    pub mmeter_scpi_style: ScpiStyle,
    pub mmeter_legacy_range_enable: bool,
    pub mmeter_control_settle_sec: f64,
    pub mmeter_debug: bool,

    // MrSignal
    pub mrsignal_port: String,
    pub mrsignal_slave_id: u8,
    pub mrsignal_baud: u32,
    pub mrsignal_parity: char,
    pub mrsignal_stopbits: u8,
    pub mrsignal_timeout_sec_io: f64,
    pub mrsignal_float_byteorder: Option<String>,
    pub mrsignal_float_byteorder_auto: bool,
    pub mrsignal_max_v: f64,
    pub mrsignal_max_ma: f64,

    // Poller
    pub meas_poll_period_ms: u64,
    pub status_poll_period_ms: u64,

    // Diagnostics
    pub diag_max_events: usize,
    pub diag_dedupe_window_sec: f64,

    // HTTP snapshot server
    pub http_enable: bool,
    pub http_bind_addr: String,

    pub build_tag: String,
}

impl Config {
    pub fn from_env() -> GwResult<Self> {
        let can_interface = match env_str("CAN_INTERFACE", "socketcan").to_ascii_lowercase().as_str() {
            "socketcan" => CanInterfaceKind::SocketCan,
            "rmcanview" => CanInterfaceKind::RmCanView,
            other => {
                return Err(GwError::Config(format!("unknown CAN_INTERFACE '{other}'")));
            }
        };

        let k1_backend = match env_str("K1_BACKEND", "mock").to_ascii_lowercase().as_str() {
            "serial" => RelayBackend::Serial,
            "mock" => RelayBackend::Mock,
            "disabled" => RelayBackend::Disabled,
            other => return Err(GwError::Config(format!("unknown K1_BACKEND '{other}'"))),
        };

        let mmeter_scpi_style = match env_str("MMETER_SCPI_STYLE", "auto").to_ascii_lowercase().as_str() {
            "auto" => ScpiStyle::Auto,
            "func" => ScpiStyle::Func,
            "conf" => ScpiStyle::Conf,
            other => return Err(GwError::Config(format!("unknown MMETER_SCPI_STYLE '{other}'"))),
        };

        let can_rx_kernel_filter_mode = match env_str("CAN_RX_KERNEL_FILTER_MODE", "control").to_ascii_lowercase().as_str() {
            "none" => KernelFilterMode::None,
            "control" => KernelFilterMode::Control,
            "control+pat" => KernelFilterMode::ControlPat,
            other => return Err(GwError::Config(format!("unknown CAN_RX_KERNEL_FILTER_MODE '{other}'"))),
        };

        let mrsignal_parity = env_str("MRSIGNAL_PARITY", "N")
            .chars()
            .next()
            .unwrap_or('N')
            .to_ascii_uppercase();

        Ok(Config {
            can_interface,
            can_channel: env_str("CAN_CHANNEL", "can0"),
            can_bitrate: env_int("CAN_BITRATE", 250_000) as u32,
            can_setup: env_bool("CAN_SETUP", true),
            can_serial_baud: env_int("CAN_SERIAL_BAUD", 115_200) as u32,
            can_rx_kernel_filter_mode,
            can_cmd_queue_max: env_int("CAN_CMD_QUEUE_MAX", 256).max(1) as usize,

            tx_period_meter_ms: env_int("CAN_TX_PERIOD_METER_MS", 50) as u64,
            tx_period_meter_ext_ms: env_int("CAN_TX_PERIOD_METER_EXT_MS", 50) as u64,
            tx_period_meter_status_ms: env_int("CAN_TX_PERIOD_METER_STATUS_MS", 200) as u64,
            tx_period_eload_ms: env_int("CAN_TX_PERIOD_ELOAD_MS", 50) as u64,
            tx_period_afg_ext_ms: env_int("CAN_TX_PERIOD_AFG_EXT_MS", 50) as u64,
            tx_period_mrsignal_status_ms: env_int("CAN_TX_PERIOD_MRSIGNAL_STATUS_MS", 100) as u64,
            tx_period_mrsignal_input_ms: env_int("CAN_TX_PERIOD_MRSIGNAL_INPUT_MS", 100) as u64,
            tx_send_on_change: env_bool("CAN_TX_SEND_ON_CHANGE", false),
            tx_send_on_change_min_ms: env_int("CAN_TX_SEND_ON_CHANGE_MIN_MS", 20) as u64,

            bus_load_enable: env_bool("CAN_BUS_LOAD_ENABLE", true),
            bus_load_window_sec: env_float("CAN_BUS_LOAD_WINDOW_SEC", 1.0),
            bus_load_ema_alpha: env_float("CAN_BUS_LOAD_EMA_ALPHA", 0.2),

            control_timeout_sec: env_float("CONTROL_TIMEOUT_SEC", 2.0),
            watchdog_grace_sec: env_float("WATCHDOG_GRACE_SEC", 0.5),
            k1_timeout_sec: env_float("K1_TIMEOUT_SEC", 2.0),
            eload_timeout_sec: env_float("ELOAD_TIMEOUT_SEC", 2.0),
            afg_timeout_sec: env_float("AFG_TIMEOUT_SEC", 2.0),
            mmeter_timeout_sec: env_float("MMETER_TIMEOUT_SEC", 2.0),
            mrsignal_timeout_sec: env_float("MRSIGNAL_TIMEOUT_SEC", 2.0),
            apply_idle_on_startup: env_bool("APPLY_IDLE_ON_STARTUP", true),

            k1_backend,
            k1_serial_port: env_opt_str("K1_SERIAL_PORT"),
            k1_serial_baud: env_int("K1_SERIAL_BAUD", 9600) as u32,
            k1_invert: env_bool("K1_INVERT", false),
            k1_idle_drive: env_bool("K1_IDLE_DRIVE", false),
            k1_on_byte: env_int("K1_ON_BYTE", 0x31) as u8,
            k1_off_byte: env_int("K1_OFF_BYTE", 0x30) as u8,
            k1_boot_settle_sec: env_float("K1_BOOT_SETTLE_SEC", 2.0),

            eload_visa_id: env_str("ELOAD_VISA_ID", "USB?*::*::INSTR"),
            eload_timeout_ms: env_int("ELOAD_TIMEOUT_MS", 1500) as u64,
            afg_visa_id: env_str("AFG_VISA_ID", "ASRL/dev/ttyUSB0::INSTR"),
            afg_timeout_ms: env_int("AFG_TIMEOUT_MS", 1500) as u64,

            mmeter_path: env_str("MMETER_PATH", "/dev/ttyUSB0"),
            mmeter_baud: env_int("MMETER_BAUD", 9600) as u32,
            mmeter_scpi_style,
            mmeter_legacy_range_enable: env_bool("MMETER_LEGACY_RANGE_ENABLE", false),
            mmeter_control_settle_sec: env_float("MMETER_CONTROL_SETTLE_SEC", 0.30),
            mmeter_debug: env_bool("MMETER_DEBUG", false),

            mrsignal_port: env_str("MRSIGNAL_PORT", "/dev/ttyUSB1"),
            mrsignal_slave_id: env_int("MRSIGNAL_SLAVE_ID", 1) as u8,
            mrsignal_baud: env_int("MRSIGNAL_BAUD", 9600) as u32,
            mrsignal_parity,
            mrsignal_stopbits: env_int("MRSIGNAL_STOPBITS", 1) as u8,
            mrsignal_timeout_sec_io: env_float("MRSIGNAL_TIMEOUT_SEC", 0.5),
            mrsignal_float_byteorder: env_opt_str("MRSIGNAL_FLOAT_BYTEORDER"),
            mrsignal_float_byteorder_auto: env_bool("MRSIGNAL_FLOAT_BYTEORDER_AUTO", false),
            mrsignal_max_v: env_float("MRSIGNAL_MAX_V", 24.0),
            mrsignal_max_ma: env_float("MRSIGNAL_MAX_MA", 24.0),

            meas_poll_period_ms: env_int("MEAS_POLL_PERIOD_MS", 250) as u64,
            status_poll_period_ms: env_int("STATUS_POLL_PERIOD_MS", 1000) as u64,

            diag_max_events: env_int("DIAG_MAX_EVENTS", 250).max(1) as usize,
            diag_dedupe_window_sec: env_float("DIAG_DEDUPE_WINDOW_SEC", 0.75),

            http_enable: env_bool("HTTP_ENABLE", true),
            http_bind_addr: env_str("HTTP_BIND_ADDR", "0.0.0.0:8080"),

            build_tag: env_str("BUILD_TAG", "dev"),
        })
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.control_timeout_sec.max(0.0))
    }

    /// Builds a config with every field at its documented default, for unit
    /// tests that need a `HardwareState`/`DeviceCommandProcessor` without
    /// touching the environment.
    #[cfg(test)]
    pub fn for_test() -> Self {
        Config {
            can_interface: CanInterfaceKind::SocketCan,
            can_channel: "can0".to_string(),
            can_bitrate: 250_000,
            can_setup: false,
            can_serial_baud: 115_200,
            can_rx_kernel_filter_mode: KernelFilterMode::Control,
            can_cmd_queue_max: 256,

            tx_period_meter_ms: 50,
            tx_period_meter_ext_ms: 50,
            tx_period_meter_status_ms: 200,
            tx_period_eload_ms: 50,
            tx_period_afg_ext_ms: 50,
            tx_period_mrsignal_status_ms: 100,
            tx_period_mrsignal_input_ms: 100,
            tx_send_on_change: false,
            tx_send_on_change_min_ms: 20,

            bus_load_enable: true,
            bus_load_window_sec: 1.0,
            bus_load_ema_alpha: 0.2,

            control_timeout_sec: 2.0,
            watchdog_grace_sec: 0.5,
            k1_timeout_sec: 2.0,
            eload_timeout_sec: 2.0,
            afg_timeout_sec: 2.0,
            mmeter_timeout_sec: 2.0,
            mrsignal_timeout_sec: 2.0,
            apply_idle_on_startup: false,

            k1_backend: RelayBackend::Mock,
            k1_serial_port: None,
            k1_serial_baud: 9600,
            k1_invert: false,
            k1_idle_drive: false,
            k1_on_byte: 0x31,
            k1_off_byte: 0x30,
            k1_boot_settle_sec: 0.0,

            eload_visa_id: "USB?*::*::INSTR".to_string(),
            eload_timeout_ms: 1500,
            afg_visa_id: "ASRL/dev/ttyUSB0::INSTR".to_string(),
            afg_timeout_ms: 1500,

            mmeter_path: "/dev/ttyUSB0".to_string(),
            mmeter_baud: 9600,
            mmeter_scpi_style: ScpiStyle::Auto,
            mmeter_legacy_range_enable: false,
            mmeter_control_settle_sec: 0.30,
            mmeter_debug: false,

            mrsignal_port: "/dev/ttyUSB1".to_string(),
            mrsignal_slave_id: 1,
            mrsignal_baud: 9600,
            mrsignal_parity: 'N',
            mrsignal_stopbits: 1,
            mrsignal_timeout_sec_io: 0.5,
            mrsignal_float_byteorder: None,
            mrsignal_float_byteorder_auto: false,
            mrsignal_max_v: 24.0,
            mrsignal_max_ma: 24.0,

            meas_poll_period_ms: 250,
            status_poll_period_ms: 1000,

            diag_max_events: 250,
            diag_dedupe_window_sec: 0.75,

            http_enable: false,
            http_bind_addr: "0.0.0.0:8080".to_string(),

            build_tag: "test".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_decimal_ints() {
        assert_eq!(parse_int("250000"), Some(250_000));
        assert_eq!(parse_int("0x3e8"), Some(1000));
        assert_eq!(parse_int("0X3E8"), Some(1000));
        assert_eq!(parse_int("nope"), None);
    }

    #[test]
    fn parses_bool_variants() {
        for s in ["1", "true", "YES", "y", "On"] {
            assert_eq!(parse_bool(s), Some(true), "{s}");
        }
        for s in ["0", "false", "NO", "n", "Off"] {
            assert_eq!(parse_bool(s), Some(false), "{s}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }
}
