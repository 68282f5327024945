//! Lab-instrument gateway entry point: brings up the CAN transport and
//! instrument handles, then spawns the RX loop, TX scheduler, command
//! worker, poller, watchdog enforcer, and optional HTTP snapshot server.

mod can;
mod cmdqueue;
mod config;
mod devicecmd;
mod diagnostics;
mod error;
mod frames;
mod http;
mod hwstate;
mod ids;
mod instruments;
mod poller;
mod rx;
mod txsched;
mod txstate;
mod watchdog;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::can::backend::CanBackend;
use crate::can::bus_load::BusLoadMeter;
use crate::config::{CanInterfaceKind, Config};
use crate::diagnostics::Diagnostics;
use crate::hwstate::HardwareState;
use crate::instruments::modbus::MrSignalModbus;
use crate::instruments::relay;
use crate::instruments::scpi::{ScpiLink, SerialScpiTransport};
use crate::rx::PatCapture;
use crate::watchdog::Watchdog;

#[derive(Parser, Debug)]
#[command(name = "labgw", about = "CAN bus gateway for bench instruments")]
struct Cli {
    /// Skip `ip link set ... up type can ...` even if CAN_SETUP is enabled.
    #[arg(long)]
    no_can_setup: bool,
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let cfg = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    let diag = Arc::new(Diagnostics::new(cfg.diag_max_events, cfg.diag_dedupe_window_sec));

    let relay_driver = relay::open_backend(
        cfg.k1_backend,
        cfg.k1_serial_port.as_deref().unwrap_or(""),
        cfg.k1_serial_baud,
        cfg.k1_on_byte,
        cfg.k1_off_byte,
        Duration::from_secs_f64(cfg.k1_boot_settle_sec),
    );
    let hw = Arc::new(HardwareState::new(&cfg, relay_driver));

    init_instruments(&hw, &cfg, &diag);

    if cfg.apply_idle_on_startup {
        hw.apply_idle_all();
    }

    let do_can_setup = cfg.can_setup && !cli.no_can_setup;
    let backend: Box<dyn CanBackend> = match cfg.can_interface {
        CanInterfaceKind::SocketCan => {
            match can::socketcan_backend::SocketCanBackend::open(&cfg.can_channel, cfg.can_bitrate, do_can_setup) {
                Ok(b) => Box::new(b),
                Err(e) => {
                    error!(error = %e, "CAN init failed");
                    std::process::exit(2);
                }
            }
        }
        CanInterfaceKind::RmCanView => {
            match can::bcp::BcpBackend::open(&cfg.can_channel, cfg.can_serial_baud, cfg.can_bitrate, do_can_setup) {
                Ok(b) => Box::new(b),
                Err(e) => {
                    error!(error = %e, "CAN init failed");
                    std::process::exit(2);
                }
            }
        }
    };

    let mut backend = backend;
    push_down_rx_filters(&mut *backend, &cfg);

    let tx_state = Arc::new(crate::txstate::OutgoingTxState::new());
    let bus_load = Arc::new(BusLoadMeter::with_ema(cfg.can_bitrate, cfg.bus_load_window_sec, cfg.bus_load_enable, cfg.bus_load_ema_alpha));
    let pat = Arc::new(PatCapture::default());
    let watchdog = Arc::new(Watchdog::new(cfg.watchdog_grace_sec));
    let stop = Arc::new(AtomicBool::new(false));

    watchdog.register("k1", cfg.k1_timeout_sec);
    watchdog.register("eload", cfg.eload_timeout_sec);
    watchdog.register("afg", cfg.afg_timeout_sec);
    watchdog.register("mmeter", cfg.mmeter_timeout_sec);
    watchdog.register("mrsignal", cfg.mrsignal_timeout_sec);

    let cmd_queue = Arc::new(crate::cmdqueue::CmdQueue::new(cfg.can_cmd_queue_max));

    let backend_shared = Arc::new(std::sync::Mutex::new(backend));

    let rx_handle = {
        let cmd_queue = cmd_queue.clone();
        let watchdog = watchdog.clone();
        let bus_load = bus_load.clone();
        let pat = pat.clone();
        let stop = stop.clone();
        let backend_shared = backend_shared.clone();
        std::thread::Builder::new()
            .name("can-rx".to_string())
            .spawn(move || {
                let backend = take_backend_for_rx(&backend_shared);
                rx::run(backend, cmd_queue, watchdog, bus_load, pat, stop);
            })
            .expect("spawn can-rx thread")
    };

    let tx_handle = {
        let cfg = cfg.clone();
        let tx_state = tx_state.clone();
        let bus_load = bus_load.clone();
        let stop = stop.clone();
        let backend_shared = backend_shared.clone();
        std::thread::Builder::new()
            .name("can-tx".to_string())
            .spawn(move || {
                let sched = txsched::TxScheduler::build(&cfg);
                sched.run(backend_shared, tx_state, bus_load, stop);
            })
            .expect("spawn can-tx thread")
    };

    let worker_handle = {
        let hw = hw.clone();
        let tx_state = tx_state.clone();
        let diag = diag.clone();
        let cfg = cfg.clone();
        let watchdog = watchdog.clone();
        let stop = stop.clone();
        let cmd_queue = cmd_queue.clone();
        std::thread::Builder::new()
            .name("cmd-worker".to_string())
            .spawn(move || {
                worker::run(cmd_queue, hw, tx_state, diag, cfg, watchdog, stop, true);
            })
            .expect("spawn cmd-worker thread")
    };

    let poller_handle = {
        let hw = hw.clone();
        let tx_state = tx_state.clone();
        let diag = diag.clone();
        let cfg = cfg.clone();
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("poller".to_string())
            .spawn(move || {
                poller::run(hw, tx_state, diag, cfg, stop);
            })
            .expect("spawn poller thread")
    };

    let watchdog_handle = {
        let hw = hw.clone();
        let watchdog = watchdog.clone();
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    for t in watchdog.enforce(Instant::now()) {
                        warn!(key = %t.key, "watchdog timeout, applying idle");
                        hw.apply_idle_for_key(&t.key);
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            })
            .expect("spawn watchdog thread")
    };

    let http_handle = cfg.http_enable.then(|| {
        let bind_addr = cfg.http_bind_addr.clone();
        let build_tag = cfg.build_tag.clone();
        let tx_state = tx_state.clone();
        let bus_load = bus_load.clone();
        let diag = diag.clone();
        let watchdog = watchdog.clone();
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("http".to_string())
            .spawn(move || {
                http::run(bind_addr, build_tag, tx_state, bus_load, diag, watchdog, stop);
            })
            .expect("spawn http thread")
    });

    info!(build_tag = %cfg.build_tag, "labgw started");

    wait_for_shutdown_signal();
    info!("shutdown requested");
    stop.store(true, Ordering::Relaxed);

    let _ = rx_handle.join();
    let _ = tx_handle.join();
    let _ = worker_handle.join();
    let _ = poller_handle.join();
    let _ = watchdog_handle.join();
    if let Some(h) = http_handle {
        let _ = h.join();
    }
}

/// Pushes a kernel-side ID filter down into `backend` per
/// `CAN_RX_KERNEL_FILTER_MODE`, so the control-frame set (optionally unioned
/// with the PAT_Jx diagnostic IDs) is the only traffic the kernel hands up.
/// Failures are logged and otherwise ignored: the RX loop's own ID check
/// still filters correctly with no kernel filter in place at all.
fn push_down_rx_filters(backend: &mut dyn CanBackend, cfg: &Config) {
    use crate::can::backend::CanFilterSpec;
    use crate::config::KernelFilterMode;

    let ids: Vec<u32> = match cfg.can_rx_kernel_filter_mode {
        KernelFilterMode::None => return,
        KernelFilterMode::Control => ids::control_ids().to_vec(),
        KernelFilterMode::ControlPat => {
            let mut v = ids::control_ids().to_vec();
            v.extend((0..ids::PAT_J_COUNT).map(|i| ids::PAT_J_BASE + i * ids::PAT_J_STRIDE));
            v
        }
    };

    let filters: Vec<CanFilterSpec> =
        ids.into_iter().map(|can_id| CanFilterSpec { can_id, can_mask: 0x1FFF_FFFF }).collect();
    if let Err(e) = backend.set_filters(&filters) {
        warn!(error = %e, "failed to push down CAN RX kernel filters, continuing with software filtering");
    }
}

fn take_backend_for_rx(shared: &Arc<std::sync::Mutex<Box<dyn CanBackend>>>) -> Box<dyn CanBackend> {
    // The RX loop owns the backend for its blocking reads; the TX scheduler
    // only needs a brief lock per send, so RX takes ownership via a
    // swapped-in no-op placeholder rather than holding the shared mutex for
    // every recv() call.
    let mut guard = shared.lock().unwrap();
    std::mem::replace(&mut *guard, Box::new(NullBackend))
}

struct NullBackend;

impl CanBackend for NullBackend {
    fn send(&mut self, _frame: &can::backend::CanFrame) -> crate::error::GwResult<()> {
        Err(crate::error::GwError::Protocol("CAN backend unavailable".to_string()))
    }
    fn recv(&mut self, timeout: Duration) -> crate::error::GwResult<Option<can::backend::CanFrame>> {
        std::thread::sleep(timeout);
        Ok(None)
    }
    fn set_filters(&mut self, _filters: &[can::backend::CanFilterSpec]) -> crate::error::GwResult<()> {
        Ok(())
    }
    fn shutdown(&mut self) -> crate::error::GwResult<()> {
        Ok(())
    }
}

fn init_instruments(hw: &HardwareState, cfg: &Config, diag: &Diagnostics) {
    {
        let mut st = hw.eload.lock().unwrap();
        match SerialScpiTransport::open(&cfg.eload_visa_id, 115_200, Duration::from_millis(cfg.eload_timeout_ms)) {
            Ok(t) => st.link = Some(ScpiLink::new(Box::new(t))),
            Err(e) => diag.mark_error("eload", &e),
        }
    }
    {
        let mut st = hw.afg.lock().unwrap();
        match SerialScpiTransport::open(&cfg.afg_visa_id, 115_200, Duration::from_millis(cfg.afg_timeout_ms)) {
            Ok(t) => st.link = Some(ScpiLink::new(Box::new(t))),
            Err(e) => diag.mark_error("afg", &e),
        }
    }
    {
        let mut st = hw.mmeter.lock().unwrap();
        match SerialScpiTransport::open(&cfg.mmeter_path, cfg.mmeter_baud, cfg.control_timeout()) {
            Ok(t) => st.link = Some(ScpiLink::new(Box::new(t))),
            Err(e) => diag.mark_error("mmeter", &e),
        }
    }
    {
        let mut st = hw.mrsignal.lock().unwrap();
        let configured_order = cfg.mrsignal_float_byteorder.as_deref().and_then(crate::instruments::modbus::FloatOrder::parse);
        match MrSignalModbus::open(
            &cfg.mrsignal_port,
            cfg.mrsignal_baud,
            Duration::from_secs_f64(cfg.mrsignal_timeout_sec_io),
            cfg.mrsignal_slave_id,
            configured_order,
            cfg.mrsignal_float_byteorder_auto,
        ) {
            Ok(c) => st.client = Some(c),
            Err(e) => diag.mark_error("mrsignal", &e),
        }
    }
}

fn wait_for_shutdown_signal() {
    let (tx, rx) = std::sync::mpsc::channel();
    let _ = ctrlc_handler(move || {
        let _ = tx.send(());
    });
    let _ = rx.recv();
}

/// Installs a `SIGINT`/`SIGTERM` handler using a one-shot `libc` sigaction,
/// avoiding a dedicated signal-handling crate for a single best-effort hook.
fn ctrlc_handler(on_signal: impl Fn() + Send + 'static) -> Result<(), ()> {
    use std::sync::OnceLock;
    static HANDLER: OnceLock<Box<dyn Fn() + Send + Sync>> = OnceLock::new();
    let _ = HANDLER.set(Box::new(on_signal));

    extern "C" fn handle(_sig: libc::c_int) {
        if let Some(f) = HANDLER.get() {
            f();
        }
    }

    unsafe {
        libc::signal(libc::SIGINT, handle as usize);
        libc::signal(libc::SIGTERM, handle as usize);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::backend::{CanFilterSpec, CanFrame};
    use crate::config::KernelFilterMode;

    #[derive(Default)]
    struct CapturingBackend {
        filters: Vec<CanFilterSpec>,
    }

    impl CanBackend for CapturingBackend {
        fn send(&mut self, _frame: &CanFrame) -> crate::error::GwResult<()> {
            Ok(())
        }
        fn recv(&mut self, _timeout: Duration) -> crate::error::GwResult<Option<CanFrame>> {
            Ok(None)
        }
        fn set_filters(&mut self, filters: &[CanFilterSpec]) -> crate::error::GwResult<()> {
            self.filters = filters.to_vec();
            Ok(())
        }
        fn shutdown(&mut self) -> crate::error::GwResult<()> {
            Ok(())
        }
    }

    #[test]
    fn control_mode_filters_exactly_the_control_ids() {
        let mut cfg = Config::for_test();
        cfg.can_rx_kernel_filter_mode = KernelFilterMode::Control;
        let mut backend = CapturingBackend::default();
        push_down_rx_filters(&mut backend, &cfg);
        assert_eq!(backend.filters.len(), ids::control_ids().len());
        for f in &backend.filters {
            assert_eq!(f.can_mask, 0x1FFF_FFFF);
            assert!(ids::control_ids().contains(&f.can_id));
        }
    }

    #[test]
    fn control_pat_mode_adds_the_pat_ids() {
        let mut cfg = Config::for_test();
        cfg.can_rx_kernel_filter_mode = KernelFilterMode::ControlPat;
        let mut backend = CapturingBackend::default();
        push_down_rx_filters(&mut backend, &cfg);
        assert_eq!(backend.filters.len(), ids::control_ids().len() + ids::PAT_J_COUNT as usize);
    }

    #[test]
    fn none_mode_never_touches_the_backend() {
        let mut cfg = Config::for_test();
        cfg.can_rx_kernel_filter_mode = KernelFilterMode::None;
        let mut backend = CapturingBackend::default();
        push_down_rx_filters(&mut backend, &cfg);
        assert!(backend.filters.is_empty());
    }
}
