//! Minimal read-only JSON snapshot server: a single endpoint
//! dumping outgoing TX state, bus load, watchdog states, and diagnostics
//! health/events, served with `tiny_http` to match the pack's lightweight
//! bridging-daemon HTTP surfaces rather than a full web framework.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tiny_http::{Response, Server};
use tracing::{error, info};

use crate::can::bus_load::BusLoadMeter;
use crate::diagnostics::Diagnostics;
use crate::txstate::{OutgoingTxState, TxSnapshot};
use crate::watchdog::Watchdog;

#[derive(Serialize)]
struct Snapshot {
    build_tag: String,
    tx: TxSnapshot,
    bus_load_pct: Option<f64>,
    rx_fps: Option<f64>,
    tx_fps: Option<f64>,
    health: std::collections::HashMap<String, crate::diagnostics::HealthSnapshot>,
    recent_events: Vec<crate::diagnostics::DiagEvent>,
    watchdog: std::collections::HashMap<String, crate::watchdog::WatchdogState>,
}

pub fn run(
    bind_addr: String,
    build_tag: String,
    tx_state: Arc<OutgoingTxState>,
    bus_load: Arc<BusLoadMeter>,
    diag: Arc<Diagnostics>,
    watchdog: Arc<Watchdog>,
    stop: Arc<AtomicBool>,
) {
    let server = match Server::http(&bind_addr) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, "failed to bind HTTP snapshot server");
            return;
        }
    };
    info!(addr = %bind_addr, "HTTP snapshot server listening");

    while !stop.load(Ordering::Relaxed) {
        let request = match server.recv_timeout(Duration::from_millis(500)) {
            Ok(Some(r)) => r,
            Ok(None) => continue,
            Err(_) => continue,
        };

        let load = bus_load.snapshot();
        let snapshot = Snapshot {
            build_tag: build_tag.clone(),
            tx: tx_state.snapshot(),
            bus_load_pct: load.load_pct,
            rx_fps: load.rx_fps,
            tx_fps: load.tx_fps,
            health: diag.health_snapshot(),
            recent_events: diag.events_snapshot(),
            watchdog: watchdog.snapshot(),
        };

        let body = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
        let response = Response::from_string(body)
            .with_header(tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap());
        let _ = request.respond(response);
    }
}
