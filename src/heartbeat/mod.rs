use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};
use crate::master::MasterContext;
use crate::registry::{ConnectionId, ConnectionRegistry, ConnectionState, WorkerReport};
use crate::wire::message::{payload_i64, payload_str, payload_string_list, ControlMessage, PayloadMap};

const STOP_POLL_MS: u64 = 50;

/// Applies a worker keep-alive to its connection state. Runs inline on the
/// reader thread, so it only touches memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeartbeatHandler;

impl HeartbeatHandler {
    pub fn handle(&self, context: &MasterContext, state: &ConnectionState, message: &ControlMessage) {
        let report = report_from_payload(&message.payload);
        context.logger.log(
            LogLevel::Verbose,
            Some("heartbeat"),
            "Worker heartbeat received",
            Some(json!({
                "connection_id": state.id(),
                "host": report.host,
                "active_jobs": report.active_jobs(),
            })),
        );
        state.record_heartbeat(Utc::now(), report);
    }
}

/// Mistyped fields are ignored rather than rejecting the heartbeat.
pub fn report_from_payload(payload: &PayloadMap) -> WorkerReport {
    WorkerReport {
        host: payload_str(payload, "host").map(str::to_owned),
        mem_rate_bp: payload_i64(payload, "mem_rate_bp"),
        cpu_load_bp: payload_i64(payload, "cpu_load_bp"),
        running: payload_string_list(payload, "running"),
        debug_running: payload_string_list(payload, "debug_running"),
        manual_running: payload_string_list(payload, "manual_running"),
        reported_at_ms: payload_i64(payload, "ts"),
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SweeperConfig {
    pub sweep_interval_ms: u64,
    pub worker_timeout_ms: u64,
}

impl SweeperConfig {
    pub fn from_app_config(app_config: &AppConfig) -> Self {
        Self {
            sweep_interval_ms: app_config.heartbeat.sweep_interval_ms,
            worker_timeout_ms: app_config.heartbeat.worker_timeout_ms,
        }
    }
}

#[derive(Debug)]
pub enum SweeperError {
    AlreadyRunning,
    Spawn(std::io::Error),
    JoinFailed,
}

impl fmt::Display for SweeperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "liveness sweeper is already running"),
            Self::Spawn(source) => write!(f, "failed to spawn liveness sweeper thread: {source}"),
            Self::JoinFailed => write!(f, "liveness sweeper thread join failed"),
        }
    }
}

impl std::error::Error for SweeperError {}

/// Closes and unregisters worker connections that stopped heartbeating.
/// Connections that never sent a heartbeat are left to the transport.
pub fn sweep_stale_workers(
    registry: &ConnectionRegistry,
    logger: &Logger,
    worker_timeout: Duration,
    now: DateTime<Utc>,
) -> Vec<ConnectionId> {
    let Ok(timeout) = chrono::Duration::from_std(worker_timeout) else {
        return Vec::new();
    };

    let mut evicted = Vec::new();
    for state in registry.workers() {
        let Some(last_heartbeat_at) = state.last_heartbeat_at() else {
            continue;
        };
        if now - last_heartbeat_at <= timeout {
            continue;
        }

        logger.log(
            LogLevel::Warn,
            Some("heartbeat::sweeper"),
            "Worker heartbeat timed out; closing connection",
            Some(json!({
                "connection_id": state.id(),
                "peer": state.channel().peer(),
                "last_heartbeat_at": last_heartbeat_at.to_rfc3339(),
                "worker_timeout_ms": worker_timeout.as_millis() as u64,
            })),
        );
        state.channel().close();
        if registry.unregister_state(&state) {
            evicted.push(state.id());
        }
    }
    evicted
}

pub struct LivenessSweeper {
    pub initiated_at: DateTime<Utc>,
    config: SweeperConfig,
    registry: Arc<ConnectionRegistry>,
    logger: Arc<Logger>,
    stop_signal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl LivenessSweeper {
    pub fn new(registry: Arc<ConnectionRegistry>, logger: Arc<Logger>, config: SweeperConfig) -> Self {
        Self {
            initiated_at: Utc::now(),
            config,
            registry,
            logger,
            stop_signal: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn start(&mut self) -> Result<(), SweeperError> {
        if self.worker.is_some() {
            return Err(SweeperError::AlreadyRunning);
        }

        self.stop_signal.store(false, Ordering::SeqCst);
        let stop_signal = Arc::clone(&self.stop_signal);
        let registry = Arc::clone(&self.registry);
        let logger = Arc::clone(&self.logger);
        let interval = Duration::from_millis(self.config.sweep_interval_ms);
        let worker_timeout = Duration::from_millis(self.config.worker_timeout_ms);

        let handle = thread::Builder::new()
            .name("liveness-sweeper".to_owned())
            .spawn(move || {
                while !stop_signal.load(Ordering::SeqCst) {
                    sweep_stale_workers(&registry, &logger, worker_timeout, Utc::now());
                    sleep_unless_stopped(&stop_signal, interval);
                }
            })
            .map_err(SweeperError::Spawn)?;
        self.worker = Some(handle);

        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), SweeperError> {
        self.stop_signal.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| SweeperError::JoinFailed);
        }

        Ok(())
    }

    pub fn metadata_payload(&self) -> serde_json::Value {
        json!({
            "initiated_at": self.initiated_at.to_rfc3339(),
            "sweep_interval_ms": self.config.sweep_interval_ms,
            "worker_timeout_ms": self.config.worker_timeout_ms,
        })
    }
}

fn sleep_unless_stopped(stop_signal: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(STOP_POLL_MS);
    let mut slept = Duration::ZERO;
    while slept < total && !stop_signal.load(Ordering::SeqCst) {
        let chunk = step.min(total - slept);
        thread::sleep(chunk);
        slept += chunk;
    }
}

impl Drop for LivenessSweeper {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
