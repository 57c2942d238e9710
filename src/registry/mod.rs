use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};

pub type ConnectionId = u64;

/// Write side of a live connection as seen by the master. The transport owns
/// the socket; the registry only keeps a handle for write-back.
pub trait Channel: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn peer(&self) -> String;

    /// Writes one complete frame. Frames from different threads never interleave.
    fn write_frame(&self, frame: &[u8]) -> io::Result<()>;

    fn close(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionRole {
    Unknown,
    Worker,
}

/// Last load report a worker sent with its heartbeat.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub host: Option<String>,
    pub mem_rate_bp: Option<i64>,
    pub cpu_load_bp: Option<i64>,
    pub running: Vec<String>,
    pub debug_running: Vec<String>,
    pub manual_running: Vec<String>,
    pub reported_at_ms: Option<i64>,
}

impl WorkerReport {
    pub fn active_jobs(&self) -> usize {
        self.running.len() + self.debug_running.len() + self.manual_running.len()
    }
}

#[derive(Debug)]
struct Liveness {
    role: ConnectionRole,
    last_heartbeat_at: Option<DateTime<Utc>>,
    heartbeat_count: u64,
    report: WorkerReport,
}

pub struct ConnectionState {
    channel: Arc<dyn Channel>,
    registered_at: DateTime<Utc>,
    liveness: Mutex<Liveness>,
    // Runs pushed since the worker's last heartbeat; folded into its load.
    pending_dispatches: AtomicU64,
}

impl ConnectionState {
    fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            registered_at: Utc::now(),
            liveness: Mutex::new(Liveness {
                role: ConnectionRole::Unknown,
                last_heartbeat_at: None,
                heartbeat_count: 0,
                report: WorkerReport::default(),
            }),
            pending_dispatches: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.channel.id()
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn record_heartbeat(&self, at: DateTime<Utc>, report: WorkerReport) {
        let mut liveness = self.liveness.lock();
        liveness.role = ConnectionRole::Worker;
        liveness.last_heartbeat_at = Some(at);
        liveness.heartbeat_count += 1;
        liveness.report = report;
        self.pending_dispatches.store(0, Ordering::SeqCst);
    }

    pub fn role(&self) -> ConnectionRole {
        self.liveness.lock().role
    }

    pub fn is_worker(&self) -> bool {
        self.role() == ConnectionRole::Worker
    }

    pub fn last_heartbeat_at(&self) -> Option<DateTime<Utc>> {
        self.liveness.lock().last_heartbeat_at
    }

    pub fn report(&self) -> WorkerReport {
        self.liveness.lock().report.clone()
    }

    pub fn note_dispatch(&self) {
        self.pending_dispatches.fetch_add(1, Ordering::SeqCst);
    }

    /// Jobs the worker reported plus runs pushed to it since that report.
    pub fn load(&self) -> u64 {
        let reported = self.liveness.lock().report.active_jobs() as u64;
        reported + self.pending_dispatches.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> Value {
        let liveness = self.liveness.lock();
        json!({
            "connection_id": self.id(),
            "peer": self.channel.peer(),
            "registered_at": self.registered_at.to_rfc3339(),
            "worker": liveness.role == ConnectionRole::Worker,
            "host": liveness.report.host,
            "last_heartbeat_at": liveness.last_heartbeat_at.map(|at| at.to_rfc3339()),
            "heartbeat_count": liveness.heartbeat_count,
            "active_jobs": liveness.report.active_jobs(),
        })
    }
}

/// Live connections keyed by connection id. Sharded, so lookups on the
/// write-back path never wait on a handler.
#[derive(Default)]
pub struct ConnectionRegistry {
    states: DashMap<ConnectionId, Arc<ConnectionState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `channel` and returns its fresh state together with the
    /// state it displaced, if the id was already present.
    pub fn register(
        &self,
        channel: Arc<dyn Channel>,
    ) -> (Arc<ConnectionState>, Option<Arc<ConnectionState>>) {
        let state = Arc::new(ConnectionState::new(channel));
        let replaced = self.states.insert(state.id(), Arc::clone(&state));
        (state, replaced)
    }

    pub fn lookup(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.states
            .get(&connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.states.remove(&connection_id).map(|(_, state)| state)
    }

    /// Removes the entry only if it still holds `state`.
    pub fn unregister_state(&self, state: &Arc<ConnectionState>) -> bool {
        self.states
            .remove_if(&state.id(), |_, current| Arc::ptr_eq(current, state))
            .is_some()
    }

    pub fn count(&self) -> usize {
        self.states.len()
    }

    pub fn snapshot(&self) -> Vec<Arc<ConnectionState>> {
        self.states
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn workers(&self) -> Vec<Arc<ConnectionState>> {
        self.snapshot()
            .into_iter()
            .filter(|state| state.is_worker())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    use parking_lot::{Condvar, Mutex};

    use crate::wire::codec::WireCodec;
    use crate::wire::message::CommandResult;

    use super::{Channel, ConnectionId};

    /// In-process channel capturing written frames.
    pub(crate) struct RecordingChannel {
        id: ConnectionId,
        frames: Mutex<Vec<Vec<u8>>>,
        written: Condvar,
        closed: AtomicBool,
    }

    impl RecordingChannel {
        pub(crate) fn new(id: ConnectionId) -> Self {
            Self {
                id,
                frames: Mutex::new(Vec::new()),
                written: Condvar::new(),
                closed: AtomicBool::new(false),
            }
        }

        pub(crate) fn frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().clone()
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        /// Blocks until at least `count` frames were written or `timeout` passes.
        pub(crate) fn wait_for_frames(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
            let deadline = Instant::now() + timeout;
            let mut frames = self.frames.lock();
            while frames.len() < count {
                if self.written.wait_until(&mut frames, deadline).timed_out() {
                    break;
                }
            }
            frames.clone()
        }

        pub(crate) fn wait_for_results(&self, count: usize, timeout: Duration) -> Vec<CommandResult> {
            let codec = WireCodec::default();
            self.wait_for_frames(count, timeout)
                .iter()
                .map(|frame| {
                    CommandResult::from_frame(&codec, frame).expect("written frame should be a result")
                })
                .collect()
        }
    }

    impl Channel for RecordingChannel {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn peer(&self) -> String {
            format!("test-peer-{}", self.id)
        }

        fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
            if self.is_closed() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
            }
            self.frames.lock().push(frame.to_vec());
            self.written.notify_all();
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
