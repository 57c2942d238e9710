use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use crate::dispatch::{
    CompletionMatcher, DispatchOutcome, DispatchSettings, Dispatcher, WriteBack,
};
use crate::executor::JobExecutor;
use crate::handlers::HandlerTable;
use crate::listeners::{ListenerId, ResponseListener, ResponseListenerRegistry};
use crate::logging::{LogLevel, Logger};
use crate::registry::{Channel, ConnectionId, ConnectionRegistry, ConnectionState};
use crate::server::ConnectionEvents;
use crate::store::{FileStore, JobStore};
use crate::wire::codec::WireCodec;

/// Shared collaborators every handler sees.
pub struct MasterContext {
    pub registry: Arc<ConnectionRegistry>,
    pub jobs: Arc<dyn JobStore>,
    pub files: Arc<dyn FileStore>,
    pub executor: Arc<dyn JobExecutor>,
    pub logger: Arc<Logger>,
}

/// Entry point the transport drives: connect, message, disconnect.
pub struct MasterHandler {
    context: Arc<MasterContext>,
    dispatcher: Dispatcher,
    listeners: Arc<ResponseListenerRegistry>,
    notify_listeners: Arc<AtomicBool>,
    matcher: Mutex<Option<CompletionMatcher>>,
}

impl MasterHandler {
    pub fn start(
        context: MasterContext,
        handlers: HandlerTable,
        codec: WireCodec,
        settings: DispatchSettings,
    ) -> io::Result<Self> {
        let context = Arc::new(context);
        let listeners = Arc::new(ResponseListenerRegistry::new());
        let notify_listeners = Arc::new(AtomicBool::new(false));

        let (dispatcher, completions) =
            Dispatcher::new(Arc::clone(&context), Arc::new(handlers), codec, settings)?;
        let matcher = CompletionMatcher::start(
            completions,
            WriteBack {
                registry: Arc::clone(&context.registry),
                listeners: Arc::clone(&listeners),
                notify_listeners: Arc::clone(&notify_listeners),
                codec,
                logger: Arc::clone(&context.logger),
            },
            settings.completion_poll,
        )?;

        context.logger.log(
            LogLevel::Info,
            Some("master"),
            "Master handler started",
            Some(json!({
                "worker_threads": settings.worker_threads,
                "queue_capacity": settings.queue_capacity,
                "backpressure": settings.backpressure.as_str(),
                "completion_poll_ms": settings.completion_poll.as_millis() as u64,
            })),
        );

        Ok(Self {
            context,
            dispatcher,
            listeners,
            notify_listeners,
            matcher: Mutex::new(Some(matcher)),
        })
    }

    /// Calls registered listeners after each successful write-back.
    pub fn with_listener_notifications(self, enabled: bool) -> Self {
        self.notify_listeners.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn context(&self) -> &Arc<MasterContext> {
        &self.context
    }

    pub fn on_connect(&self, channel: Arc<dyn Channel>) -> Arc<ConnectionState> {
        let (state, replaced) = self.context.registry.register(channel);
        if replaced.is_some() {
            self.context.logger.log(
                LogLevel::Warn,
                Some("master::connect"),
                "Connection registered twice; stale state replaced",
                Some(json!({ "connection_id": state.id() })),
            );
        }
        self.context.logger.log(
            LogLevel::Info,
            Some("master::connect"),
            "Connection registered",
            Some(state.summary()),
        );
        state
    }

    pub fn on_disconnect(&self, connection_id: ConnectionId) {
        match self.context.registry.unregister(connection_id) {
            Some(state) => self.context.logger.log(
                LogLevel::Info,
                Some("master::connect"),
                "Connection unregistered",
                Some(state.summary()),
            ),
            None => self.context.logger.log(
                LogLevel::Debug,
                Some("master::connect"),
                "Disconnect for unknown connection",
                Some(json!({ "connection_id": connection_id })),
            ),
        }
    }

    pub fn on_message(&self, connection_id: ConnectionId, frame: &[u8]) -> DispatchOutcome {
        self.dispatcher.on_message(connection_id, frame)
    }

    pub fn add_listener(&self, listener: Arc<dyn ResponseListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Finishes in-flight commands, delivers their results and stops the
    /// consumer. Safe to call more than once.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        if let Some(mut matcher) = self.matcher.lock().take() {
            matcher.stop();
            self.context
                .logger
                .info(Some("master"), "Completion matcher drained and stopped");
        }
    }
}

impl ConnectionEvents for MasterHandler {
    fn on_connect(&self, channel: Arc<dyn Channel>) {
        MasterHandler::on_connect(self, channel);
    }

    fn on_message(&self, connection_id: ConnectionId, frame: &[u8]) {
        MasterHandler::on_message(self, connection_id, frame);
    }

    fn on_disconnect(&self, connection_id: ConnectionId) {
        MasterHandler::on_disconnect(self, connection_id);
    }
}

impl Drop for MasterHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::dispatch::{DispatchOutcome, DispatchSettings};
    use crate::domain::{JobDefinition, JobStatus};
    use crate::executor::testing::FakeExecutor;
    use crate::handlers::testing::context_with;
    use crate::handlers::{CommandHandler, HandlerFailure, HandlerTable};
    use crate::registry::testing::RecordingChannel;
    use crate::registry::Channel;
    use crate::wire::codec::WireCodec;
    use crate::wire::message::{
        payload_str, string_value, CommandMessage, CommandOperate, CommandResult, ControlMessage,
        ControlOperate, FailureCode, PayloadMap,
    };

    use super::{MasterContext, MasterHandler};

    const WAIT: Duration = Duration::from_secs(3);

    /// Echoes `n` after sleeping `delay_ms`. Panics on `panic`, errors on `fail`.
    struct EchoHandler;

    impl CommandHandler for EchoHandler {
        fn handle(
            &self,
            _context: &MasterContext,
            command: &CommandMessage,
        ) -> Result<CommandResult, HandlerFailure> {
            if payload_str(&command.payload, "panic").is_some() {
                panic!("echo handler asked to panic");
            }
            if payload_str(&command.payload, "fail").is_some() {
                return Err(HandlerFailure::Internal("asked to fail".to_owned()));
            }
            let delay = command
                .payload
                .get("delay_ms")
                .and_then(rmpv::Value::as_u64)
                .unwrap_or(0);
            std::thread::sleep(Duration::from_millis(delay));
            let mut payload = PayloadMap::new();
            if let Some(value) = command.payload.get("n") {
                payload.insert("n".to_owned(), value.clone());
            }
            Ok(CommandResult::ok(command, payload))
        }
    }

    fn master(executor: FakeExecutor, handlers: HandlerTable) -> MasterHandler {
        let context = context_with(Arc::new(executor));
        let settings = DispatchSettings {
            worker_threads: 8,
            queue_capacity: 256,
            completion_poll: Duration::from_millis(20),
            ..DispatchSettings::default()
        };
        MasterHandler::start(context, handlers, WireCodec::default(), settings)
            .expect("master should start")
    }

    fn echo_master() -> MasterHandler {
        master(
            FakeExecutor::new(),
            HandlerTable::builder()
                .with(CommandOperate::UpdateJob, Arc::new(EchoHandler))
                .build(),
        )
    }

    fn frame(operate: CommandOperate, rid: &str, payload: PayloadMap) -> Vec<u8> {
        CommandMessage::new(operate, rid, payload)
            .to_frame(&WireCodec::default())
            .expect("command should encode")
    }

    fn echo_frame(rid: &str, entries: &[(&str, rmpv::Value)]) -> Vec<u8> {
        let payload = entries
            .iter()
            .map(|(key, value)| ((*key).to_owned(), value.clone()))
            .collect();
        frame(CommandOperate::UpdateJob, rid, payload)
    }

    fn job_frame(operate: CommandOperate, rid: &str, job_id: &str) -> Vec<u8> {
        let mut payload = PayloadMap::new();
        payload.insert("job_id".to_owned(), string_value(job_id));
        frame(operate, rid, payload)
    }

    #[test]
    fn concurrent_commands_on_one_connection_get_their_own_results() {
        let master = echo_master();
        let channel = Arc::new(RecordingChannel::new(1));
        master.on_connect(channel.clone());

        for n in 0..20_u64 {
            let outcome = master.on_message(
                1,
                &echo_frame(
                    &format!("rid-{n}"),
                    &[
                        ("n", rmpv::Value::from(n)),
                        ("delay_ms", rmpv::Value::from((20 - n) % 7)),
                    ],
                ),
            );
            assert!(matches!(outcome, DispatchOutcome::Submitted));
        }

        let results = channel.wait_for_results(20, WAIT);
        assert_eq!(results.len(), 20);
        let mut seen: Vec<u64> = results
            .iter()
            .map(|result| {
                let n = result
                    .payload
                    .get("n")
                    .and_then(rmpv::Value::as_u64)
                    .expect("result should echo n");
                assert_eq!(result.request_id, format!("rid-{n}"));
                n
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        master.shutdown();
    }

    #[test]
    fn heartbeat_marks_worker_without_response() {
        let master = echo_master();
        let channel = Arc::new(RecordingChannel::new(1));
        let state = master.on_connect(channel.clone());

        let heartbeat = ControlMessage::new(ControlOperate::HeartBeat, "hb", PayloadMap::new())
            .to_frame(&WireCodec::default())
            .expect("heartbeat should encode");
        assert!(matches!(
            master.on_message(1, &heartbeat),
            DispatchOutcome::Heartbeat
        ));
        master.shutdown();

        assert!(state.is_worker());
        assert!(channel.frames().is_empty());
    }

    #[test]
    fn bad_messages_do_not_disturb_later_ones() {
        let master = echo_master();
        let first = Arc::new(RecordingChannel::new(1));
        let second = Arc::new(RecordingChannel::new(2));
        master.on_connect(first.clone());
        master.on_connect(second.clone());

        assert!(matches!(
            master.on_message(1, &[0, 0, 0, 1, 0xc1]),
            DispatchOutcome::Dropped(_)
        ));
        assert!(matches!(
            master.on_message(1, &job_frame(CommandOperate::CancelJob, "no-handler", "J1")),
            DispatchOutcome::Dropped(_)
        ));
        master.on_message(1, &echo_frame("after-1", &[]));
        master.on_message(2, &echo_frame("after-2", &[]));

        assert_eq!(first.wait_for_results(1, WAIT)[0].request_id, "after-1");
        assert_eq!(second.wait_for_results(1, WAIT)[0].request_id, "after-2");
        master.shutdown();
    }

    #[test]
    fn handler_faults_produce_no_response_and_spare_others() {
        let master = echo_master();
        let channel = Arc::new(RecordingChannel::new(1));
        master.on_connect(channel.clone());

        master.on_message(1, &echo_frame("boom", &[("panic", string_value("yes"))]));
        master.on_message(1, &echo_frame("fail", &[("fail", string_value("yes"))]));
        master.on_message(1, &echo_frame("fine", &[("delay_ms", rmpv::Value::from(30))]));
        master.shutdown();

        let results = channel.frames();
        assert_eq!(results.len(), 1);
        assert_eq!(channel.wait_for_results(1, WAIT)[0].request_id, "fine");
    }

    #[test]
    fn closed_connection_does_not_stop_delivery_to_others() {
        let master = echo_master();
        let leaving = Arc::new(RecordingChannel::new(1));
        let staying = Arc::new(RecordingChannel::new(2));
        master.on_connect(leaving.clone());
        master.on_connect(staying.clone());

        master.on_message(1, &echo_frame("slow", &[("delay_ms", rmpv::Value::from(150))]));
        leaving.close();
        master.on_disconnect(1);
        std::thread::sleep(Duration::from_millis(250));

        master.on_message(2, &echo_frame("later", &[]));
        let results = staying.wait_for_results(1, WAIT);
        assert_eq!(results[0].request_id, "later");
        assert!(leaving.frames().is_empty());
        master.shutdown();
    }

    #[test]
    fn cancel_job_reports_not_found_then_cancels_running_job() {
        let master = master(FakeExecutor::new(), HandlerTable::standard());
        let channel = Arc::new(RecordingChannel::new(1));
        master.on_connect(channel.clone());

        master.on_message(1, &job_frame(CommandOperate::CancelJob, "c1", "J1"));
        let results = channel.wait_for_results(1, WAIT);
        assert_eq!(results[0].failure_code(), Some(FailureCode::NotFound));

        master
            .context()
            .jobs
            .put(JobDefinition::new("J1", "etl", "ops").with_status(JobStatus::Running))
            .expect("put should work");
        master.on_message(1, &job_frame(CommandOperate::CancelJob, "c2", "J1"));
        let results = channel.wait_for_results(2, WAIT);
        assert_eq!(results[1].request_id, "c2");
        assert!(results[1].is_ok());

        let stored = master
            .context()
            .jobs
            .get("J1")
            .expect("get should work")
            .expect("job should exist");
        assert_eq!(stored.status, JobStatus::Cancelled);
        master.shutdown();
    }

    #[test]
    fn fast_job_result_overtakes_slow_job_result() {
        let executor = FakeExecutor::new()
            .with_delay("A", Duration::from_millis(500))
            .with_delay("B", Duration::from_millis(10));
        let master = master(executor, HandlerTable::standard());
        for job_id in ["A", "B"] {
            master
                .context()
                .jobs
                .put(JobDefinition::new(job_id, "etl", "ops"))
                .expect("put should work");
        }
        let channel = Arc::new(RecordingChannel::new(1));
        master.on_connect(channel.clone());

        master.on_message(1, &job_frame(CommandOperate::ExecuteJob, "run-a", "A"));
        master.on_message(1, &job_frame(CommandOperate::ExecuteJob, "run-b", "B"));

        let results = channel.wait_for_results(2, WAIT);
        let order: Vec<&str> = results
            .iter()
            .map(|result| payload_str(&result.payload, "job_id").unwrap_or_default())
            .collect();
        assert_eq!(order, vec!["B", "A"]);
        master.shutdown();
    }

    #[test]
    fn listeners_fire_only_after_opt_in() {
        let master = echo_master().with_listener_notifications(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = master.add_listener(Arc::new(move |_: u64, _: &CommandResult| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let channel = Arc::new(RecordingChannel::new(1));
        master.on_connect(channel.clone());

        master.on_message(1, &echo_frame("one", &[]));
        master.shutdown();

        assert_eq!(channel.frames().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(master.remove_listener(id));
        assert!(!master.remove_listener(id));
    }

    #[test]
    fn connect_and_disconnect_are_symmetric() {
        let master = echo_master();
        let channel: Arc<dyn Channel> = Arc::new(RecordingChannel::new(5));

        master.on_connect(channel.clone());
        master.on_connect(channel);
        assert_eq!(master.context().registry.count(), 1);

        master.on_disconnect(5);
        master.on_disconnect(5);
        assert_eq!(master.context().registry.count(), 0);
        master.shutdown();
    }
}
