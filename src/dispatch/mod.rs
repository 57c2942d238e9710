mod matcher;
mod pool;

use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde_json::json;

use crate::config::AppConfig;
use crate::handlers::{CommandHandler, HandlerTable};
use crate::heartbeat::HeartbeatHandler;
use crate::logging::LogLevel;
use crate::master::MasterContext;
use crate::registry::ConnectionId;
use crate::utils::timing::measure_execution;
use crate::wire::codec::WireCodec;
use crate::wire::envelope::EnvelopeKind;
use crate::wire::message::{
    CommandMessage, CommandOperate, CommandResult, ControlMessage, ControlOperate, FailureCode,
    PayloadMap,
};
use crate::wire::{decode_envelope, ProtocolError};

pub use matcher::{CompletionMatcher, WriteBack};
pub use pool::{PoolError, Task, TaskPool};

/// What to do with a command when the task queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Answer `BUSY` immediately.
    #[default]
    Reject,
    /// Never reject; the queue grows without bound.
    Queue,
}

impl BackpressurePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "queue" => Some(Self::Queue),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Queue => "queue",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DispatchSettings {
    pub worker_threads: usize,
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub completion_poll: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            worker_threads: 16,
            queue_capacity: 1024,
            backpressure: BackpressurePolicy::Reject,
            completion_poll: Duration::from_millis(100),
        }
    }
}

impl DispatchSettings {
    pub fn from_app_config(app_config: &AppConfig) -> Self {
        let dispatch = &app_config.dispatch;
        Self {
            worker_threads: dispatch.worker_threads,
            queue_capacity: dispatch.queue_capacity,
            backpressure: BackpressurePolicy::parse(&dispatch.backpressure).unwrap_or_default(),
            completion_poll: Duration::from_millis(dispatch.completion_poll_ms),
        }
    }
}

/// A finished handler result tagged with the connection that asked for it.
#[derive(Debug)]
pub struct Completion {
    pub connection_id: ConnectionId,
    pub result: CommandResult,
}

#[derive(Debug)]
pub enum DropReason {
    Protocol(ProtocolError),
    UnregisteredConnection,
    UnknownControlOperate { operate: i64 },
    UnknownCommandOperate { operate: i64 },
    NoHandler { operate: CommandOperate },
    ShuttingDown,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(source) => write!(f, "protocol error: {source}"),
            Self::UnregisteredConnection => write!(f, "connection is not registered"),
            Self::UnknownControlOperate { operate } => {
                write!(f, "unknown control operate {operate}")
            }
            Self::UnknownCommandOperate { operate } => {
                write!(f, "unknown command operate {operate}")
            }
            Self::NoHandler { operate } => write!(f, "no handler installed for {operate}"),
            Self::ShuttingDown => write!(f, "dispatcher is shutting down"),
        }
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Heartbeat,
    Submitted,
    Rejected,
    Dropped(DropReason),
}

/// Classifies inbound frames. Heartbeats run inline; commands are handed to
/// the task pool and their results go to the completion channel.
pub struct Dispatcher {
    context: Arc<MasterContext>,
    handlers: Arc<HandlerTable>,
    heartbeat: HeartbeatHandler,
    codec: WireCodec,
    backpressure: BackpressurePolicy,
    pool: TaskPool,
    completions: Sender<Completion>,
}

impl Dispatcher {
    pub fn new(
        context: Arc<MasterContext>,
        handlers: Arc<HandlerTable>,
        codec: WireCodec,
        settings: DispatchSettings,
    ) -> io::Result<(Self, Receiver<Completion>)> {
        let capacity = match settings.backpressure {
            BackpressurePolicy::Reject => Some(settings.queue_capacity.max(1)),
            BackpressurePolicy::Queue => None,
        };
        let pool = TaskPool::new("command-worker", settings.worker_threads, capacity)?;
        let (completions, receiver) = crossbeam_channel::unbounded();

        Ok((
            Self {
                context,
                handlers,
                heartbeat: HeartbeatHandler,
                codec,
                backpressure: settings.backpressure,
                pool,
                completions,
            },
            receiver,
        ))
    }

    /// Never fails: every problem with the frame is logged and reported as
    /// [`DispatchOutcome::Dropped`].
    pub fn on_message(&self, connection_id: ConnectionId, frame: &[u8]) -> DispatchOutcome {
        let outcome = self.classify(connection_id, frame);
        if let DispatchOutcome::Dropped(reason) = &outcome {
            self.context.logger.log(
                LogLevel::Warn,
                Some("dispatch"),
                "Dropping inbound message",
                Some(json!({
                    "connection_id": connection_id,
                    "frame_len": frame.len(),
                    "reason": reason.to_string(),
                })),
            );
        }
        outcome
    }

    /// Waits for queued and running units, then refuses new ones.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    fn classify(&self, connection_id: ConnectionId, frame: &[u8]) -> DispatchOutcome {
        let envelope = match decode_envelope(&self.codec, frame) {
            Ok(envelope) => envelope,
            Err(error) => return DispatchOutcome::Dropped(DropReason::Protocol(error)),
        };
        let Some(state) = self.context.registry.lookup(connection_id) else {
            return DispatchOutcome::Dropped(DropReason::UnregisteredConnection);
        };

        match envelope.kind {
            EnvelopeKind::Control => {
                let message = match ControlMessage::decode(&envelope.body) {
                    Ok(message) => message,
                    Err(error) => {
                        return DispatchOutcome::Dropped(DropReason::Protocol(ProtocolError::Body(
                            error,
                        )))
                    }
                };
                match message.known_operate() {
                    Some(ControlOperate::HeartBeat) => {
                        self.heartbeat.handle(&self.context, &state, &message);
                        DispatchOutcome::Heartbeat
                    }
                    None => DispatchOutcome::Dropped(DropReason::UnknownControlOperate {
                        operate: message.operate,
                    }),
                }
            }
            EnvelopeKind::Command => {
                let command = match CommandMessage::decode(&envelope.body) {
                    Ok(command) => command,
                    Err(error) => {
                        return DispatchOutcome::Dropped(DropReason::Protocol(ProtocolError::Body(
                            error,
                        )))
                    }
                };
                let Some(operate) = command.known_operate() else {
                    return DispatchOutcome::Dropped(DropReason::UnknownCommandOperate {
                        operate: command.operate,
                    });
                };
                let Some(handler) = self.handlers.get(operate) else {
                    return DispatchOutcome::Dropped(DropReason::NoHandler { operate });
                };
                self.submit(connection_id, operate, Arc::clone(handler), command)
            }
        }
    }

    fn submit(
        &self,
        connection_id: ConnectionId,
        operate: CommandOperate,
        handler: Arc<dyn CommandHandler>,
        command: CommandMessage,
    ) -> DispatchOutcome {
        let header = CommandMessage {
            operate: command.operate,
            request_id: command.request_id.clone(),
            payload: PayloadMap::new(),
        };
        let context = Arc::clone(&self.context);
        let completions = self.completions.clone();
        let unit: Task = Box::new(move || {
            run_unit(&context, handler.as_ref(), connection_id, operate, command, &completions)
        });

        match self.pool.submit(unit) {
            Ok(()) => DispatchOutcome::Submitted,
            Err(PoolError::Saturated { capacity }) => {
                self.context.logger.log(
                    LogLevel::Warn,
                    Some("dispatch"),
                    "Task queue full; rejecting command",
                    Some(json!({
                        "connection_id": connection_id,
                        "operate": operate.as_str(),
                        "rid": header.request_id,
                        "queue_capacity": capacity,
                        "policy": self.backpressure.as_str(),
                    })),
                );
                let busy = CommandResult::failure(
                    &header,
                    FailureCode::Busy,
                    "master is at capacity, retry later",
                );
                let _ = self.completions.send(Completion {
                    connection_id,
                    result: busy,
                });
                DispatchOutcome::Rejected
            }
            Err(PoolError::ShutDown) => DispatchOutcome::Dropped(DropReason::ShuttingDown),
        }
    }
}

fn run_unit(
    context: &MasterContext,
    handler: &dyn CommandHandler,
    connection_id: ConnectionId,
    operate: CommandOperate,
    command: CommandMessage,
    completions: &Sender<Completion>,
) {
    let task_name = format!("{operate} rid={}", command.request_id);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        measure_execution(&task_name, Some("dispatch::unit"), &context.logger, || {
            handler.handle(context, &command)
        })
    }));

    let failure = match outcome {
        Ok(Ok(result)) => {
            if completions.send(Completion { connection_id, result }).is_err() {
                context.logger.warn(
                    Some("dispatch::unit"),
                    "Completion channel closed; result discarded",
                );
            }
            return;
        }
        Ok(Err(failure)) => failure.to_string(),
        Err(panic_payload) => format!("handler panicked: {}", panic_message(&*panic_payload)),
    };

    context.logger.log(
        LogLevel::Error,
        Some("dispatch::unit"),
        "Command handler failed; no response will be sent",
        Some(json!({
            "connection_id": connection_id,
            "operate": operate.as_str(),
            "rid": command.request_id,
            "error": failure,
        })),
    );
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam_channel::bounded;

    use crate::handlers::testing::context;
    use crate::handlers::{CommandHandler, HandlerFailure, HandlerTable};
    use crate::master::MasterContext;
    use crate::registry::testing::RecordingChannel;
    use crate::wire::codec::WireCodec;
    use crate::wire::envelope::Envelope;
    use crate::wire::encode_envelope;
    use crate::wire::message::{
        CommandMessage, CommandOperate, CommandResult, ControlMessage, ControlOperate,
        FailureCode, PayloadMap,
    };

    use super::{BackpressurePolicy, DispatchOutcome, DispatchSettings, Dispatcher, DropReason};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    impl CommandHandler for CountingHandler {
        fn handle(
            &self,
            _context: &MasterContext,
            command: &CommandMessage,
        ) -> Result<CommandResult, HandlerFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CommandResult::ok(command, PayloadMap::new()))
        }
    }

    struct BlockingHandler {
        release: crossbeam_channel::Receiver<()>,
    }

    impl CommandHandler for BlockingHandler {
        fn handle(
            &self,
            _context: &MasterContext,
            command: &CommandMessage,
        ) -> Result<CommandResult, HandlerFailure> {
            let _ = self.release.recv_timeout(Duration::from_secs(2));
            Ok(CommandResult::ok(command, PayloadMap::new()))
        }
    }

    fn command_frame(operate: i64, rid: &str) -> Vec<u8> {
        let command = CommandMessage {
            operate,
            request_id: rid.to_owned(),
            payload: PayloadMap::new(),
        };
        command
            .to_frame(&WireCodec::default())
            .expect("command should encode")
    }

    fn heartbeat_frame() -> Vec<u8> {
        ControlMessage::new(ControlOperate::HeartBeat, "hb", PayloadMap::new())
            .to_frame(&WireCodec::default())
            .expect("heartbeat should encode")
    }

    fn counting_dispatcher(
        settings: DispatchSettings,
    ) -> (Dispatcher, crossbeam_channel::Receiver<super::Completion>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let table = HandlerTable::builder()
            .with(
                CommandOperate::CancelJob,
                Arc::new(CountingHandler {
                    calls: calls.clone(),
                }),
            )
            .build();
        let context = Arc::new(context());
        context.registry.register(Arc::new(RecordingChannel::new(1)));
        let (dispatcher, receiver) =
            Dispatcher::new(context, Arc::new(table), WireCodec::default(), settings)
                .expect("dispatcher should start");
        (dispatcher, receiver, calls)
    }

    #[test]
    fn parses_backpressure_policy() {
        assert_eq!(BackpressurePolicy::parse("Reject"), Some(BackpressurePolicy::Reject));
        assert_eq!(BackpressurePolicy::parse("queue"), Some(BackpressurePolicy::Queue));
        assert_eq!(BackpressurePolicy::parse("drop"), None);
    }

    #[test]
    fn heartbeat_runs_inline_without_handlers() {
        let (dispatcher, receiver, calls) = counting_dispatcher(DispatchSettings::default());

        let outcome = dispatcher.on_message(1, &heartbeat_frame());
        assert!(matches!(outcome, DispatchOutcome::Heartbeat));
        dispatcher.shutdown();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn malformed_and_unknown_messages_are_dropped() {
        let (dispatcher, receiver, calls) = counting_dispatcher(DispatchSettings::default());
        let codec = WireCodec::default();

        let garbage = dispatcher.on_message(1, &[0, 0, 0, 2, 0xc1, 0xc1]);
        assert!(matches!(garbage, DispatchOutcome::Dropped(DropReason::Protocol(_))));

        let mut bad_kind = Envelope::command(vec![0x80]).into_raw();
        bad_kind.insert("k".to_owned(), rmpv::Value::from(7));
        let frame = codec.encode_frame(&bad_kind).expect("raw should encode");
        assert!(matches!(
            dispatcher.on_message(1, &frame),
            DispatchOutcome::Dropped(DropReason::Protocol(_))
        ));

        let bad_body = encode_envelope(&codec, Envelope::command(vec![0x01]))
            .expect("envelope should encode");
        assert!(matches!(
            dispatcher.on_message(1, &bad_body),
            DispatchOutcome::Dropped(DropReason::Protocol(_))
        ));

        assert!(matches!(
            dispatcher.on_message(1, &command_frame(99, "x")),
            DispatchOutcome::Dropped(DropReason::UnknownCommandOperate { operate: 99 })
        ));
        assert!(matches!(
            dispatcher.on_message(1, &command_frame(CommandOperate::UpdateJob.code(), "y")),
            DispatchOutcome::Dropped(DropReason::NoHandler { .. })
        ));
        assert!(matches!(
            dispatcher.on_message(2, &heartbeat_frame()),
            DispatchOutcome::Dropped(DropReason::UnregisteredConnection)
        ));

        assert!(matches!(
            dispatcher.on_message(1, &command_frame(CommandOperate::CancelJob.code(), "ok")),
            DispatchOutcome::Submitted
        ));
        let completion = receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("valid command should still complete");
        assert_eq!(completion.result.request_id, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        dispatcher.shutdown();
    }

    #[test]
    fn full_queue_answers_busy_under_reject_policy() {
        let (release_tx, release_rx) = bounded::<()>(0);
        let table = HandlerTable::builder()
            .with(
                CommandOperate::ExecuteJob,
                Arc::new(BlockingHandler {
                    release: release_rx,
                }),
            )
            .build();
        let context = Arc::new(context());
        context.registry.register(Arc::new(RecordingChannel::new(1)));
        let settings = DispatchSettings {
            worker_threads: 1,
            queue_capacity: 1,
            backpressure: BackpressurePolicy::Reject,
            completion_poll: Duration::from_millis(20),
        };
        let (dispatcher, receiver) =
            Dispatcher::new(context, Arc::new(table), WireCodec::default(), settings)
                .expect("dispatcher should start");

        let frame = |rid: &str| command_frame(CommandOperate::ExecuteJob.code(), rid);
        let mut outcomes = Vec::new();
        for rid in ["a", "b", "c", "d"] {
            outcomes.push(dispatcher.on_message(1, &frame(rid)));
        }
        assert!(outcomes
            .iter()
            .any(|outcome| matches!(outcome, DispatchOutcome::Rejected)));

        let busy = receiver
            .recv_timeout(Duration::from_secs(1))
            .expect("busy result should be queued");
        assert_eq!(busy.result.failure_code(), Some(FailureCode::Busy));

        for _ in 0..4 {
            let _ = release_tx.send_timeout((), Duration::from_millis(200));
        }
        dispatcher.shutdown();
    }
}
