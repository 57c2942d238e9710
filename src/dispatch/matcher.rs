use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde_json::json;

use crate::listeners::ResponseListenerRegistry;
use crate::logging::{LogLevel, Logger};
use crate::registry::ConnectionRegistry;
use crate::wire::codec::WireCodec;

use super::Completion;

/// What happened to one completed result.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    Written,
    ConnectionGone,
    EncodeFailed,
    WriteFailed,
}

/// Everything the consumer thread needs to route a completion.
pub struct WriteBack {
    pub registry: Arc<ConnectionRegistry>,
    pub listeners: Arc<ResponseListenerRegistry>,
    pub notify_listeners: Arc<AtomicBool>,
    pub codec: WireCodec,
    pub logger: Arc<Logger>,
}

impl WriteBack {
    /// Writes one result to its originating connection. Failures are logged
    /// and reported, never raised.
    pub fn deliver(&self, completion: Completion) -> Delivery {
        let Completion {
            connection_id,
            result,
        } = completion;

        let Some(state) = self.registry.lookup(connection_id) else {
            self.logger.log(
                LogLevel::Warn,
                Some("dispatch::matcher"),
                "Dropping result for a connection that is no longer registered",
                Some(json!({
                    "connection_id": connection_id,
                    "operate": result.operate,
                    "rid": result.request_id,
                })),
            );
            return Delivery::ConnectionGone;
        };

        let frame = match result.to_frame(&self.codec) {
            Ok(frame) => frame,
            Err(error) => {
                self.logger.log(
                    LogLevel::Error,
                    Some("dispatch::matcher"),
                    "Failed to encode command result",
                    Some(json!({
                        "connection_id": connection_id,
                        "rid": result.request_id,
                        "error": error.to_string(),
                    })),
                );
                return Delivery::EncodeFailed;
            }
        };

        if let Err(error) = state.channel().write_frame(&frame) {
            self.logger.log(
                LogLevel::Warn,
                Some("dispatch::matcher"),
                "Failed to write command result back to connection",
                Some(json!({
                    "connection_id": connection_id,
                    "rid": result.request_id,
                    "error": error.to_string(),
                })),
            );
            return Delivery::WriteFailed;
        }

        self.logger.log(
            LogLevel::Debug,
            Some("dispatch::matcher"),
            "Command result written back",
            Some(json!({
                "connection_id": connection_id,
                "operate": result.operate,
                "rid": result.request_id,
                "ok": result.is_ok(),
            })),
        );
        if self.notify_listeners.load(Ordering::SeqCst) {
            let registered = self.listeners.len();
            let completed = self.listeners.notify(connection_id, &result);
            if completed < registered {
                self.logger.log(
                    LogLevel::Warn,
                    Some("dispatch::matcher"),
                    "Response listener panicked; skipped",
                    Some(json!({
                        "connection_id": connection_id,
                        "rid": result.request_id,
                        "failed": registered - completed,
                    })),
                );
            }
        }
        Delivery::Written
    }
}

/// Single consumer that drains completions in the order handlers finish.
pub struct CompletionMatcher {
    stop_signal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CompletionMatcher {
    pub fn start(
        completions: Receiver<Completion>,
        write_back: WriteBack,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&stop_signal);

        let worker = thread::Builder::new()
            .name("completion-matcher".to_owned())
            .spawn(move || loop {
                match completions.recv_timeout(poll_interval) {
                    Ok(completion) => {
                        write_back.deliver(completion);
                    }
                    // Stop is only honoured once the channel is empty.
                    Err(RecvTimeoutError::Timeout) => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            stop_signal,
            worker: Some(worker),
        })
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Delivers whatever is still queued, then joins the consumer.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for CompletionMatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::dispatch::Completion;
    use crate::listeners::ResponseListenerRegistry;
    use crate::logging::testing::memory_logger;
    use crate::logging::LogLevel;
    use crate::registry::testing::RecordingChannel;
    use crate::registry::{Channel, ConnectionRegistry};
    use crate::wire::codec::WireCodec;
    use crate::wire::message::{CommandMessage, CommandOperate, CommandResult, PayloadMap};

    use super::{CompletionMatcher, Delivery, WriteBack};

    fn completion(connection_id: u64, rid: &str) -> Completion {
        let command = CommandMessage::new(CommandOperate::CancelJob, rid, PayloadMap::new());
        Completion {
            connection_id,
            result: CommandResult::ok(&command, PayloadMap::new()),
        }
    }

    fn write_back_for(
        registry: Arc<ConnectionRegistry>,
        notify: bool,
    ) -> (WriteBack, Arc<ResponseListenerRegistry>) {
        let (logger, _) = memory_logger(LogLevel::Error);
        let listeners = Arc::new(ResponseListenerRegistry::new());
        (
            WriteBack {
                registry,
                listeners: listeners.clone(),
                notify_listeners: Arc::new(AtomicBool::new(notify)),
                codec: WireCodec::default(),
                logger,
            },
            listeners,
        )
    }

    #[test]
    fn classifies_delivery_failures() {
        let registry = Arc::new(ConnectionRegistry::new());
        let closed = Arc::new(RecordingChannel::new(2));
        registry.register(Arc::new(RecordingChannel::new(1)));
        registry.register(closed.clone());
        closed.close();
        let (write_back, _) = write_back_for(registry, false);

        assert_eq!(write_back.deliver(completion(1, "a")), Delivery::Written);
        assert_eq!(write_back.deliver(completion(2, "b")), Delivery::WriteFailed);
        assert_eq!(write_back.deliver(completion(3, "c")), Delivery::ConnectionGone);
    }

    #[test]
    fn listeners_are_called_only_when_enabled() {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.register(Arc::new(RecordingChannel::new(1)));
        let calls = Arc::new(AtomicUsize::new(0));

        for (notify, expected) in [(false, 0), (true, 1)] {
            calls.store(0, Ordering::SeqCst);
            let (write_back, listeners) = write_back_for(registry.clone(), notify);
            let counter = calls.clone();
            listeners.add(Arc::new(move |_: u64, _: &CommandResult| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

            write_back.deliver(completion(1, "r"));
            assert_eq!(calls.load(Ordering::SeqCst), expected);
        }
    }

    #[test]
    fn consumer_survives_failed_write_backs_and_drains_on_stop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let live = Arc::new(RecordingChannel::new(1));
        registry.register(live.clone());
        let (write_back, _) = write_back_for(registry, false);
        let (sender, receiver) = crossbeam_channel::unbounded();

        let mut matcher = CompletionMatcher::start(receiver, write_back, Duration::from_millis(20))
            .expect("matcher should start");
        sender.send(completion(99, "lost")).expect("send should work");
        sender.send(completion(1, "first")).expect("send should work");
        let results = live.wait_for_results(1, Duration::from_secs(2));
        assert_eq!(results[0].request_id, "first");
        assert!(matcher.is_running());

        sender.send(completion(1, "second")).expect("send should work");
        matcher.stop();
        let results = live.wait_for_results(2, Duration::from_millis(10));
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].request_id, "second");
        assert!(!matcher.is_running());
    }
}
