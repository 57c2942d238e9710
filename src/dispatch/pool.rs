use std::fmt;
use std::io;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, PartialEq, Eq)]
pub enum PoolError {
    Saturated { capacity: usize },
    ShutDown,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Saturated { capacity } => {
                write!(f, "task queue is full ({capacity} pending tasks)")
            }
            Self::ShutDown => write!(f, "task pool is shut down"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Fixed set of named threads draining one task queue. `capacity = None`
/// makes the queue unbounded.
pub struct TaskPool {
    sender: RwLock<Option<Sender<Task>>>,
    capacity: Option<usize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    pub fn new(name: &str, threads: usize, capacity: Option<usize>) -> io::Result<Self> {
        let (sender, receiver) = match capacity {
            Some(capacity) => crossbeam_channel::bounded::<Task>(capacity),
            None => crossbeam_channel::unbounded::<Task>(),
        };

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads.max(1) {
            let receiver: Receiver<Task> = receiver.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || {
                        for task in receiver.iter() {
                            task();
                        }
                    })?,
            );
        }

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            capacity,
            workers: Mutex::new(workers),
        })
    }

    pub fn submit(&self, task: Task) -> Result<(), PoolError> {
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            return Err(PoolError::ShutDown);
        };

        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PoolError::Saturated {
                capacity: self.capacity.unwrap_or_default(),
            }),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::ShutDown),
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.sender.read().as_ref().map_or(0, Sender::len)
    }

    /// Stops accepting tasks, lets queued tasks finish and joins the threads.
    pub fn shutdown(&self) {
        drop(self.sender.write().take());
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam_channel::bounded;

    use super::{PoolError, TaskPool};

    #[test]
    fn runs_tasks_and_drains_on_shutdown() {
        let pool = TaskPool::new("test-pool", 4, Some(64)).expect("pool should start");
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..32 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                std::thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("submit should work");
        }
        pool.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 32);
        assert_eq!(pool.submit(Box::new(|| {})), Err(PoolError::ShutDown));
    }

    #[test]
    fn bounded_queue_reports_saturation() {
        let pool = TaskPool::new("tiny-pool", 1, Some(1)).expect("pool should start");
        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);

        pool.submit(Box::new(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        }))
        .expect("first task should be accepted");
        started_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("first task should start");

        pool.submit(Box::new(|| {})).expect("queue slot should be free");
        assert_eq!(
            pool.submit(Box::new(|| {})),
            Err(PoolError::Saturated { capacity: 1 })
        );
        assert_eq!(pool.pending(), 1);

        release_tx.send(()).expect("blocked task should be released");
        pool.shutdown();
    }
}
