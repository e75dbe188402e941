//! Sequential task queue: one lane, one task at a time, a cool-down between tasks.
//!
//! Every remote call of the subsystem goes through a single queue so that at
//! most one request is outstanding and consecutive requests are spaced by at
//! least `cooldown`. Tasks can be appended or pushed to the head of the line;
//! a task that is already running always finishes undisturbed.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Configuration for a [`SequentialQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Minimum delay between the end of one task and the start of the next.
    pub cooldown: Duration,
    /// Upper bound on pending (not running) tasks. `None` = unbounded.
    pub max_pending: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(250),
            max_pending: None,
        }
    }
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Clone, Copy)]
enum Side {
    Front,
    Back,
}

impl Side {
    fn as_str(self) -> &'static str {
        match self {
            Side::Front => "front",
            Side::Back => "back",
        }
    }
}

struct Shared {
    pending: Mutex<VecDeque<Job>>,
    wake: Notify,
    busy: AtomicBool,
    closing: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-lane asynchronous task runner.
pub struct SequentialQueue {
    shared: Arc<Shared>,
    config: QueueConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SequentialQueue {
    /// Create the queue and spawn its worker on the current tokio runtime.
    ///
    /// # Errors
    /// Fails if called outside a tokio runtime.
    pub fn new(config: QueueConfig) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("sequential queue needs a tokio runtime: {e}")))?;

        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            busy: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });
        let worker = handle.spawn(run_worker(Arc::clone(&shared), config.cooldown));

        Ok(Self {
            shared,
            config,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a task to the end of the line.
    pub fn push_back<F, Fut, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(Side::Back, task)
    }

    /// Put a task at the head of the line, ahead of everything pending.
    pub fn push_front<F, Fut, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(Side::Front, task)
    }

    /// Number of pending tasks, not counting the one running.
    pub fn len(&self) -> usize {
        self.shared.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Is a task executing right now?
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Let the running task finish, drop everything pending, stop the worker.
    ///
    /// Tasks submitted afterwards are dropped. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let dropped = {
            let mut pending = self.shared.pending();
            self.shared.closing.store(true, Ordering::Release);
            std::mem::take(&mut *pending)
        };
        let count = dropped.len();
        drop(dropped);
        self.shared.wake.notify_one();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    error!(error = %e, "queue worker ended abnormally");
                }
            }
            debug!(dropped = count, "sequential queue shut down");
        }
    }

    /// Has [`shutdown`](Self::shutdown) been called?
    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    fn submit<F, Fut, T>(&self, side: Side, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                let outcome = AssertUnwindSafe(async move { task().await })
                    .catch_unwind()
                    .await
                    .map_err(|panic| {
                        let message = panic_message(panic.as_ref());
                        error!(%message, "queued task panicked");
                        Error::TaskPanicked(message)
                    });
                // Submitter may have dropped its handle.
                let _ = tx.send(outcome);
            }
            .boxed()
        });

        let len = {
            let mut pending = self.shared.pending();
            // Checked under the lock so shutdown's drain cannot miss a task.
            if self.shared.closing.load(Ordering::Acquire) {
                drop(pending);
                warn!(side = side.as_str(), "queue is shut down, task dropped");
                return TaskHandle { rx };
            }
            if let Some(max) = self.config.max_pending {
                if max == 0 {
                    drop(pending);
                    record_drop(side);
                    return TaskHandle { rx };
                }
                while pending.len() >= max {
                    // Appending sheds the oldest; prioritizing sheds the newest.
                    match side {
                        Side::Back => pending.pop_front(),
                        Side::Front => pending.pop_back(),
                    };
                    record_drop(side);
                }
            }
            match side {
                Side::Back => pending.push_back(job),
                Side::Front => pending.push_front(job),
            }
            pending.len()
        };

        metrics::queue_operations().add(
            1,
            &[KeyValue::new("operation", "enqueue"), KeyValue::new("side", side.as_str())],
        );
        debug!(side = side.as_str(), pending = len, "task enqueued");
        self.shared.wake.notify_one();

        TaskHandle { rx }
    }
}

impl Drop for SequentialQueue {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.abort();
        }
    }
}

impl std::fmt::Debug for SequentialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialQueue")
            .field("config", &self.config)
            .field("pending", &self.len())
            .field("busy", &self.is_busy())
            .finish()
    }
}

fn record_drop(side: Side) {
    warn!(side = side.as_str(), "pending limit reached, task dropped");
    metrics::queue_operations().add(
        1,
        &[KeyValue::new("operation", "drop"), KeyValue::new("side", side.as_str())],
    );
}

async fn run_worker(shared: Arc<Shared>, cooldown: Duration) {
    loop {
        let next = shared.pending().pop_front();
        let Some(job) = next else {
            if shared.closing.load(Ordering::Acquire) {
                return;
            }
            shared.wake.notified().await;
            continue;
        };

        shared.busy.store(true, Ordering::Release);
        let started = Instant::now();
        job().await;
        let elapsed = started.elapsed();
        shared.busy.store(false, Ordering::Release);

        metrics::operation_duration_ms().record(
            elapsed.as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "queued_task")],
        );
        debug!(duration_ms = elapsed.as_millis() as u64, "task finished");

        if shared.closing.load(Ordering::Acquire) {
            return;
        }
        tokio::time::sleep(cooldown).await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Completion signal for a queued task. Dropping it does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::TaskDropped)))
    }
}
