//! Fixed-size pool of workers that can be paused without touching the
//! tasks they are busy with.

use async_std::channel::{Receiver, Sender, TrySendError};
use futures::{future::BoxFuture, FutureExt};
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle, time::Instant};

/// A unit of work. An error marks the task as failed.
pub type Task = BoxFuture<'static, anyhow::Result<()>>;

const TERMINATION_CHECK_INTERVAL: Duration = Duration::from_millis(10);

pub fn available_processors() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Number of workers for a `requested` amount, below 1 means `max_threads`.
/// Never more than there are processors, never less than one.
pub fn num_workers(requested: i32, max_threads: usize) -> usize {
    let wanted = if requested < 1 {
        max_threads
    } else {
        requested as usize
    };

    wanted.min(available_processors()).max(1)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorStats {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub active: usize,
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    active: AtomicUsize,
}

pub struct PausableExecutor {
    name: String,
    size: usize,
    tx: Sender<Task>,
    rx: Receiver<Task>,
    paused: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl PausableExecutor {
    /// Spawns the workers, must be called within a tokio runtime.
    pub fn new(name: impl Into<String>, num_threads: i32, max_threads: usize) -> Self {
        let name = name.into();
        let size = num_workers(num_threads, max_threads);
        let (tx, rx) = async_std::channel::unbounded::<Task>();
        let (paused, _) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let workers = (1..=size)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    name.clone(),
                    rx.clone(),
                    paused.subscribe(),
                    counters.clone(),
                ))
            })
            .collect::<Vec<_>>();

        tracing::debug!("[{}] Executor started with {} workers", name, size);

        Self {
            name,
            size,
            tx,
            rx,
            paused,
            workers: Mutex::new(workers),
            counters,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues the task; rejected tasks are logged and `false` is returned.
    pub fn submit(&self, task: Task) -> bool {
        match self.tx.try_send(task) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("[{}] Task rejected, executor is shut down", self.name);
                false
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!("[{}] Task rejected, queue is full", self.name);
                false
            }
        }
    }

    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            tracing::info!("[{}] Paused", self.name);
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            tracing::info!("[{}] Resumed", self.name);
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// No new tasks are accepted, already queued ones still run.
    pub fn shutdown(&self) {
        if self.tx.close() {
            tracing::debug!("[{}] Shutting down", self.name);
        }
    }

    /// Drops queued tasks and aborts running ones.
    /// Returns how many queued tasks never started.
    pub fn shutdown_now(&self) -> usize {
        self.tx.close();

        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }

        for worker in self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            worker.abort();
        }

        tracing::debug!(
            "[{}] Shut down immediately, {} queued tasks dropped",
            self.name,
            dropped
        );
        dropped
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn is_terminated(&self) -> bool {
        self.is_shutdown()
            && self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .all(|worker| worker.is_finished())
    }

    /// `true` if all workers ended within `timeout`.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if self.is_terminated() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(TERMINATION_CHECK_INTERVAL.min(deadline - now)).await;
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            active: self.counters.active.load(Ordering::SeqCst),
            queued: self.rx.len(),
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    name: String,
    rx: Receiver<Task>,
    mut paused: watch::Receiver<bool>,
    counters: Arc<Counters>,
) {
    tracing::trace!("[{}#{}] Starting", name, worker_id);

    while let Ok(task) = rx.recv().await {
        // a paused worker holds on to the task it took until resumed
        if paused.wait_for(|paused| !*paused).await.is_err() {
            break;
        }

        counters.active.fetch_add(1, Ordering::SeqCst);
        let outcome = AssertUnwindSafe(task).catch_unwind().await;
        counters.active.fetch_sub(1, Ordering::SeqCst);
        counters.completed.fetch_add(1, Ordering::SeqCst);

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(panic) => Some(format!("panicked: {}", crate::panic_message(&panic))),
        };
        if let Some(failure) = failure {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            tracing::warn!("[{}#{}] Task failed: {}", name, worker_id, failure);
        }
    }

    tracing::trace!("[{}#{}] Ended", name, worker_id);
}
