use async_std::channel::{Receiver, Sender};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tokio::task::JoinHandle;

use crate::{
    core::HandlerRegistry,
    executor::{ExecutorStats, PausableExecutor, Task},
    listener::{self, JobCompleteManager},
    models::{Job, JobList, RunnerSnapshot},
    Config,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    Paused,
    Stopping,
}

/// Queues jobs and drives them through a [`PausableExecutor`].
///
/// Cheap to clone, all clones share the same queue and executor. The
/// executor only exists between `start()` and `stop()`, jobs added before
/// `start()` wait in the queue.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    handlers: Arc<HandlerRegistry>,
    completion: Arc<JobCompleteManager>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Job>,
    completed: Vec<Job>,
    executor: Option<Arc<PausableExecutor>>,
    scheduler: Option<Scheduler>,
    stopping: bool,
}

struct Scheduler {
    tx: Sender<SchedulerCommand>,
    handle: JoinHandle<()>,
}

enum SchedulerCommand {
    Completed(Box<Job>),
    Flush,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JobRunner {
    pub fn new(
        config: Config,
        handlers: Arc<HandlerRegistry>,
        completion: Arc<JobCompleteManager>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                handlers,
                completion,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Rebuilds a runner received from a peer. Name and thread count come
    /// from the snapshot, everything else from `config`.
    pub fn from_snapshot(
        snapshot: RunnerSnapshot,
        config: Config,
        handlers: Arc<HandlerRegistry>,
        completion: Arc<JobCompleteManager>,
    ) -> Self {
        let config = Config {
            name: snapshot.name,
            num_threads: snapshot.num_threads,
            ..config
        };
        let runner = Self::new(config, handlers, completion);
        {
            let mut state = runner.inner.lock();
            state.queue = snapshot.pending.into();
            state.completed = snapshot.completed;
        }
        runner
    }

    pub fn snapshot(&self) -> RunnerSnapshot {
        let state = self.inner.lock();
        RunnerSnapshot {
            name: self.inner.config.name.clone(),
            num_threads: self.inner.config.num_threads,
            pending: state.queue.iter().cloned().collect(),
            completed: state.completed.clone(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn add(&self, job: Job) {
        let mut state = self.inner.lock();
        tracing::debug!("[{}] Job {} queued", self.inner.config.name, job.id);
        state.queue.push_back(job);
        request_flush(&state);
    }

    pub fn add_list(&self, jobs: JobList) {
        let mut state = self.inner.lock();
        tracing::debug!("[{}] {} jobs queued", self.inner.config.name, jobs.len());
        state.queue.extend(jobs);
        request_flush(&state);
    }

    /// Creates the executor if needed and hands it all queued jobs.
    /// Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut state = self.inner.lock();

        if state.executor.is_none() {
            let config = &self.inner.config;
            let executor =
                PausableExecutor::new(&config.name, config.num_threads, config.max_threads);
            let (tx, rx) = async_std::channel::unbounded::<SchedulerCommand>();
            let handle = tokio::spawn(run_scheduler(Arc::downgrade(&self.inner), rx));

            tracing::info!(
                "[{}] Started with {} workers",
                config.name,
                executor.size()
            );
            state.executor = Some(Arc::new(executor));
            state.scheduler = Some(Scheduler { tx, handle });
        }

        flush(&self.inner, &mut state);
    }

    /// Lets all dispatched jobs finish, then tears the executor down.
    /// Jobs still queued stay queued for the next `start()`.
    pub async fn stop(&self) {
        self.shutdown(false).await
    }

    /// Like `stop()` but aborts running jobs and drops dispatched ones.
    pub async fn terminate(&self) {
        self.shutdown(true).await
    }

    async fn shutdown(&self, now: bool) {
        let name = &self.inner.config.name;
        let executor = {
            let mut state = self.inner.lock();
            let executor = match &state.executor {
                Some(executor) => executor.clone(),
                None => return,
            };
            state.stopping = true;

            // queued tasks of a paused pool would never drain
            executor.resume();
            if now {
                let dropped = executor.shutdown_now();
                if dropped > 0 {
                    tracing::info!("[{}] {} dispatched jobs dropped", name, dropped);
                }
            } else {
                executor.shutdown();
            }
            executor
        };

        let poll = self.inner.config.termination_poll_interval;
        while !executor.await_termination(poll).await {
            tracing::debug!("[{}] Waiting for workers to end ...", name);
        }

        let scheduler = {
            let mut state = self.inner.lock();
            if let Some(current) = &state.executor {
                if Arc::ptr_eq(current, &executor) {
                    state.executor = None;
                }
            }
            state.scheduler.take()
        };

        if let Some(Scheduler { tx, handle }) = scheduler {
            // the scheduler ends once it has reported every finished job
            drop(tx);
            if let Err(e) = handle.await {
                tracing::error!("[{}] Scheduler ended abnormally: {}", name, e);
            }
        }

        let mut state = self.inner.lock();
        state.stopping = false;
        tracing::info!(
            "[{}] Stopped, {} jobs completed, {} queued",
            name,
            state.completed.len(),
            state.queue.len()
        );
    }

    pub fn pause_execution(&self) {
        if let Some(executor) = &self.inner.lock().executor {
            executor.pause();
        }
    }

    pub fn resume_execution(&self) {
        if let Some(executor) = &self.inner.lock().executor {
            executor.resume();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner
            .lock()
            .executor
            .as_ref()
            .map_or(false, |executor| executor.is_paused())
    }

    pub fn state(&self) -> RunnerState {
        let state = self.inner.lock();
        match &state.executor {
            _ if state.stopping => RunnerState::Stopping,
            None => RunnerState::Idle,
            Some(executor) if executor.is_paused() => RunnerState::Paused,
            Some(_) => RunnerState::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), RunnerState::Running | RunnerState::Paused)
    }

    /// Jobs not yet handed to the executor.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn completed_jobs(&self) -> Vec<Job> {
        self.inner.lock().completed.clone()
    }

    pub fn take_completed(&self) -> Vec<Job> {
        std::mem::take(&mut self.inner.lock().completed)
    }

    pub fn executor_stats(&self) -> Option<ExecutorStats> {
        self.inner
            .lock()
            .executor
            .as_ref()
            .map(|executor| executor.stats())
    }
}

fn request_flush(state: &State) {
    if let Some(scheduler) = &state.scheduler {
        let _ = scheduler.tx.try_send(SchedulerCommand::Flush);
    }
}

/// Moves every queued job into the executor, in queue order.
fn flush(inner: &Inner, state: &mut State) -> usize {
    let (executor, tx) = match (&state.executor, &state.scheduler) {
        (Some(executor), Some(scheduler)) => (executor.clone(), scheduler.tx.clone()),
        _ => return 0,
    };
    // shutdown only happens under the state lock, so submit cannot be rejected below
    if executor.is_shutdown() {
        return 0;
    }

    let mut count = 0;
    while let Some(job) = state.queue.pop_front() {
        let id = job.id.clone();
        if !executor.submit(job_task(job, inner.handlers.clone(), tx.clone())) {
            tracing::error!("[{}] Job {} lost, executor rejected it", inner.config.name, id);
            break;
        }
        tracing::debug!("[{}] Job {} dispatched", inner.config.name, id);
        count += 1;
    }
    count
}

fn job_task(mut job: Job, handlers: Arc<HandlerRegistry>, tx: Sender<SchedulerCommand>) -> Task {
    Box::pin(async move {
        let result = job.execute(&handlers).await;
        let failure = result.failure_info().map(str::to_string);
        let id = job.id.clone();

        if tx
            .send(SchedulerCommand::Completed(Box::new(job)))
            .await
            .is_err()
        {
            tracing::warn!("Result of job {} could not be reported", id);
        }

        match failure {
            Some(info) => Err(anyhow::anyhow!("Job {}: {}", id, info)),
            None => Ok(()),
        }
    })
}

async fn run_scheduler(inner: Weak<Inner>, rx: Receiver<SchedulerCommand>) {
    while let Ok(command) = rx.recv().await {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };

        match command {
            SchedulerCommand::Completed(job) => complete(&inner, *job),
            SchedulerCommand::Flush => {
                let mut state = inner.lock();
                flush(&inner, &mut state);
            }
        }
    }
}

/// Reports a finished job: first to the manager's listeners, then to the
/// job's own listener, and only then are follow-up jobs dispatched.
fn complete(inner: &Inner, mut job: Job) {
    let result = match job.result().cloned() {
        Some(result) => result,
        None => {
            tracing::warn!("[{}] Job {} completed without result", inner.config.name, job.id);
            return;
        }
    };

    inner.completion.notify(&job, &result);
    if let Some(listener) = job.take_listener() {
        listener::notify_one(listener.as_ref(), &job, &result);
    }

    if inner.config.clear_payloads {
        job.clear_payload();
    }

    let mut state = inner.lock();
    state.completed.push(job);
    flush(inner, &mut state);
}
