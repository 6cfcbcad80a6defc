//! Receiving end of the command protocol.
//!
//! A master keeps a list of registered workers and hands them job runners;
//! a worker executes the runners it receives and sends them back executed.
//! Both roles answer pings.

use anyhow::Context;
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tracing::Instrument;
use typed_builder::TypedBuilder;

use crate::{
    commands::{handle, Command, CommandId, CommandKind, PayloadObject},
    connection::{Connection, Connector, Inbox},
    core::HandlerRegistry,
    executor::{self, PausableExecutor, Task},
    listener::JobCompleteManager,
    metrics,
    models::RunnerSnapshot,
    runner::JobRunner,
    Config,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct EngineConfig {
    /// Address the engine is reachable at, used as reply address.
    #[builder(setter(into))]
    pub address: String,

    #[builder(default = Role::Worker)]
    pub role: Role,

    /// Workers of the engine's own executor, see [`executor::num_workers`].
    #[builder(default = -1)]
    pub num_threads: i32,

    #[builder(default = executor::available_processors())]
    pub max_threads: usize,

    /// How often to check for a response before giving up.
    #[builder(default = 60)]
    pub response_attempts: u32,

    #[builder(default = Duration::from_millis(500))]
    pub response_attempt_interval: Duration,

    /// Settings for runners received from other engines.
    #[builder(default)]
    pub runner: Config,
}

/// Gets to see every response command an engine receives.
pub trait ResponseHandler: Send + Sync {
    fn response_received(&self, command: &Command);
}

impl<F> ResponseHandler for F
where
    F: Fn(&Command) + Send + Sync,
{
    fn response_received(&self, command: &Command) {
        (self)(command)
    }
}

pub struct ScriptingEngine {
    config: EngineConfig,
    handlers: Arc<HandlerRegistry>,
    completion: Arc<JobCompleteManager>,
    connector: Arc<dyn Connector>,
    executor: PausableExecutor,
    stopped: watch::Sender<bool>,

    workers: RwLock<Vec<Arc<dyn Connection>>>,
    next_worker: AtomicUsize,

    pending: Mutex<HashMap<CommandId, oneshot::Sender<Command>>>,
    response_handlers: RwLock<Vec<Arc<dyn ResponseHandler>>>,
}

impl ScriptingEngine {
    /// Must be called within a tokio runtime.
    pub fn new(
        config: EngineConfig,
        handlers: Arc<HandlerRegistry>,
        completion: Arc<JobCompleteManager>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let executor = PausableExecutor::new(
            format!("engine-{}", config.address),
            config.num_threads,
            config.max_threads,
        );

        Arc::new(Self {
            config,
            handlers,
            completion,
            connector,
            executor,
            stopped: watch::channel(false).0,
            workers: RwLock::new(Vec::new()),
            next_worker: AtomicUsize::new(0),
            pending: Mutex::new(HashMap::new()),
            response_handlers: RwLock::new(Vec::new()),
        })
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn completion(&self) -> &Arc<JobCompleteManager> {
        &self.completion
    }

    pub fn add_response_handler(&self, handler: Arc<dyn ResponseHandler>) {
        self.response_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Handles everything arriving in `inbox` until the inbox closes or the
    /// engine is stopped.
    pub fn start(self: &Arc<Self>, inbox: Inbox) -> JoinHandle<()> {
        let engine = self.clone();

        tokio::spawn(async move {
            tracing::info!("[{}] Engine listening ({:?})", engine.address(), engine.role());
            let mut stopped = engine.stopped.subscribe();

            loop {
                tokio::select! {
                    message = inbox.recv() => match message {
                        Ok(bytes) => engine.handle_bytes(&bytes).await,
                        Err(_) => break,
                    },
                    _ = async { let _ = stopped.wait_for(|stopped| *stopped).await; } => break,
                }
                if engine.is_stopped() {
                    break;
                }
            }

            tracing::info!("[{}] Engine ended", engine.address());
        })
    }

    pub async fn handle_bytes(self: &Arc<Self>, bytes: &[u8]) {
        match Command::from_bytes(bytes) {
            Ok(command) => {
                // failures are logged by `handle`
                let _ = self.handle(command).await;
            }
            Err(e) => {
                metrics::COUNTER.command_failed("unknown");
                tracing::error!(
                    "[{}] Unknown message received [{} bytes]: {:#}",
                    self.address(),
                    bytes.len(),
                    e
                );
            }
        }
    }

    /// Validates and executes `command`. Nothing happens for commands
    /// failing validation.
    pub async fn handle(self: &Arc<Self>, command: Command) -> anyhow::Result<()> {
        let kind = command.kind();
        let span = tracing::info_span!(
            "command",
            kind = kind.as_str(),
            id = %command.id(),
            request = command.is_request()
        );
        command.attach_trace_context(&span);
        metrics::COUNTER.command_received(kind.as_str());

        let outcome = async {
            self.check(&command)?;
            handle::handle_command(self, command).await
        }
        .instrument(span)
        .await;

        if let Err(e) = &outcome {
            metrics::COUNTER.command_failed(kind.as_str());
            tracing::error!("[{}] Command {} failed: {:#}", self.address(), kind, e);
        }
        outcome
    }

    pub fn check(&self, command: &Command) -> anyhow::Result<()> {
        command.check()?;
        if !command.is_request() {
            return Ok(());
        }

        let kind = command.kind();
        if kind.has_response() && command.reply_to().is_none() {
            anyhow::bail!("{} {}: no reply address", kind, command.id());
        }

        match (kind, self.role()) {
            (CommandKind::RegisterWorker | CommandKind::DeregisterWorker, Role::Worker) => {
                anyhow::bail!("{} is only accepted by a master", kind)
            }
            (CommandKind::KillWorkers, Role::Master) => {
                anyhow::bail!("{} is only accepted by a worker", kind)
            }
            _ => Ok(()),
        }
    }

    /// Runs `job` on the engine's executor instead of the task handling
    /// the command.
    pub fn execute_job(&self, job: Task) -> anyhow::Result<()> {
        if !self.executor.submit(job) {
            anyhow::bail!("[{}] Engine is stopped, job rejected", self.address());
        }
        Ok(())
    }

    pub(crate) async fn send_response(
        &self,
        request: &Command,
        response: Command,
    ) -> anyhow::Result<()> {
        let address = request
            .reply_to()
            .ok_or_else(|| anyhow::anyhow!("Command {} has no reply address", request.id()))?;
        let connection = self.connector.connect(address)?;

        connection
            .send_response(response)
            .await
            .with_context(|| format!("Unable to send response to {}", address))
    }

    pub(crate) fn response_received(&self, command: &Command) {
        let handlers = self
            .response_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.response_received(command)))
            {
                tracing::error!(
                    "[{}] Response handler panicked: {}",
                    self.address(),
                    crate::panic_message(&panic)
                );
            }
        }

        if let Some(waiter) = self.pending().remove(command.id()) {
            let _ = waiter.send(command.clone());
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<CommandId, oneshot::Sender<Command>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register_worker(&self, address: &str) -> anyhow::Result<()> {
        let connection = self.connector.connect(address)?;
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);

        if workers.iter().any(|worker| worker.address() == address) {
            tracing::debug!("[{}] Worker {} already registered", self.address(), address);
            return Ok(());
        }
        workers.push(connection);
        tracing::info!(
            "[{}] Worker {} registered, {} in total",
            self.address(),
            address,
            workers.len()
        );
        Ok(())
    }

    pub(crate) fn deregister_worker(&self, address: &str) -> bool {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        let before = workers.len();
        workers.retain(|worker| worker.address() != address);

        let removed = before != workers.len();
        if removed {
            tracing::info!("[{}] Worker {} deregistered", self.address(), address);
        }
        removed
    }

    /// Addresses of the registered workers.
    pub fn workers(&self) -> Vec<String> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|worker| worker.address().to_string())
            .collect()
    }

    fn next_worker(&self) -> anyhow::Result<Arc<dyn Connection>> {
        let workers = self.workers.read().unwrap_or_else(PoisonError::into_inner);
        if workers.is_empty() {
            anyhow::bail!("[{}] No workers registered", self.address());
        }

        let index = self.next_worker.fetch_add(1, Ordering::SeqCst) % workers.len();
        Ok(workers[index].clone())
    }

    /// Hands `runner` to the next worker without waiting for the result.
    pub async fn send_job_runner(&self, runner: &JobRunner) -> anyhow::Result<CommandId> {
        let worker = self.next_worker()?;
        let mut command = Command::job_runner(runner);
        command.set_reply_to(self.address());
        let id = command.id().clone();

        tracing::info!(
            "[{}] Sending runner {} to {}",
            self.address(),
            runner.config().name,
            worker.address()
        );
        worker.send_request(command).await?;
        Ok(id)
    }

    /// Executes `runner` on the next worker and waits for the executed jobs.
    /// Their results are also reported to this engine's listeners.
    pub async fn run_remote(&self, runner: &JobRunner) -> anyhow::Result<RunnerSnapshot> {
        let worker = self.next_worker()?;
        let response = self
            .request(worker.as_ref(), Command::job_runner(runner))
            .await?;

        response
            .runner()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Response {} carries no job runner", response.id()))
    }

    /// Returns the address the peer reports for itself.
    pub async fn ping(&self, address: &str) -> anyhow::Result<String> {
        let connection = self.connector.connect(address)?;
        let response = self
            .request(connection.as_ref(), Command::new(CommandKind::Ping))
            .await?;

        Ok(response
            .payload_objects()
            .and_then(|objects| {
                objects.iter().find_map(|o| match o {
                    PayloadObject::Text(text) => Some(text.clone()),
                    _ => None,
                })
            })
            .unwrap_or_default())
    }

    async fn request(
        &self,
        connection: &dyn Connection,
        mut command: Command,
    ) -> anyhow::Result<Command> {
        command.set_reply_to(self.address());
        let id = command.id().clone();
        let (tx, mut rx) = oneshot::channel();
        self.pending().insert(id.clone(), tx);

        if let Err(e) = connection.send_request(command).await {
            self.pending().remove(&id);
            return Err(e);
        }

        let attempts = self.config.response_attempts.max(1);
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.response_attempt_interval, &mut rx).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(_)) => anyhow::bail!("Waiting for response to {} was cancelled", id),
                Err(_) => tracing::trace!(
                    "[{}] No response to {} yet ({}/{})",
                    self.address(),
                    id,
                    attempt,
                    attempts
                ),
            }
        }

        self.pending().remove(&id);
        anyhow::bail!(
            "No response to {} from {} after {} attempts",
            id,
            connection.address(),
            attempts
        )
    }

    pub async fn register_with(&self, master: &str) -> anyhow::Result<()> {
        self.send_to(master, CommandKind::RegisterWorker).await
    }

    pub async fn deregister_from(&self, master: &str) -> anyhow::Result<()> {
        self.send_to(master, CommandKind::DeregisterWorker).await
    }

    async fn send_to(&self, address: &str, kind: CommandKind) -> anyhow::Result<()> {
        let connection = self.connector.connect(address)?;
        let command = Command::with_objects(
            kind,
            vec![PayloadObject::Address(self.address().to_string())],
        );
        connection.send_request(command).await
    }

    /// Tells every registered worker to stop and forgets about them.
    pub async fn kill_workers(&self) -> usize {
        let workers = std::mem::take(
            &mut *self.workers.write().unwrap_or_else(PoisonError::into_inner),
        );

        let mut killed = 0;
        for worker in workers {
            match worker.send_request(Command::new(CommandKind::KillWorkers)).await {
                Ok(()) => killed += 1,
                Err(e) => tracing::warn!(
                    "[{}] Unable to kill worker {}: {:#}",
                    self.address(),
                    worker.address(),
                    e
                ),
            }
        }
        killed
    }

    pub fn pause(&self) {
        self.executor.pause();
    }

    pub fn resume(&self) {
        self.executor.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.executor.is_paused()
    }

    /// Stops accepting jobs, already accepted ones still run.
    pub(crate) fn shutdown(&self) {
        self.executor.resume();
        self.executor.shutdown();
        self.stopped.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.executor.is_shutdown()
    }

    /// Waits for all jobs handed to `execute_job` to finish.
    pub async fn stop(&self) {
        self.shutdown();
        let poll = self.config.runner.termination_poll_interval;
        while !self.executor.await_termination(poll).await {
            tracing::debug!("[{}] Waiting for engine jobs to end ...", self.address());
        }
        tracing::info!("[{}] Engine stopped", self.address());
    }
}
