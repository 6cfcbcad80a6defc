#![allow(dead_code)]

use jobrunner::{
    async_trait,
    connection::LocalNetwork,
    engine::{EngineConfig, Role, ScriptingEngine},
    Config, Job, JobCompleteManager, JobHandler, JobId, JobResult, JobRunner,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tokio::task::JoinHandle;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TestCommand {
    pub name: String,
    pub outcome: Outcome,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Outcome {
    Success,
    Fail,
    Panic,
    Delay(u64 /* Delay ms */),
}

jobrunner::job_handlers! {
    struct TestHandlers {
        test_command: TestCommand,
    }
}

pub type Invocations = Arc<Mutex<Vec<String>>>;
pub type Results = Arc<Mutex<Vec<(JobId, JobResult)>>>;

pub struct Recorder {
    invc: Invocations,
}

#[async_trait]
impl JobHandler for Recorder {
    type Payload = TestCommand;

    async fn process(&self, payload: &TestCommand) -> anyhow::Result<String> {
        self.invc.lock().unwrap().push(payload.name.clone());
        println!("[TEST] Command received {}", payload.name);

        match payload.outcome {
            Outcome::Success => Ok(format!("{} done", payload.name)),
            Outcome::Fail => Err(anyhow::anyhow!("{} failed on purpose", payload.name)),
            Outcome::Panic => panic!("{} panicked on purpose", payload.name),
            Outcome::Delay(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(format!("{} slept {}ms", payload.name, ms))
            }
        }
    }
}

pub fn command(name: &str, outcome: Outcome) -> Job {
    Job::new(&TestCommand {
        name: name.to_string(),
        outcome,
    })
    .expect("encode job")
}

/// Only valid while the payload is still attached, i.e. before the job has
/// been reported.
pub fn name_of(job: &Job) -> String {
    job.payload::<TestCommand>().expect("decode job").name
}

pub fn ids(jobs: &[Job]) -> Vec<JobId> {
    jobs.iter().map(|job| job.id.clone()).collect()
}

pub fn invocations() -> Invocations {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn recorded(invc: &Invocations) -> Vec<String> {
    invc.lock().unwrap().clone()
}

pub fn handlers(invc: &Invocations) -> Arc<jobrunner::HandlerRegistry> {
    Arc::new(
        TestHandlers::builder()
            .with_test_command_handler(Recorder { invc: invc.clone() })
            .build(),
    )
}

/// A completion manager recording every result it is told about, keyed by
/// job id.
pub fn recording_manager() -> (Arc<JobCompleteManager>, Results) {
    let results: Results = Arc::new(Mutex::new(Vec::new()));
    let manager = Arc::new(JobCompleteManager::new());

    let sink = results.clone();
    manager.add_listener(Arc::new(move |job: &Job, result: &JobResult| {
        sink.lock().unwrap().push((job.id.clone(), result.clone()));
    }));

    (manager, results)
}

pub struct TestRunner {
    pub runner: JobRunner,
    pub invc: Invocations,
    pub results: Results,
}

pub fn create_runner(name: &str, num_threads: i32) -> TestRunner {
    let invc = invocations();
    let (manager, results) = recording_manager();
    let config = Config::builder()
        .name(name)
        .num_threads(num_threads)
        .max_threads(8)
        .termination_poll_interval(Duration::from_millis(20))
        .build();

    TestRunner {
        runner: JobRunner::new(config, handlers(&invc), manager),
        invc,
        results,
    }
}

pub struct Peer {
    pub engine: Arc<ScriptingEngine>,
    pub invc: Invocations,
    pub results: Results,
    pub handle: JoinHandle<()>,
}

pub fn spawn_peer(network: &LocalNetwork, address: &str, role: Role) -> Peer {
    let invc = invocations();
    let (manager, results) = recording_manager();
    let config = EngineConfig::builder()
        .address(address)
        .role(role)
        .num_threads(2)
        .response_attempts(50)
        .response_attempt_interval(Duration::from_millis(100))
        .runner(
            Config::builder()
                .termination_poll_interval(Duration::from_millis(20))
                .build(),
        )
        .build();

    let engine = ScriptingEngine::new(
        config,
        handlers(&invc),
        manager,
        Arc::new(network.clone()),
    );
    let inbox = network.bind(address).expect("bind address");
    let handle = engine.start(inbox);

    Peer {
        engine,
        invc,
        results,
        handle,
    }
}

/// Polls `check` until it holds or five seconds have passed.
pub async fn wait_until(check: impl Fn() -> bool) -> bool {
    let start = SystemTime::now();
    while SystemTime::now().duration_since(start).unwrap() < Duration::from_secs(5) {
        if check() {
            return true;
        }
        sleep_ms(20).await;
    }
    check()
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await
}
