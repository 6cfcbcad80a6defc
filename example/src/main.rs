use bg::*;
use jobrunner::{
    connection::LocalNetwork,
    engine::{EngineConfig, Role, ScriptingEngine},
    hooks::{HookTable, ShutdownHook, ShutdownHooks},
    Config, Job, JobCompleteManager, JobResult, JobRunner,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod bg;

fn engine(network: &LocalNetwork, address: &str, role: Role) -> anyhow::Result<Arc<ScriptingEngine>> {
    let completion = Arc::new(JobCompleteManager::new());
    completion.add_listener(Arc::new(|job: &Job, result: &JobResult| {
        tracing::info!("Job {} ({}) finished: {}", job.id, job.payload_type, result.info);
    }));

    let engine = ScriptingEngine::new(
        EngineConfig::builder().address(address).role(role).build(),
        Arc::new(handlers()),
        completion,
        Arc::new(network.clone()),
    );
    engine.start(network.bind(address)?);
    Ok(engine)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobrunner=debug,jobrunner_example=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let network = LocalNetwork::new();
    let master = engine(&network, "master", Role::Master)?;
    let worker = engine(&network, "worker-1", Role::Worker)?;

    worker.register_with("master").await?;
    tracing::info!("Ping: {}", master.ping("worker-1").await?);

    let runner = JobRunner::new(
        Config::builder().name("demo").num_threads(2).build(),
        Arc::new(handlers()),
        Arc::new(JobCompleteManager::new()),
    );
    runner.add(Job::new(&SampleMessage { txt: "hello".into() })?);
    runner.add(Job::new(&SlowMessage {
        txt: "slow".into(),
        delay_ms: 500,
    })?);

    let executed = master.run_remote(&runner).await?;
    for (job, result) in executed.results() {
        tracing::info!("Remote job {}: success={} {}", job.id, result.success, result.info);
    }

    let table = HookTable::new().register("metrics", || {
        ShutdownHook::new("metrics", || match jobrunner::get_metrics() {
            Ok(metrics) => println!("{}", metrics),
            Err(e) => tracing::error!("Unable to export metrics: {:#}", e),
        })
    });
    let hooks = ShutdownHooks::new();
    hooks.install_from(&table);

    tracing::info!("Press Ctrl+C to exit");
    hooks.run_on_ctrl_c().await?;

    master.kill_workers().await;
    worker.stop().await;
    master.stop().await;
    Ok(())
}
