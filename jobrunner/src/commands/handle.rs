use std::sync::Arc;
use tracing::Instrument;

use super::{Command, CommandKind, PayloadObject};
use crate::{engine::ScriptingEngine, runner::JobRunner};

pub(crate) async fn handle_command(
    engine: &Arc<ScriptingEngine>,
    command: Command,
) -> anyhow::Result<()> {
    match (command.kind(), command.is_request()) {
        (CommandKind::Ping, true) => {
            tracing::debug!("[{}] Ping from {:?}", engine.address(), command.reply_to());

            let mut response = command.respond();
            response.set_response_objects(vec![PayloadObject::Text(engine.address().to_string())]);
            engine.send_response(&command, response).await
        }
        (CommandKind::JobRunner, true) => handle_job_runner_request(engine, command),
        (CommandKind::JobRunner, false) => {
            handle_job_runner_response(engine, &command);
            engine.response_received(&command);
            Ok(())
        }
        (CommandKind::RegisterWorker, true) => match command.address() {
            Some(address) => engine.register_worker(address),
            None => anyhow::bail!("No worker address"),
        },
        (CommandKind::DeregisterWorker, true) => {
            match command.address() {
                Some(address) => {
                    engine.deregister_worker(address);
                }
                None => tracing::debug!("[{}] Nothing to deregister", engine.address()),
            }
            Ok(())
        }
        (CommandKind::KillWorkers, true) => {
            tracing::info!("[{}] Kill request received, stopping", engine.address());
            engine.shutdown();
            Ok(())
        }
        (_, false) => {
            engine.response_received(&command);
            Ok(())
        }
    }
}

/// Executes the runner on the engine's executor and sends it back, now
/// holding the results of its jobs.
fn handle_job_runner_request(engine: &Arc<ScriptingEngine>, command: Command) -> anyhow::Result<()> {
    let snapshot = command
        .runner()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("No job runner"))?;
    let job_engine = engine.clone();

    let job = async move {
        let runner = JobRunner::from_snapshot(
            snapshot,
            job_engine.config().runner.clone(),
            job_engine.handlers().clone(),
            job_engine.completion().clone(),
        );
        tracing::info!(
            "[{}] Executing runner {} with {} jobs",
            job_engine.address(),
            runner.config().name,
            runner.queued()
        );

        runner.start();
        runner.stop().await;

        let mut response = command.respond();
        response.set_response_objects(vec![PayloadObject::Runner(runner.snapshot())]);
        job_engine.send_response(&command, response).await
    }
    .instrument(tracing::Span::current());

    engine.execute_job(Box::pin(job))
}

/// Reports the results of a runner executed elsewhere to the local listeners.
fn handle_job_runner_response(engine: &ScriptingEngine, command: &Command) {
    if let Some(snapshot) = command.runner() {
        tracing::info!(
            "[{}] Runner {} returned, {} jobs completed, {} not executed",
            engine.address(),
            snapshot.name,
            snapshot.completed.len(),
            snapshot.pending.len()
        );

        for (job, result) in snapshot.results() {
            engine.completion().notify(job, result);
        }
    }
}
