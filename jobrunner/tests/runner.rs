use common::{
    command, create_runner, ids, invocations, name_of, recorded, sleep_ms, wait_until, Outcome,
};
use jobrunner::{
    executor::num_workers, Config, Job, JobCompleteManager, JobList, JobParameter, JobResult,
    JobRunner, RunnerState, Stage,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

mod common;

#[tokio::test]
async fn jobs_run_in_queue_order() {
    let t = create_runner("ordered", 1);
    let expected: Vec<String> = (0..5).map(|i| format!("job-{}", i)).collect();
    let jobs: Vec<Job> = expected
        .iter()
        .map(|name| command(name, Outcome::Success))
        .collect();
    let expected_ids = ids(&jobs);
    t.runner.add_list(JobList::from(jobs));

    t.runner.start();
    t.runner.stop().await;

    assert_eq!(expected, recorded(&t.invc));
    assert_eq!(expected_ids, ids(&t.runner.completed_jobs()));
    assert_eq!(0, t.runner.queued());
}

#[tokio::test]
async fn jobs_wait_for_start() {
    let t = create_runner("waiting", 2);
    t.runner.add_list(JobList::from(vec![
        command("a", Outcome::Success),
        command("b", Outcome::Success),
    ]));

    sleep_ms(100).await;
    assert!(recorded(&t.invc).is_empty());
    assert_eq!(2, t.runner.queued());
    assert_eq!(RunnerState::Idle, t.runner.state());

    t.runner.start();
    t.runner.stop().await;
    assert_eq!(2, t.runner.completed_jobs().len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_job_is_dispatched_once() {
    let t = create_runner("concurrent", 4);
    t.runner.start();

    let mut producers = Vec::new();
    for p in 0..4 {
        let runner = t.runner.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..25 {
                runner.add(command(&format!("{}-{}", p, i), Outcome::Success));
                if i % 10 == 0 {
                    runner.start();
                }
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let runner = t.runner.clone();
    assert!(wait_until(move || runner.completed_jobs().len() == 100).await);
    t.runner.stop().await;

    let mut seen = recorded(&t.invc);
    assert_eq!(100, seen.len());
    seen.sort();
    seen.dedup();
    assert_eq!(100, seen.len());
    assert_eq!(100, t.results.lock().unwrap().len());
}

#[tokio::test]
async fn pause_holds_jobs_without_losing_them() {
    let t = create_runner("pausable", 1);
    t.runner.start();
    t.runner.pause_execution();
    assert_eq!(RunnerState::Paused, t.runner.state());

    for name in ["a", "b", "c"] {
        t.runner.add(command(name, Outcome::Success));
    }
    sleep_ms(150).await;
    assert!(recorded(&t.invc).is_empty());

    t.runner.resume_execution();
    let runner = t.runner.clone();
    assert!(wait_until(move || runner.completed_jobs().len() == 3).await);
    assert_eq!(vec!["a", "b", "c"], recorded(&t.invc));

    t.runner.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent() {
    let t = create_runner("stoppable", 2);
    t.runner.stop().await;
    assert_eq!(RunnerState::Idle, t.runner.state());

    t.runner.start();
    assert!(t.runner.is_running());
    t.runner.stop().await;
    t.runner.stop().await;
    assert_eq!(RunnerState::Idle, t.runner.state());

    // a stopped runner can be started again
    t.runner.add(command("again", Outcome::Success));
    t.runner.start();
    t.runner.stop().await;
    assert_eq!(vec!["again"], recorded(&t.invc));
}

#[tokio::test]
async fn stop_waits_for_sleeping_jobs() {
    let t = create_runner("sleepers", 3);
    for i in 0..3 {
        t.runner.add(command(&format!("sleep-{}", i), Outcome::Delay(200)));
    }

    t.runner.start();
    t.runner.stop().await;

    let completed = t.runner.completed_jobs();
    assert_eq!(3, completed.len());
    assert!(completed.iter().all(|job| job.stage() == Stage::Complete));
    assert!(completed
        .iter()
        .all(|job| job.result().map_or(false, |r| r.info.contains("slept 200ms"))));
    assert_eq!(3, t.results.lock().unwrap().len());
}

#[tokio::test]
async fn panicking_job_fails_and_runner_carries_on() {
    let t = create_runner("panics", 1);
    t.runner.add(command("boom", Outcome::Panic));
    t.runner.add(command("fine", Outcome::Success));

    t.runner.start();
    t.runner.stop().await;

    let completed = t.runner.completed_jobs();
    assert_eq!(2, completed.len());
    assert_eq!(Stage::Failed, completed[0].stage());
    let info = completed[0].result().unwrap().failure_info().unwrap();
    assert!(info.contains("boom panicked on purpose"), "{}", info);
    assert_eq!(Stage::Complete, completed[1].stage());

    t.runner.add(command("after", Outcome::Success));
    t.runner.start();
    t.runner.stop().await;
    assert_eq!(vec!["boom", "fine", "after"], recorded(&t.invc));

    let stats = t.runner.executor_stats();
    assert!(stats.is_none());
}

#[tokio::test]
async fn failure_carries_reason() {
    let t = create_runner("failing", 1);
    let job = command("broken", Outcome::Fail);
    let id = job.id.clone();
    t.runner.add(job);

    t.runner.start();
    t.runner.stop().await;

    let results = t.results.lock().unwrap();
    let (reported, result) = &results[0];
    assert_eq!(&id, reported);
    assert!(!result.success);
    assert!(result.info.contains("broken failed on purpose"));
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Unhandled;

impl JobParameter for Unhandled {
    fn ptype() -> &'static str {
        "unhandled"
    }
}

#[tokio::test]
async fn job_without_handler_fails() {
    let t = create_runner("unhandled", 1);
    t.runner.add(Job::new(&Unhandled).unwrap());

    t.runner.start();
    t.runner.stop().await;

    let completed = t.runner.completed_jobs();
    let result = completed[0].result().unwrap();
    assert!(!result.success);
    assert!(result.info.contains("No handler registered for job type unhandled"));
}

#[tokio::test]
async fn listener_can_chain_dependent_jobs() {
    let t = create_runner("chained", 2);
    let runner = t.runner.clone();
    let first = command("first", Outcome::Delay(50)).with_listener(Arc::new(
        move |job: &Job, result: &JobResult| {
            if result.success {
                runner.add(command(&format!("after-{}", name_of(job)), Outcome::Success));
            }
        },
    ));
    t.runner.add(first);
    t.runner.start();

    let runner = t.runner.clone();
    assert!(wait_until(move || runner.completed_jobs().len() == 2).await);
    t.runner.stop().await;

    assert_eq!(vec!["first", "after-first"], recorded(&t.invc));
    assert!(t.runner.completed_jobs()[0].listener().is_none());
}

#[tokio::test]
async fn terminate_drops_dispatched_jobs() {
    let t = create_runner("terminated", 1);
    for i in 0..3 {
        t.runner.add(command(&format!("slow-{}", i), Outcome::Delay(500)));
    }
    t.runner.start();

    let invc = t.invc.clone();
    assert!(wait_until(move || !invc.lock().unwrap().is_empty()).await);
    t.runner.terminate().await;

    assert_eq!(vec!["slow-0"], recorded(&t.invc));
    assert!(t.runner.completed_jobs().is_empty());
    assert_eq!(RunnerState::Idle, t.runner.state());
}

#[tokio::test]
async fn payloads_are_cleared_once_reported() {
    let t = create_runner("clearing", 1);
    let job = command("light", Outcome::Success);
    let id = job.id.clone();
    let payload = job.payload.clone();
    t.runner.add(job);

    t.runner.start();
    t.runner.stop().await;

    let completed = t.runner.take_completed();
    assert_eq!(1, completed.len());
    assert_eq!(id, completed[0].id);
    assert!(completed[0].payload.is_empty());
    assert!(completed[0].result().unwrap().success);
    assert!(t.runner.completed_jobs().is_empty());
    assert!(t.runner.snapshot().completed.is_empty());

    // payloads can still be kept on request
    let invc = invocations();
    let runner = JobRunner::new(
        Config::builder()
            .name("keeping")
            .num_threads(1)
            .clear_payloads(false)
            .build(),
        common::handlers(&invc),
        Arc::new(JobCompleteManager::new()),
    );
    runner.add(command("light", Outcome::Success));
    runner.start();
    runner.stop().await;

    let completed = runner.completed_jobs();
    assert_eq!(payload.len(), completed[0].payload.len());
    assert_eq!("light", name_of(&completed[0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn jobs_in_flight_finish_while_paused() {
    let t = create_runner("in-flight", 2);
    let n = num_workers(2, 8);
    for i in 0..n + 2 {
        t.runner.add(command(&format!("busy-{}", i), Outcome::Delay(200)));
    }
    t.runner.start();

    let invc = t.invc.clone();
    assert!(wait_until(move || invc.lock().unwrap().len() == n).await);
    t.runner.pause_execution();

    // started jobs run to completion, nothing new starts
    let runner = t.runner.clone();
    assert!(wait_until(move || runner.completed_jobs().len() == n).await);
    sleep_ms(150).await;
    assert_eq!(n, recorded(&t.invc).len());
    assert_eq!(n, t.results.lock().unwrap().len());

    t.runner.resume_execution();
    t.runner.stop().await;

    let completed = t.runner.completed_jobs();
    assert_eq!(n + 2, completed.len());
    assert!(completed.iter().all(|job| job.stage() == Stage::Complete));
    assert_eq!(n + 2, recorded(&t.invc).len());
}
