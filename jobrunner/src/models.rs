use anyhow::Context;
use futures::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc};

use crate::{
    core::{HandlerRegistry, JobParameter},
    listener::JobCompleteListener,
    metrics, JobId, UtcDateTime,
};

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotStarted,
    Running,
    Complete,
    Failed,
}

impl Stage {
    pub fn transition(self) -> Stage {
        match self {
            Stage::NotStarted => Stage::Running,
            Stage::Running => self,
            Stage::Complete | Stage::Failed => self, /* Terminal */
        }
    }

    pub fn transition_finished(self, success: bool) -> Stage {
        match (self, success) {
            (Stage::Running, true) => Stage::Complete,
            (Stage::Running, false) => Stage::Failed,
            _ => self,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Failed)
    }
}

/// Outcome of one execution of a [`Job`].
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct JobResult {
    pub info: String,
    pub success: bool,

    /// Advisory only, nothing resubmits a job on its own.
    #[serde(default)]
    pub retry: bool,

    pub date: UtcDateTime,
}

impl JobResult {
    pub fn success(info: impl Into<String>) -> Self {
        Self {
            info: info.into(),
            success: true,
            retry: false,
            date: chrono::Utc::now(),
        }
    }

    pub fn failure(info: impl Into<String>) -> Self {
        let mut info = info.into();
        if info.is_empty() {
            info = "Job failed".to_string();
        }

        Self {
            info,
            success: false,
            retry: false,
            date: chrono::Utc::now(),
        }
    }

    pub fn with_retry(self, retry: bool) -> Self {
        Self { retry, ..self }
    }

    /// The info of a failed result, `None` on success.
    pub fn failure_info(&self) -> Option<&str> {
        match self.success {
            true => None,
            false => Some(&self.info),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct Job {
    pub id: JobId,

    pub payload_type: String,
    pub payload: Vec<u8>,

    pub(crate) stage: Stage,
    pub(crate) result: Option<JobResult>,
    pub date_added: UtcDateTime,

    #[serde(skip)]
    listener: Option<Arc<dyn JobCompleteListener>>,
}

impl Job {
    pub fn new<P: JobParameter>(message: &P) -> anyhow::Result<Self> {
        Ok(Self {
            id: JobId(crate::generate_id()),
            payload_type: P::ptype().to_string(),
            payload: message
                .to_bytes()
                .context("Unable to serialize the message to bytes")?,
            stage: Stage::NotStarted,
            result: None,
            date_added: chrono::Utc::now(),
            listener: None,
        })
    }

    /// Listener notified once this job's result is known,
    /// after the listeners of the runner's [`JobCompleteManager`](crate::JobCompleteManager).
    pub fn with_listener(mut self, listener: Arc<dyn JobCompleteListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn listener(&self) -> Option<&Arc<dyn JobCompleteListener>> {
        self.listener.as_ref()
    }

    pub(crate) fn take_listener(&mut self) -> Option<Arc<dyn JobCompleteListener>> {
        self.listener.take()
    }

    pub fn payload<P: JobParameter>(&self) -> anyhow::Result<P> {
        if self.payload_type != P::ptype() {
            anyhow::bail!(
                "Job {} carries a {} payload, not {}",
                self.id,
                self.payload_type,
                P::ptype()
            );
        }
        P::from_bytes(&self.payload)
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn result(&self) -> Option<&JobResult> {
        self.result.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.stage.is_finished()
    }

    /// Runs all phases of the job. Errors and panics end up in the failed
    /// result, they never reach the caller.
    pub async fn execute(&mut self, handlers: &HandlerRegistry) -> JobResult {
        self.stage = self.stage.transition();
        tracing::debug!("Job {}: Running [{}]", self.id, self.payload_type);

        let outcome = AssertUnwindSafe(handlers.dispatch(&self.payload_type, &self.payload))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => JobResult::failure(format!(
                "Job panicked: {}",
                crate::panic_message(&panic)
            )),
        };

        metrics::COUNTER.job_finished(&self.payload_type, result.success);
        if let Some(info) = result.failure_info() {
            tracing::debug!("Job {}: Failed: {}", self.id, info);
        }

        self.stage = self.stage.transition_finished(result.success);
        self.result = Some(result.clone());

        result
    }

    pub fn clear_payload(&mut self) {
        self.payload = Vec::new();
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("payload_type", &self.payload_type)
            .field("payload_len", &self.payload.len())
            .field("stage", &self.stage)
            .field("result", &self.result)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

/// Jobs submitted together, in insertion order.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
pub struct JobList(Vec<Job>);

impl JobList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) {
        self.0.push(job);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.0.iter()
    }
}

impl From<Vec<Job>> for JobList {
    fn from(jobs: Vec<Job>) -> Self {
        Self(jobs)
    }
}

impl FromIterator<Job> for JobList {
    fn from_iter<I: IntoIterator<Item = Job>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for JobList {
    type Item = Job;
    type IntoIter = std::vec::IntoIter<Job>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// What travels over the wire when a whole runner is shipped to a peer.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub struct RunnerSnapshot {
    pub name: String,
    pub num_threads: i32,

    pub pending: Vec<Job>,
    pub completed: Vec<Job>,
}

impl RunnerSnapshot {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn results(&self) -> impl Iterator<Item = (&Job, &JobResult)> {
        self.completed
            .iter()
            .filter_map(|job| job.result().map(|result| (job, result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_transitions() {
        let stage = Stage::NotStarted.transition();
        assert_eq!(Stage::Running, stage);
        assert_eq!(Stage::Complete, stage.transition_finished(true));
        assert_eq!(Stage::Failed, stage.transition_finished(false));

        // not started jobs cannot finish
        assert_eq!(Stage::NotStarted, Stage::NotStarted.transition_finished(true));
        assert_eq!(Stage::Failed, Stage::Failed.transition());
    }

    #[test]
    fn failure_always_has_info() {
        let result = JobResult::failure("");

        assert!(!result.success);
        assert!(!result.info.is_empty());
        assert_eq!(Some(result.info.as_str()), result.failure_info());
        assert_eq!(None, JobResult::success("").failure_info());
    }

    #[test]
    fn job_list_keeps_order() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Num(u32);
        impl JobParameter for Num {
            fn ptype() -> &'static str {
                "num"
            }
        }

        let jobs = (0..5)
            .map(|i| Job::new(&Num(i)).expect("create job"))
            .collect::<JobList>();
        let order = jobs
            .iter()
            .map(|job| job.payload::<Num>().expect("decode").0)
            .collect::<Vec<_>>();

        assert_eq!(vec![0, 1, 2, 3, 4], order);
    }
}
