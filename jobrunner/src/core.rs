use anyhow::Context;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, future::Future, marker::PhantomData, sync::Arc};

use crate::{encoder, models::JobResult};

/// A message that can be used as the payload of a [`Job`](crate::Job)
pub trait JobParameter
where
    Self: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Name the handler of this payload is registered under.
    fn ptype() -> &'static str;

    fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        encoder::encode(self)
    }

    fn from_bytes(payload: &[u8]) -> anyhow::Result<Self> {
        encoder::decode(payload)
    }
}

/// Does the actual work of jobs carrying a `Payload`.
///
/// For every job the phases run in this order: `pre_check`, `process`,
/// `post_check` and finally `clean_up`, which runs whatever the outcome of
/// the other phases was. An error in any phase fails the job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: JobParameter;

    fn pre_check(&self, _payload: &Self::Payload) -> anyhow::Result<()> {
        Ok(())
    }

    /// The returned text becomes the info of the job's result.
    async fn process(&self, payload: &Self::Payload) -> anyhow::Result<String>;

    fn post_check(&self, _payload: &Self::Payload) -> anyhow::Result<()> {
        Ok(())
    }

    fn clean_up(&self, _payload: &Self::Payload) {}

    /// Sets the retry hint of a failed result.
    fn should_retry(&self, _error: &anyhow::Error) -> bool {
        false
    }
}

#[async_trait]
trait Dispatch: Send + Sync {
    async fn dispatch(&self, payload: &[u8]) -> JobResult;
}

struct Typed<H>(H);

#[async_trait]
impl<H: JobHandler> Dispatch for Typed<H> {
    async fn dispatch(&self, payload: &[u8]) -> JobResult {
        let payload = match H::Payload::from_bytes(payload) {
            Ok(payload) => payload,
            Err(e) => {
                return JobResult::failure(format!("Unable to decode job payload: {:#}", e))
            }
        };

        let outcome = async {
            self.0.pre_check(&payload).context("pre-check failed")?;
            let info = self.0.process(&payload).await?;
            self.0.post_check(&payload).context("post-check failed")?;
            Ok::<_, anyhow::Error>(info)
        }
        .await;

        self.0.clean_up(&payload);

        match outcome {
            Ok(info) => JobResult::success(info),
            Err(e) => JobResult::failure(format!("{:#}", e)).with_retry(self.0.should_retry(&e)),
        }
    }
}

/// Wraps a closure as a [`JobHandler`], see [`HandlerRegistry::register_fn`].
pub struct FnHandler<P, F> {
    f: F,
    _payload: PhantomData<fn(P)>,
}

#[async_trait]
impl<P, F, Fut> JobHandler for FnHandler<P, F>
where
    P: JobParameter + Clone,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send,
{
    type Payload = P;

    async fn process(&self, payload: &P) -> anyhow::Result<String> {
        (self.f)(payload.clone()).await
    }
}

/// Maps the payload type of a job to the handler executing it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Dispatch>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: JobHandler>(mut self, handler: H) -> Self {
        let ptype = <H::Payload as JobParameter>::ptype();
        if self
            .handlers
            .insert(ptype.to_string(), Arc::new(Typed(handler)))
            .is_some()
        {
            tracing::warn!("Handler for job type {} replaced", ptype);
        }
        self
    }

    pub fn register_fn<P, F, Fut>(self, f: F) -> Self
    where
        P: JobParameter + Clone,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send,
    {
        self.register(FnHandler {
            f,
            _payload: PhantomData,
        })
    }

    pub fn contains(&self, ptype: &str) -> bool {
        self.handlers.contains_key(ptype)
    }

    pub fn payload_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub(crate) async fn dispatch(&self, ptype: &str, payload: &[u8]) -> JobResult {
        match self.handlers.get(ptype) {
            Some(handler) => handler.dispatch(payload).await,
            None => JobResult::failure(format!("No handler registered for job type {}", ptype)),
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
