use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, PoisonError, RwLock},
};

use crate::models::{Job, JobResult};

/// Gets told about every finished job it is registered for.
pub trait JobCompleteListener: Send + Sync {
    fn job_completed(&self, job: &Job, result: &JobResult);
}

impl<F> JobCompleteListener for F
where
    F: Fn(&Job, &JobResult) + Send + Sync,
{
    fn job_completed(&self, job: &Job, result: &JobResult) {
        (self)(job, result)
    }
}

/// Fan-out of completion events to all registered listeners.
///
/// Built once by the application and handed to every runner and engine
/// that should report into it.
#[derive(Default)]
pub struct JobCompleteManager {
    listeners: RwLock<Vec<Arc<dyn JobCompleteListener>>>,
}

impl JobCompleteManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adding the same listener twice has no effect.
    pub fn add_listener(&self, listener: Arc<dyn JobCompleteListener>) {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn JobCompleteListener>) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        before != listeners.len()
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, job: &Job, result: &JobResult) {
        // listeners may register further listeners
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            notify_one(listener.as_ref(), job, result);
        }
    }
}

pub(crate) fn notify_one(listener: &dyn JobCompleteListener, job: &Job, result: &JobResult) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener.job_completed(job, result))) {
        tracing::error!(
            "Listener of job {} panicked: {}",
            job.id,
            crate::panic_message(&panic)
        );
    }
}

fn same_listener(a: &Arc<dyn JobCompleteListener>, b: &Arc<dyn JobCompleteListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
