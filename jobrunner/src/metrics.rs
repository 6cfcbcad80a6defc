use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

lazy_static! {
    pub(crate) static ref COUNTER: Metrics = Metrics::new();
}

/// Counters for executed jobs, labelled by payload type, and handled
/// commands, labelled by kind.
pub(crate) struct Metrics {
    jobs_executed: IntCounterVec,
    jobs_failed: IntCounterVec,
    commands_handled: IntCounterVec,
    commands_failed: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let counter = |name: &str, help: &str, label: &str| {
            register_int_counter_vec!(name, help, &[label])
                .unwrap_or_else(|e| panic!("metric {} cannot be registered: {}", name, e))
        };

        Metrics {
            jobs_executed: counter("jobrunner_jobs_executed", "jobs executed", "type"),
            jobs_failed: counter("jobrunner_jobs_failed", "jobs finished unsuccessfully", "type"),
            commands_handled: counter("jobrunner_commands_handled", "commands received", "kind"),
            commands_failed: counter(
                "jobrunner_commands_failed",
                "commands rejected or failed",
                "kind",
            ),
        }
    }

    pub fn job_finished(&self, payload_type: &str, success: bool) {
        self.jobs_executed.with_label_values(&[payload_type]).inc();
        if !success {
            self.jobs_failed.with_label_values(&[payload_type]).inc();
        }
    }

    pub fn command_received(&self, kind: &str) {
        self.commands_handled.with_label_values(&[kind]).inc();
    }

    pub fn command_failed(&self, kind: &str) {
        self.commands_failed.with_label_values(&[kind]).inc();
    }

    /// Text exposition of everything registered with the default registry.
    pub fn output(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }
}
