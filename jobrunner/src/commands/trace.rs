use opentelemetry::{
    propagation::{Extractor, Injector, TextMapPropagator},
    sdk::propagation::TraceContextPropagator,
};
use std::collections::HashMap;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::Command;

struct HeaderWriter<'a>(&'a mut HashMap<String, String>);

impl Injector for HeaderWriter<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

struct HeaderReader<'a>(&'a HashMap<String, String>);

impl Extractor for HeaderReader<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

impl Command {
    /// Stores the context of the current span so the receiver can continue the trace.
    pub fn inject_trace_context(&mut self) {
        let propagator = TraceContextPropagator::new();
        propagator.inject_context(&Span::current().context(), &mut HeaderWriter(&mut self.headers));
    }

    /// Makes `span` a child of the sender's span, if the sender sent one.
    pub fn attach_trace_context(&self, span: &Span) {
        if self.headers.is_empty() {
            return;
        }
        let propagator = TraceContextPropagator::new();
        span.set_parent(propagator.extract(&HeaderReader(&self.headers)));
    }
}
