//! Telemetry sink abstraction
//!
//! Executors report start/complete/fail events and duration metrics through
//! a [`TelemetrySink`]. Reporting is fire-and-forget: sink methods return
//! nothing, and the [`Telemetry`] facade contains panics raised by a sink so
//! that telemetry can never fail the operation being observed.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::ErrorRecord;

/// Attribute map attached to events
pub type Attributes = BTreeMap<String, Value>;

/// Build an [`Attributes`] map from key/value pairs
#[macro_export]
macro_rules! attrs {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut map = $crate::telemetry::Attributes::new();
        $( map.insert($key.to_string(), ::serde_json::json!($value)); )*
        map
    }};
}

/// Receiver of telemetry
pub trait TelemetrySink: Send + Sync {
    /// Record a named event with attributes
    fn event(&self, name: &str, attrs: &Attributes);

    /// Record a metric sample
    fn metric(&self, name: &str, value: f64, tags: &Attributes);

    /// Record an error with attributes
    fn error(&self, error: &ErrorRecord, attrs: &Attributes);
}

/// Cheaply cloneable handle to a sink that never lets sink failures escape
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    /// Telemetry that forwards to `tracing`
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingTelemetry))
    }

    /// Telemetry that discards everything
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopTelemetry))
    }

    pub fn event(&self, name: &str, attrs: &Attributes) {
        self.guard(name, || self.sink.event(name, attrs));
    }

    pub fn metric(&self, name: &str, value: f64, tags: &Attributes) {
        self.guard(name, || self.sink.metric(name, value, tags));
    }

    pub fn error(&self, error: &ErrorRecord, attrs: &Attributes) {
        self.guard(error.kind().name(), || self.sink.error(error, attrs));
    }

    fn guard(&self, name: &str, report: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(report)).is_err() {
            warn!(name, "Telemetry sink panicked; report dropped");
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::tracing()
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

/// Sink that forwards to `tracing` with structured fields
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn event(&self, name: &str, attrs: &Attributes) {
        let attrs = Value::from(attrs_to_map(attrs));
        if name.ends_with(".fail") {
            info!(event = name, %attrs, "telemetry event");
        } else {
            debug!(event = name, %attrs, "telemetry event");
        }
    }

    fn metric(&self, name: &str, value: f64, tags: &Attributes) {
        let tags = Value::from(attrs_to_map(tags));
        debug!(metric = name, value, %tags, "telemetry metric");
    }

    fn error(&self, error: &ErrorRecord, attrs: &Attributes) {
        let attrs = Value::from(attrs_to_map(attrs));
        warn!(
            kind = error.kind().name(),
            target = error.target(),
            retryable = error.is_retryable(),
            %attrs,
            "{}",
            error.message()
        );
    }
}

fn attrs_to_map(attrs: &Attributes) -> serde_json::Map<String, Value> {
    attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn event(&self, _name: &str, _attrs: &Attributes) {}
    fn metric(&self, _name: &str, _value: f64, _tags: &Attributes) {}
    fn error(&self, _error: &ErrorRecord, _attrs: &Attributes) {}
}

/// A recorded telemetry entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Event {
        name: String,
        attrs: Attributes,
        at: DateTime<Utc>,
    },
    Metric {
        name: String,
        value: f64,
        tags: Attributes,
    },
    Error {
        kind: String,
        message: String,
        attrs: Attributes,
    },
}

/// In-memory sink, useful for inspection in tests and embedding
#[derive(Debug, Default)]
pub struct InMemoryTelemetry {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records in arrival order
    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().clone()
    }

    /// Names of recorded events in arrival order
    pub fn event_names(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                TelemetryRecord::Event { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of events recorded under `name`
    pub fn count_events(&self, name: &str) -> usize {
        self.event_names().iter().filter(|n| *n == name).count()
    }

    /// Recorded error kinds in arrival order
    pub fn error_kinds(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                TelemetryRecord::Error { kind, .. } => Some(kind.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl TelemetrySink for InMemoryTelemetry {
    fn event(&self, name: &str, attrs: &Attributes) {
        self.records.lock().push(TelemetryRecord::Event {
            name: name.to_string(),
            attrs: attrs.clone(),
            at: Utc::now(),
        });
    }

    fn metric(&self, name: &str, value: f64, tags: &Attributes) {
        self.records.lock().push(TelemetryRecord::Metric {
            name: name.to_string(),
            value,
            tags: tags.clone(),
        });
    }

    fn error(&self, error: &ErrorRecord, attrs: &Attributes) {
        self.records.lock().push(TelemetryRecord::Error {
            kind: error.kind().name().to_string(),
            message: error.message().to_string(),
            attrs: attrs.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickingSink;

    impl TelemetrySink for PanickingSink {
        fn event(&self, _name: &str, _attrs: &Attributes) {
            panic!("sink down");
        }
        fn metric(&self, _name: &str, _value: f64, _tags: &Attributes) {
            panic!("sink down");
        }
        fn error(&self, _error: &ErrorRecord, _attrs: &Attributes) {
            panic!("sink down");
        }
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        let telemetry = Telemetry::new(Arc::new(PanickingSink));
        telemetry.event("tool.start", &attrs! { "target" => "search" });
        telemetry.metric("tool.duration_ms", 12.0, &Attributes::new());
        telemetry.error(&ErrorRecord::config("bad"), &Attributes::new());
    }

    #[test]
    fn test_in_memory_records() {
        let sink = Arc::new(InMemoryTelemetry::new());
        let telemetry = Telemetry::new(sink.clone());

        telemetry.event("llm.start", &attrs! { "target" => "gpt", "attempt" => 1 });
        telemetry.event("llm.complete", &Attributes::new());
        telemetry.metric("llm.duration_ms", 5.0, &Attributes::new());
        telemetry.error(&ErrorRecord::config("bad"), &Attributes::new());

        assert_eq!(sink.event_names(), vec!["llm.start", "llm.complete"]);
        assert_eq!(sink.count_events("llm.start"), 1);
        assert_eq!(sink.error_kinds(), vec!["ConfigError"]);
        assert_eq!(sink.records().len(), 4);

        sink.clear();
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_attrs_macro() {
        let attrs = attrs! { "target" => "search", "elapsed_ms" => 15u64 };
        assert_eq!(attrs["target"], Value::from("search"));
        assert_eq!(attrs["elapsed_ms"], Value::from(15u64));
    }
}
