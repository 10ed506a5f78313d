//! Diagnostics for utility VM operations.
//!
//! Nothing here is process-global: a [`DiagnosticSink`] is handed to the
//! source factory and from there to every utility VM it produces. Events are
//! written in the context of a [`Span`].
//!
//! - [`TracingSink`]: forwards events to `tracing` with structured fields
//! - [`NoopSink`]: drops everything
//! - [`MemorySink`]: keeps events in memory so tests can assert on them

mod span;

pub use span::{Field, Level, Span};

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

/// A diagnostic event written in the context of a span.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub level: Level,
    pub span_name: String,
    pub span_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub baggage: Vec<Field>,
    pub fields: Vec<Field>,
}

impl Event {
    /// Look up an event field, then the span baggage.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .chain(self.baggage.iter())
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }
}

/// Destination for diagnostic events.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn DiagnosticSink>;

struct FieldList<'a>(&'a [Field]);

impl fmt::Display for FieldList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", field.name, field.value)?;
        }
        Ok(())
    }
}

/// Writes events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, event: Event) {
        let parent = event.parent_id.map(|id| id.to_string()).unwrap_or_default();
        let baggage = FieldList(&event.baggage);
        let fields = FieldList(&event.fields);
        match event.level {
            Level::Error => tracing::error!(
                span = %event.span_name,
                span_id = %event.span_id,
                parent_id = %parent,
                baggage = %baggage,
                fields = %fields,
                "{}", event.name
            ),
            Level::Warn => tracing::warn!(
                span = %event.span_name,
                span_id = %event.span_id,
                parent_id = %parent,
                baggage = %baggage,
                fields = %fields,
                "{}", event.name
            ),
            Level::Info => tracing::info!(
                span = %event.span_name,
                span_id = %event.span_id,
                parent_id = %parent,
                baggage = %baggage,
                fields = %fields,
                "{}", event.name
            ),
            Level::Debug => tracing::debug!(
                span = %event.span_name,
                span_id = %event.span_id,
                parent_id = %parent,
                baggage = %baggage,
                fields = %fields,
                "{}", event.name
            ),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DiagnosticSink for NoopSink {
    fn emit(&self, _event: Event) {}
}

/// Records every event.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events with the given name, in emission order.
    pub fn named(&self, name: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    pub fn at_level(&self, level: Level) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.level == level)
            .cloned()
            .collect()
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}
