//! Spans: named operations with an id, an optional parent and inherited
//! baggage.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use super::{DiagnosticSink, Event};

/// Severity of a diagnostic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
        };
        f.write_str(s)
    }
}

/// A single named value attached to an event or carried as baggage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub value: String,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl fmt::Display) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }
}

/// An operation over a period of time.
///
/// Opening a span writes `SpanStart`; [`Span::end`] writes `SpanEnd`, at
/// error level when the operation failed. Children inherit the parent's
/// baggage and record its id.
#[derive(Clone)]
pub struct Span {
    sink: Arc<dyn DiagnosticSink>,
    name: String,
    id: Uuid,
    parent_id: Option<Uuid>,
    baggage: Vec<Field>,
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("baggage", &self.baggage)
            .finish()
    }
}

impl Span {
    /// Open a span with no parent.
    pub fn root(sink: Arc<dyn DiagnosticSink>, name: impl Into<String>, baggage: Vec<Field>) -> Self {
        let span = Self {
            sink,
            name: name.into(),
            id: Uuid::new_v4(),
            parent_id: None,
            baggage,
        };
        span.start();
        span
    }

    /// Open a child span.
    pub fn child(&self, name: impl Into<String>, baggage: Vec<Field>) -> Self {
        let mut inherited = self.baggage.clone();
        inherited.extend(baggage);
        let span = Self {
            sink: Arc::clone(&self.sink),
            name: name.into(),
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            baggage: inherited,
        };
        span.start();
        span
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn baggage(&self) -> &[Field] {
        &self.baggage
    }

    fn start(&self) {
        self.log("SpanStart", Level::Info, vec![Field::new("Name", &self.name)]);
    }

    /// Close the span, recording the error if the operation failed.
    pub fn end(self, error: Option<&dyn std::error::Error>) {
        let mut fields = vec![Field::new("Name", &self.name)];
        let level = match error {
            Some(e) => {
                fields.push(Field::new("Error", e));
                Level::Error
            }
            None => Level::Info,
        };
        self.log("SpanEnd", level, fields);
    }

    /// Close the span with the outcome of `result`.
    pub fn end_with<T, E: std::error::Error>(self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.end(None),
            Err(e) => self.end(Some(e)),
        }
    }

    pub fn error(&self, name: &str, fields: Vec<Field>) {
        self.log(name, Level::Error, fields);
    }

    pub fn warn(&self, name: &str, fields: Vec<Field>) {
        self.log(name, Level::Warn, fields);
    }

    pub fn info(&self, name: &str, fields: Vec<Field>) {
        self.log(name, Level::Info, fields);
    }

    pub fn debug(&self, name: &str, fields: Vec<Field>) {
        self.log(name, Level::Debug, fields);
    }

    fn log(&self, name: &str, level: Level, fields: Vec<Field>) {
        self.sink.emit(Event {
            name: name.to_string(),
            level,
            span_name: self.name.clone(),
            span_id: self.id,
            parent_id: self.parent_id,
            baggage: self.baggage.clone(),
            fields,
        });
    }
}
