//! Guest log forwarding.
//!
//! The guest compute service connects to the log port once and writes JSON
//! lines. Each line becomes a `GuestLog` event on the VM's diagnostic sink.

use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::hvsock::{HvSocketListener, HvSocketStream};
use crate::trace::{Field, Level, Span};

/// Longest guest log line kept, in bytes. Longer lines are dropped whole.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Take ownership of `listener` and forward the first connection's output.
///
/// The task ends when the guest closes the connection or on the first
/// error; either way `span` is closed. Errors only reach the sink.
pub(super) fn spawn(mut listener: Box<dyn HvSocketListener>, span: Span) -> JoinHandle<()> {
    tokio::spawn(async move {
        let addr = listener.addr();
        let stream = match listener.accept().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "Failed to accept guest log connection");
                span.end(Some(&e));
                return;
            }
        };
        drop(listener);
        span.debug("GuestLogConnected", vec![Field::new("addr", addr)]);

        match forward(stream, &span, MAX_LINE_BYTES).await {
            Ok(lines) => {
                tracing::debug!(addr = %addr, lines, "Guest log connection closed");
                span.end(None);
            }
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "Guest log read failed");
                span.end(Some(&e));
            }
        }
    })
}

async fn forward(stream: HvSocketStream, span: &Span, max_line: usize) -> std::io::Result<usize> {
    let mut framed = FramedRead::new(stream, LinesCodec::new_with_max_length(max_line));
    let mut lines = 0;
    let mut after_overflow = false;
    loop {
        let line = match framed.next().await {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                span.warn("GuestLogLineDropped", vec![Field::new("max_bytes", max_line)]);
                after_overflow = true;
                continue;
            }
            Some(Err(LinesCodecError::Io(e))) => return Err(e),
            // The framed reader yields one `None` after a decode error and
            // then resumes; a second `None` is the real end of stream.
            None if after_overflow => {
                after_overflow = false;
                continue;
            }
            None => return Ok(lines),
        };
        after_overflow = false;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        lines += 1;
        emit_line(span, line);
    }
}

/// Map one guest log line to an event. Lines that are not JSON objects are
/// forwarded verbatim at info level.
fn emit_line(span: &Span, line: &str) {
    let Ok(Value::Object(entry)) = serde_json::from_str::<Value>(line) else {
        span.info("GuestLog", vec![Field::new("msg", line)]);
        return;
    };

    let level = entry
        .get("level")
        .and_then(Value::as_str)
        .map(guest_level)
        .unwrap_or(Level::Info);

    let fields = entry
        .iter()
        .filter(|(name, _)| name.as_str() != "level")
        .map(|(name, value)| match value {
            Value::String(s) => Field::new(name.as_str(), s),
            other => Field::new(name.as_str(), other),
        })
        .collect();

    match level {
        Level::Error => span.error("GuestLog", fields),
        Level::Warn => span.warn("GuestLog", fields),
        Level::Info => span.info("GuestLog", fields),
        Level::Debug => span.debug("GuestLog", fields),
    }
}

fn guest_level(raw: &str) -> Level {
    match raw.to_ascii_lowercase().as_str() {
        "panic" | "fatal" | "error" => Level::Error,
        "warn" | "warning" => Level::Warn,
        "debug" | "trace" => Level::Debug,
        _ => Level::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::trace::MemorySink;

    #[test]
    fn test_json_line_keeps_level_and_fields() {
        let sink = Arc::new(MemorySink::default());
        let span = Span::root(sink.clone(), "logs", vec![]);

        emit_line(&span, r#"{"level":"warning","msg":"disk slow","pid":7}"#);

        let events = sink.named("GuestLog");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, Level::Warn);
        assert_eq!(events[0].field("msg"), Some("disk slow"));
        assert_eq!(events[0].field("pid"), Some("7"));
        assert_eq!(events[0].field("level"), None);
    }

    #[test]
    fn test_plain_line_is_info() {
        let sink = Arc::new(MemorySink::default());
        let span = Span::root(sink.clone(), "logs", vec![]);

        emit_line(&span, "not json");

        let events = sink.named("GuestLog");
        assert_eq!(events[0].level, Level::Info);
        assert_eq!(events[0].field("msg"), Some("not json"));
    }

    #[tokio::test]
    async fn test_forward_counts_non_empty_lines() {
        let sink = Arc::new(MemorySink::default());
        let span = Span::root(sink.clone(), "logs", vec![]);
        let input: &[u8] = b"{\"level\":\"error\",\"msg\":\"a\"}\n\nplain\n";

        let lines = forward(Box::new(input), &span, MAX_LINE_BYTES).await.unwrap();

        assert_eq!(lines, 2);
        assert_eq!(sink.at_level(Level::Error).len(), 1);
    }

    #[tokio::test]
    async fn test_forward_drops_overlong_line_and_continues() {
        let sink = Arc::new(MemorySink::default());
        let span = Span::root(sink.clone(), "logs", vec![]);
        let mut input = vec![b'x'; 256];
        input.extend_from_slice(b"\nshort\n");

        let lines = forward(Box::new(std::io::Cursor::new(input)), &span, 32).await.unwrap();

        assert_eq!(lines, 1);
        let forwarded = sink.named("GuestLog");
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].field("msg"), Some("short"));
        assert_eq!(sink.named("GuestLogLineDropped").len(), 1);
        assert!(
            sink.events()
                .iter()
                .all(|e| e.fields.iter().all(|f| f.value.len() <= 32))
        );
    }
}
