//! In-memory log ring buffer backing the `/log` endpoint.
//!
//! A [`LogBuffer`] keeps the most recent formatted log lines, capped by total
//! byte size. [`LogLayer`] plugs it into the `tracing` subscriber stack so
//! every event the agent emits also lands in the ring.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Upper bound on the buffered log payload returned by `/log`.
pub const LOG_CAP_BYTES: usize = 32 * 1024;

/// Bounded ring of formatted log lines.
#[derive(Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<Ring>>,
}

#[derive(Default)]
struct Ring {
    lines: VecDeque<String>,
    bytes: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line, evicting from the front past the byte cap.
    pub fn push(&self, line: String) {
        let mut ring = self.inner.lock();
        ring.bytes += line.len();
        ring.lines.push_back(line);
        while ring.bytes > LOG_CAP_BYTES {
            match ring.lines.pop_front() {
                Some(evicted) => ring.bytes -= evicted.len(),
                None => break,
            }
        }
    }

    /// Snapshot of the buffered lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.inner.lock().lines.iter().cloned().collect()
    }
}

/// `tracing` layer mirroring events into a [`LogBuffer`].
pub struct LogLayer {
    buffer: LogBuffer,
}

impl LogLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for LogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let line = format!(
            "{} {:>5} {}: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            meta.level(),
            meta.target(),
            visitor.message
        );
        self.buffer.push(line);
    }
}

/// Initialize the subscriber stack: env-filtered console output plus the
/// `/log` ring. Safe to call once per process; tests skip it and feed the
/// ring directly.
pub fn init(debug: bool) -> LogBuffer {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let buffer = LogBuffer::new();
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(LogLayer::new(buffer.clone()))
        .try_init();
    buffer
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            let _ = write!(self.message, "{}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            let _ = write!(self.message, "{}={}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_snapshot() {
        let buffer = LogBuffer::new();
        buffer.push("first".to_string());
        buffer.push("second".to_string());
        assert_eq!(buffer.lines(), vec!["first", "second"]);
    }

    #[test]
    fn test_eviction_keeps_total_under_cap() {
        let buffer = LogBuffer::new();
        let line = "x".repeat(1024);
        for _ in 0..100 {
            buffer.push(line.clone());
        }
        let total: usize = buffer.lines().iter().map(|l| l.len()).sum();
        assert!(total <= LOG_CAP_BYTES);
        assert!(!buffer.lines().is_empty());
    }

    #[test]
    fn test_oversized_single_line_does_not_wedge() {
        let buffer = LogBuffer::new();
        buffer.push("y".repeat(LOG_CAP_BYTES + 1));
        // The only line exceeds the cap on its own; the ring drains and
        // subsequent pushes still work.
        buffer.push("tail".to_string());
        assert!(buffer.lines().contains(&"tail".to_string()));
    }
}
