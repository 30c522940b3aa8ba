use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Op is the pipeline stage which produced an Event.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    Render,
    Resolve,
    Exec,
}

/// Event is emitted after every render, resolve, and execution.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub op: Op,
    /// Template name (render), named SQL (resolve), or SQL (exec).
    pub subject: String,
    /// Produced SQL of a render or resolve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub begin_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<u64>,
    /// True if this execution attached to another caller's in-flight query.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub shared: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    pub fn begin(op: Op, subject: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            op,
            subject: subject.into(),
            output: None,
            begin_at: now,
            end_at: now,
            rows_affected: None,
            last_insert_id: None,
            shared: false,
            error: None,
        }
    }

    /// Stamp the end time and the `error` of a completed operation.
    pub fn finish(mut self, error: Option<&crate::Error>) -> Self {
        self.end_at = Utc::now();
        self.error = error.map(ToString::to_string);
        self
    }
}

/// Handler receives Events. Handlers must not block and must swallow
/// their own failures.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// tracing_handler returns a Handler which emits Events as tracing events.
pub fn tracing_handler() -> Handler {
    Arc::new(tracing_event)
}

fn tracing_event(event: &Event) {
    let took = (event.end_at - event.begin_at).to_std().unwrap_or_default();

    match &event.error {
        None => tracing::debug!(
            op = ?event.op,
            subject = %event.subject,
            output = event.output.as_deref(),
            rows_affected = event.rows_affected,
            last_insert_id = event.last_insert_id,
            shared = event.shared,
            ?took,
            "sql operation completed"
        ),
        Some(error) => tracing::warn!(
            op = ?event.op,
            subject = %event.subject,
            shared = event.shared,
            ?took,
            %error,
            "sql operation failed"
        ),
    }
}

/// stderr_json_handler writes Events as JSON lines to stderr.
pub fn stderr_json_handler(event: &Event) {
    let Ok(mut buf) = serde_json::to_vec(event) else {
        return;
    };
    buf.push(b'\n');
    _ = std::io::stderr().write_all(&buf); // Best-effort.
}

/// new_encoded_json_write_handler returns a Handler which writes Events
/// as JSON lines to the given writer.
pub fn new_encoded_json_write_handler<W>(writer: Arc<Mutex<W>>) -> Handler
where
    W: Write + Send + 'static,
{
    Arc::new(move |event: &Event| {
        let Ok(mut buf) = serde_json::to_vec(event) else {
            return;
        };
        buf.push(b'\n');

        if let Ok(mut writer) = writer.lock() {
            _ = writer.write_all(&buf); // Best-effort.
        }
    })
}
