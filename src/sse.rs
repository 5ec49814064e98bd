//! SSE (Server-Sent Events) framing for the progress stream.
//!
//! Every step transition becomes one `step` event and every finished
//! run one `done` event:
//!
//! ```text
//! event: step
//! data: {"run_id":"…","step_id":"login","status":"passed","data":{"duration_ms":42}}
//!
//! event: done
//! data: {"run_id":"…","status":"passed"}
//! ```

use serde_json::{json, Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::report::ProgressEvent;

/// A parsed SSE event with event type and data payload.
#[derive(Debug, Clone)]
pub struct SseEvent {
    /// The `event:` field (`step`, `done`)
    pub event_type: String,
    /// The raw `data:` payload text
    pub data_raw: String,
    /// Parsed JSON from the data payload, if valid JSON
    pub data_json: Option<Value>,
}

/// Encode one progress event as an SSE frame, blank line included.
pub fn encode_event(event: &ProgressEvent) -> String {
    let (name, payload) = match event {
        ProgressEvent::Step(step) => {
            let mut data = Map::new();
            if let Some(ms) = step.duration_ms {
                data.insert("duration_ms".into(), Value::from(ms));
            }
            (
                "step",
                json!({
                    "run_id": step.run_id,
                    "step_id": step.step_id,
                    "status": step.status,
                    "data": Value::Object(data),
                }),
            )
        }
        ProgressEvent::Done {
            run_id,
            status,
            canceled,
            ..
        } => (
            "done",
            json!({
                "run_id": run_id,
                "status": status,
                "canceled": canceled,
            }),
        ),
    };
    format!("event: {name}\ndata: {payload}\n\n")
}

/// Forward events as SSE frames until every sender is dropped.
/// Returns the number of frames written.
pub async fn write_stream<W>(
    rx: &mut mpsc::Receiver<ProgressEvent>,
    out: &mut W,
) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut frames = 0;
    while let Some(event) = rx.recv().await {
        out.write_all(encode_event(&event).as_bytes()).await?;
        out.flush().await?;
        frames += 1;
    }
    Ok(frames)
}

/// Parse a raw SSE text body into a list of structured events.
pub fn parse_sse_events(body: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    let mut current_event_type: Option<String> = None;
    let mut current_data_parts: Vec<String> = Vec::new();

    let mut flush = |event_type: Option<String>, parts: &mut Vec<String>| {
        if let Some(event_type) = event_type {
            let data_raw = parts.join("\n");
            let data_json = serde_json::from_str::<Value>(&data_raw).ok();
            events.push(SseEvent {
                event_type,
                data_raw,
                data_json,
            });
        }
        parts.clear();
    };

    for line in body.lines() {
        if let Some(stripped) = line.strip_prefix("event:") {
            flush(current_event_type.take(), &mut current_data_parts);
            current_event_type = Some(stripped.trim().to_string());
        } else if let Some(stripped) = line.strip_prefix("data:") {
            current_data_parts.push(stripped.trim().to_string());
        } else if line.is_empty() {
            // Blank line = event boundary
            flush(current_event_type.take(), &mut current_data_parts);
        }
    }
    // Final event without a trailing blank line
    flush(current_event_type.take(), &mut current_data_parts);

    events
}
