//! Incremental parser for text/event-stream bodies

/// One parsed Server-Sent Event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field; "message" when the stream did not name one
    pub event: String,
    /// Concatenated `data:` lines
    pub data: String,
}

/// Accumulates raw chunks and yields complete events.
///
/// Events are separated by a blank line; `data:` lines within one event are
/// joined with newlines per the SSE specification. Comment lines (leading
/// ':') and unknown fields are ignored.
#[derive(Debug, Default)]
pub struct SseEventParser {
    buffer: String,
}

impl SseEventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and drain every event completed by it
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        loop {
            let Some(boundary) = find_event_boundary(&self.buffer) else {
                break;
            };
            let raw = self.buffer[..boundary.start].to_string();
            self.buffer.drain(..boundary.end);

            if let Some(event) = parse_event(&raw) {
                events.push(event);
            }
        }

        events
    }
}

struct Boundary {
    start: usize,
    end: usize,
}

fn find_event_boundary(buffer: &str) -> Option<Boundary> {
    let lf = buffer.find("\n\n").map(|i| Boundary { start: i, end: i + 2 });
    let crlf = buffer.find("\r\n\r\n").map(|i| Boundary { start: i, end: i + 4 });

    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.start <= b.start { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event_name: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event_name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    if event_name.is_none() && data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event: event_name.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}
