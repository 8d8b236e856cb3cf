//! Session-scoped progress log drained by the polling endpoint.
//!
//! Messages accumulate in a single pipe-delimited buffer between polls.
//! Each poll takes every queued line in append order and resets the
//! buffer, so a message is delivered exactly once.

use parking_lot::Mutex;

/// Accumulates progress messages for one import session.
#[derive(Debug, Default)]
pub struct ProgressLog {
    buffer: Mutex<String>,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one message. Blank messages are dropped so the buffer never
    /// collects empty segments.
    pub fn append(&self, message: &str) {
        if message.trim().is_empty() {
            return;
        }
        let mut buffer = self.buffer.lock();
        if !buffer.is_empty() {
            buffer.push('|');
        }
        buffer.push_str(message);
    }

    /// Take every queued line in append order and reset the buffer.
    pub fn drain(&self) -> Vec<String> {
        let drained = std::mem::take(&mut *self.buffer.lock());
        drained
            .split('|')
            .filter(|segment| !segment.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Discard any queued messages.
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

/// Join drained lines with `<br>` for clients that render the log as
/// markup, escaping each line first.
pub fn render_html(lines: &[String]) -> String {
    lines
        .iter()
        .map(|line| escape_html(line))
        .collect::<Vec<_>>()
        .join("<br>")
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
