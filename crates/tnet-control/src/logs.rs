use std::{collections::VecDeque, sync::Arc};

use tokio::sync::Mutex;

use crate::secret;

pub const DEFAULT_LOG_MAX_LINES: usize = 1000;

/// Bounded console buffer with monotonically increasing sequence numbers.
#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        // Cursor 0 means "the most recent lines" so a fresh dashboard view starts at the end.
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

/// Shared handle to an instance's console buffer. Survives restarts of the
/// same instance; dropped when the instance is deleted.
#[derive(Debug, Clone)]
pub struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
    /// Literal crypt-key values of the owning instance.
    secrets: Arc<[String]>,
}

impl LogSink {
    pub fn new(max_lines: usize) -> Self {
        Self::with_secrets(max_lines, Vec::new())
    }

    pub fn with_secrets(max_lines: usize, secrets: Vec<String>) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer::new(max_lines))),
            secrets: secrets.into(),
        }
    }

    pub fn redact(&self, text: &str) -> String {
        secret::redact(text, &self.secrets)
    }

    /// Appends a line after redacting any crypt key it echoes.
    pub async fn emit(&self, line: impl AsRef<str>) {
        let line = self.redact(line.as_ref());
        self.buffer.lock().await.push_line(line);
    }

    pub async fn tail(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.buffer.lock().await.tail_after(cursor, limit)
    }
}
