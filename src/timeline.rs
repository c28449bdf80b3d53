use chrono::Local;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// File name used when the timeline is exported for download.
pub const EXPORT_FILE_NAME: &str = "update_logs.txt";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One line of console output, stamped at the moment it was appended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: String,
    pub text: String,
}

impl LogLine {
    pub fn render(&self) -> String {
        format!("[{}] {}", self.timestamp, self.text)
    }
}

/// Append-only log of the update session.
///
/// Raw output is split on line boundaries and blank lines are dropped; the
/// surviving lines are timestamped and kept in append order. Lines are never
/// removed or reordered. Cloning the handle shares the underlying timeline.
#[derive(Clone, Default)]
pub struct Timeline {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    lines: Vec<LogLine>,
    follower: Option<UnboundedSender<LogLine>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw output, one timestamped line per non-blank line. Each
    /// appended line is forwarded to the follower so the presentation layer
    /// can scroll to the newest entry.
    pub fn append(&self, raw: &str) {
        let mut inner = self.inner.lock().unwrap();
        for text in raw.lines().filter(|line| !line.trim().is_empty()) {
            let line = LogLine {
                timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
                text: text.to_string(),
            };
            if let Some(follower) = &inner.follower {
                // a closed receiver just means nobody is watching
                let _ = follower.send(line.clone());
            }
            inner.lines.push(line);
        }
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.inner.lock().unwrap().lines.clone()
    }

    /// Receive every line appended from now on. Replaces any previous
    /// follower.
    pub fn follow(&self) -> UnboundedReceiver<LogLine> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().follower = Some(tx);
        rx
    }

    /// All lines rendered for export, joined by newlines.
    pub fn export_text(&self) -> String {
        self.inner
            .lock()
            .unwrap()
            .lines
            .iter()
            .map(LogLine::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
