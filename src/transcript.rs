//! Append-only session transcript
//!
//! Sessions hand lines to a queue, a single background task appends them to
//! the transcript file. Unlike a batching buffer, every entry is flushed as
//! soon as it is written so an abrupt disconnect loses nothing that was
//! already queued.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

/// One line (or block of lines) of session I/O.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub session: Uuid,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl LogEntry {
    /// Render as transcript lines, one prefix per text line.
    fn render(&self) -> String {
        let stamp = self.timestamp.to_rfc3339();
        let mut out = String::with_capacity(self.text.len() + 64);
        for line in self.text.split('\n') {
            out.push_str(&stamp);
            out.push_str(" [");
            out.push_str(&self.session.to_string());
            out.push_str("] ");
            out.push_str(line.trim_end_matches('\r'));
            out.push('\n');
        }
        out
    }
}

/// Cloneable handle shared by every session.
#[derive(Clone)]
pub struct Transcript {
    sender: mpsc::UnboundedSender<LogEntry>,
}

impl Transcript {
    /// Open (or create) the transcript file and start the writer task.
    ///
    /// The writer exits once every handle has been dropped and the queue is
    /// drained; await the returned handle to wait for that.
    pub async fn open(path: &Path) -> Result<(Self, JoinHandle<()>)> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating directory: {}", parent.display()))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening transcript: {}", path.display()))?;

        let (sender, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_task(file, rx));
        info!("Transcript writing to {}", path.display());

        Ok((Self { sender }, writer))
    }

    /// Queue one entry for `session`.
    pub fn append(&self, session: Uuid, text: impl Into<String>) {
        let entry = LogEntry {
            session,
            timestamp: Utc::now(),
            text: text.into(),
        };
        if self.sender.send(entry).is_err() {
            error!(session = %session, "Transcript writer is gone, entry dropped");
        }
    }
}

async fn writer_task(mut file: tokio::fs::File, mut rx: mpsc::UnboundedReceiver<LogEntry>) {
    while let Some(entry) = rx.recv().await {
        let rendered = entry.render();
        if let Err(e) = file.write_all(rendered.as_bytes()).await {
            error!(session = %entry.session, "Failed to write transcript entry: {}", e);
            continue;
        }
        if let Err(e) = file.flush().await {
            error!(session = %entry.session, "Failed to flush transcript: {}", e);
        }
    }
    info!("Transcript writer shutting down");
}

/// Make peer-supplied text safe to log: control characters (newlines
/// included) become visible escapes, so one entry stays one line.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_control() {
            out.extend(c.escape_default());
        } else {
            out.push(c);
        }
    }
    out
}
