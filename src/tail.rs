//! Follow a growing log file and forward new lines to a sink.
//!
//! The cursor starts at a byte offset (normally the file's size when the
//! capture session opened it) and only ever moves forward by the number of
//! bytes actually read, so each appended line is delivered once and in file
//! order. Both `\n` and `\r` end a line, so carriage-return progress output
//! comes through as separate lines. An incomplete trailing line is held back
//! until its line break arrives or the tailer is stopped.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often the tailer checks the file for growth.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Destination for tailed lines.
pub trait LineSink: Send + Sync {
    fn emit(&self, line: &str);
}

/// Emits each line as an info-level tracing event.
pub struct TracingSink;

impl LineSink for TracingSink {
    fn emit(&self, line: &str) {
        tracing::info!("{line}");
    }
}

/// Byte offset into a log file plus any incomplete line read past it.
#[derive(Debug)]
pub struct TailCursor {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl TailCursor {
    /// Start reading at `offset`.
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            partial: Vec::new(),
        }
    }

    /// Start at the current end of the file, or at 0 if it can't be stat'ed.
    #[cfg(test)]
    pub fn at_end(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offset = current_len(&path);
        Self::new(path, offset)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes consumed so far, counted from the start of the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read whatever was appended since the last poll and return the
    /// complete lines, lossily decoded, trimmed, blanks dropped.
    ///
    /// A file that is missing or unreadable counts as "nothing new".
    pub async fn poll(&mut self) -> Vec<String> {
        let chunk = match self.read_new().await {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::trace!(error = %e, path = %self.path.display(), "tail read skipped");
                return Vec::new();
            }
        };
        if chunk.is_empty() {
            return Vec::new();
        }
        self.offset += chunk.len() as u64;
        self.partial.extend_from_slice(&chunk);

        let Some(last_break) = self.partial.iter().rposition(|b| is_line_break(*b)) else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.partial.drain(..=last_break).collect();
        complete
            .split(|b| is_line_break(*b))
            .filter_map(clean_line)
            .collect()
    }

    /// Hand back the held incomplete line, if it has any visible text.
    pub fn take_partial(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        clean_line(&rest)
    }

    async fn read_new(&self) -> std::io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

#[cfg(test)]
fn current_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

// A `\r\n` split across two reads yields an empty piece, which
// `clean_line` drops.
fn is_line_break(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

fn clean_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Background follower: polls a `TailCursor` and forwards lines with a prefix.
pub struct Tailer {
    cursor: TailCursor,
    sink: Arc<dyn LineSink>,
    prefix: String,
    poll_interval: Duration,
}

impl Tailer {
    pub fn new(
        cursor: TailCursor,
        sink: Arc<dyn LineSink>,
        prefix: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            cursor,
            sink,
            prefix: prefix.into(),
            poll_interval,
        }
    }

    /// Poll until `stop` fires, then drain once more so lines written just
    /// before the stop are not lost. Returns the final cursor offset.
    pub async fn run(mut self, stop: CancellationToken) -> u64 {
        tracing::debug!(
            path = %self.cursor.path().display(),
            offset = self.cursor.offset(),
            "stderr tail started"
        );
        loop {
            self.forward().await;
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        self.forward().await;
        if let Some(rest) = self.cursor.take_partial() {
            self.emit(&rest);
        }
        tracing::debug!(offset = self.cursor.offset(), "stderr tail stopped");
        self.cursor.offset()
    }

    /// Run on the current tokio runtime.
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(self.run(stop))
    }

    async fn forward(&mut self) {
        for line in self.cursor.poll().await {
            self.emit(&line);
        }
    }

    fn emit(&self, line: &str) {
        self.sink.emit(&format!("{}{}", self.prefix, line));
    }
}

/// In-memory sink for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    lines: std::sync::Mutex<Vec<(String, std::time::Instant)>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .map(|(line, _)| line.clone())
            .collect()
    }

    /// When the `index`th line was emitted.
    pub fn arrived_at(&self, index: usize) -> std::time::Instant {
        self.lines.lock().unwrap()[index].1
    }

    /// Wait until at least `count` lines arrived or `timeout` elapsed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let lines = self.lines();
            if lines.len() >= count || tokio::time::Instant::now() >= deadline {
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[cfg(test)]
impl LineSink for MemorySink {
    fn emit(&self, line: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((line.to_string(), std::time::Instant::now()));
    }
}
