//! Stderr capture for tool servers.
//!
//! A tool server's stderr is redirected into an append-only log file and,
//! when echo is on, followed by a background `Tailer` that mirrors new lines
//! into the host log. The capture owns the log handle and the tail task, not
//! the transport: callers get the transport back from `open` and close it on
//! their own schedule.
//!
//! Teardown order is fixed: raise the stop token, join the tail task, then
//! flush and close the log file. Nothing in teardown returns an error; every
//! failure is logged and recorded in the `TeardownReport`.

use crate::tail::{LineSink, TailCursor, Tailer, DEFAULT_POLL_INTERVAL};
use crate::transport::{LaunchError, StdioLauncher, ToolProcessSpec, TransportLauncher};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Minimum time teardown waits for the tail task before aborting it.
const MIN_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// The writable end of a capture log.
pub trait LogFile: Send + 'static {
    /// Push buffered bytes to the OS (and disk).
    fn flush(&mut self) -> std::io::Result<()>;
    /// Release the handle.
    fn close(self) -> std::io::Result<()>;
}

impl LogFile for File {
    fn flush(&mut self) -> std::io::Result<()> {
        std::io::Write::flush(self)?;
        match self.sync_data() {
            // Pipes, FIFOs and character devices have nothing to sync.
            Err(e) if is_unsyncable(&e) => Ok(()),
            other => other,
        }
    }

    fn close(self) -> std::io::Result<()> {
        drop(self);
        Ok(())
    }
}

fn is_unsyncable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::InvalidInput | std::io::ErrorKind::Unsupported
    )
}

/// One step of capture teardown, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownStep {
    StopSignalled,
    /// `ok` is false when the task panicked, was cancelled, or had to be aborted.
    TailJoined { ok: bool },
    LogFlushed { ok: bool },
    LogClosed { ok: bool },
}

/// What teardown did. Never an error: failures are only recorded here.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub steps: Vec<TeardownStep>,
    /// Final tail offset, when a tail task ran and finished cleanly.
    pub tail_offset: Option<u64>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|step| match step {
            TeardownStep::StopSignalled => true,
            TeardownStep::TailJoined { ok }
            | TeardownStep::LogFlushed { ok }
            | TeardownStep::LogClosed { ok } => *ok,
        })
    }
}

/// Live capture state for one tool session.
pub struct StderrCapture<W: LogFile = File> {
    path: Option<PathBuf>,
    log: Option<W>,
    stop: CancellationToken,
    tail: Option<JoinHandle<u64>>,
    join_timeout: Duration,
}

impl StderrCapture<File> {
    /// A capture that holds nothing; used when stderr is not captured.
    pub fn inactive() -> Self {
        Self::from_parts(None, None, CancellationToken::new(), None, MIN_JOIN_TIMEOUT)
    }
}

impl<W: LogFile> StderrCapture<W> {
    pub(crate) fn from_parts(
        path: Option<PathBuf>,
        log: Option<W>,
        stop: CancellationToken,
        tail: Option<JoinHandle<u64>>,
        join_timeout: Duration,
    ) -> Self {
        Self {
            path,
            log,
            stop,
            tail,
            join_timeout,
        }
    }

    /// Log file in use, if capture was set up.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether a background tail task is running.
    pub fn is_tailing(&self) -> bool {
        self.tail.is_some()
    }

    /// Stop tailing and release the log file. Safe to call on every exit path.
    pub async fn close(mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        self.stop.cancel();
        report.steps.push(TeardownStep::StopSignalled);

        if let Some(mut tail) = self.tail.take() {
            let ok = match tokio::time::timeout(self.join_timeout, &mut tail).await {
                Ok(Ok(offset)) => {
                    report.tail_offset = Some(offset);
                    true
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "stderr tail task failed");
                    false
                }
                Err(_) => {
                    tracing::warn!("stderr tail task did not stop in time, aborting");
                    tail.abort();
                    let _ = tail.await;
                    false
                }
            };
            report.steps.push(TeardownStep::TailJoined { ok });
        }

        if let Some(mut log) = self.log.take() {
            let flushed = match log.flush() {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(error = %e, "failed to flush stderr log");
                    false
                }
            };
            report.steps.push(TeardownStep::LogFlushed { ok: flushed });

            let closed = match log.close() {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(error = %e, "failed to close stderr log");
                    false
                }
            };
            report.steps.push(TeardownStep::LogClosed { ok: closed });
        }

        report
    }
}

impl<W: LogFile> Drop for StderrCapture<W> {
    /// Fallback for panics and dropped futures: no await is possible here,
    /// so the tail task is cancelled and aborted and the file is dropped.
    fn drop(&mut self) {
        if self.tail.is_none() && self.log.is_none() {
            return;
        }
        self.stop.cancel();
        if let Some(tail) = self.tail.take() {
            tail.abort();
        }
        tracing::debug!("stderr capture dropped without close");
    }
}

/// A tool server whose stderr is captured to `log_path` and optionally
/// echoed into the host log.
pub struct StderrTailingTool<L: TransportLauncher = StdioLauncher> {
    launcher: L,
    spec: ToolProcessSpec,
    log_path: PathBuf,
    echo: bool,
    sink: Arc<dyn LineSink>,
    prefix: String,
    poll_interval: Duration,
}

impl StderrTailingTool<StdioLauncher> {
    pub fn new(
        spec: ToolProcessSpec,
        log_path: impl Into<PathBuf>,
        echo: bool,
        sink: Arc<dyn LineSink>,
        prefix: impl Into<String>,
    ) -> Self {
        Self::with_launcher(StdioLauncher, spec, log_path, echo, sink, prefix)
    }
}

impl<L: TransportLauncher> StderrTailingTool<L> {
    pub fn with_launcher(
        launcher: L,
        spec: ToolProcessSpec,
        log_path: impl Into<PathBuf>,
        echo: bool,
        sink: Arc<dyn LineSink>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            launcher,
            spec,
            log_path: log_path.into(),
            echo,
            sink,
            prefix: prefix.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Open the log, launch the tool with stderr redirected into it, and
    /// start tailing if echo is on. Must be called inside a tokio runtime.
    ///
    /// Only a launch failure is returned. If the log can't be opened the
    /// tool still starts, with stderr inherited and no tailing.
    pub fn open(&self) -> Result<(L::Transport, StderrCapture), LaunchError> {
        let opened = match open_log(&self.log_path) {
            Ok(opened) => Some(opened),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %self.log_path.display(),
                    "cannot open stderr log, tool stderr will be inherited"
                );
                None
            }
        };

        let Some((log, start_offset, child_stderr)) = opened else {
            let transport = self.launcher.launch(&self.spec, Stdio::inherit())?;
            return Ok((transport, StderrCapture::inactive()));
        };

        // On failure `log` is dropped here, closing the file.
        let transport = self.launcher.launch(&self.spec, child_stderr)?;

        let stop = CancellationToken::new();
        let tail = if self.echo {
            let cursor = TailCursor::new(&self.log_path, start_offset);
            let tailer = Tailer::new(
                cursor,
                self.sink.clone(),
                self.prefix.clone(),
                self.poll_interval,
            );
            Some(tailer.spawn(stop.clone()))
        } else {
            None
        };

        tracing::debug!(
            path = %self.log_path.display(),
            echo = self.echo,
            start_offset,
            "stderr capture started"
        );

        let join_timeout = (self.poll_interval * 4).max(MIN_JOIN_TIMEOUT);
        let capture = StderrCapture::from_parts(
            Some(self.log_path.clone()),
            Some(log),
            stop,
            tail,
            join_timeout,
        );
        Ok((transport, capture))
    }
}

/// Create the parent directory, open the log for append, and note where
/// tailing should start. Returns the host handle, the start offset, and a
/// cloned handle for the child's stderr.
fn open_log(path: &Path) -> std::io::Result<(File, u64, Stdio)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let start_offset = file.metadata()?.len();
    let child_stderr = Stdio::from(file.try_clone()?);
    Ok((file, start_offset, child_stderr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tail::MemorySink;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Instant;

    fn sh(script: &str) -> ToolProcessSpec {
        ToolProcessSpec::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn append(path: &Path, data: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(data).unwrap();
    }

    fn tool(
        spec: ToolProcessSpec,
        path: &Path,
        echo: bool,
        sink: Arc<MemorySink>,
    ) -> StderrTailingTool {
        StderrTailingTool::new(spec, path, echo, sink, "WorkIQ(mcp stderr): ")
    }

    /// Records launches without spawning anything.
    #[derive(Default)]
    struct RecordingLauncher {
        launches: Mutex<Vec<ToolProcessSpec>>,
        fail: bool,
    }

    impl TransportLauncher for RecordingLauncher {
        type Transport = ();

        fn launch(&self, spec: &ToolProcessSpec, _stderr: Stdio) -> Result<(), LaunchError> {
            self.launches.lock().unwrap().push(spec.clone());
            if self.fail {
                return Err(LaunchError::Spawn {
                    command: spec.command.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
                });
            }
            Ok(())
        }
    }

    /// Log handle whose flush and close both fail, and which records the
    /// order it was touched relative to the tail task.
    struct FailingLog {
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl LogFile for FailingLog {
        fn flush(&mut self) -> std::io::Result<()> {
            self.events.lock().unwrap().push("flush");
            Err(std::io::Error::other("disk full"))
        }

        fn close(self) -> std::io::Result<()> {
            self.events.lock().unwrap().push("close");
            Err(std::io::Error::other("bad descriptor"))
        }
    }

    #[tokio::test]
    async fn test_echoes_child_stderr_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/workiq.stderr.log");
        let sink = Arc::new(MemorySink::default());
        let tool = tool(sh("echo booting >&2; cat"), &path, true, sink.clone())
            .poll_interval(Duration::from_millis(20));

        let (transport, capture) = tool.open().unwrap();
        assert!(capture.is_tailing());
        assert_eq!(capture.path(), Some(path.as_path()));

        let lines = sink.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(lines, vec!["WorkIQ(mcp stderr): booting"]);

        transport.close(Duration::from_secs(2)).await;
        let report = capture.close().await;
        assert!(report.is_clean());
        assert_eq!(sink.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_hello_world_in_order_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.log");
        let sink = Arc::new(MemorySink::default());
        let tool = StderrTailingTool::with_launcher(
            RecordingLauncher::default(),
            sh("unused"),
            &path,
            true,
            sink.clone(),
            "p> ",
        );

        let ((), capture) = tool.open().unwrap();
        let hello_written = Instant::now();
        append(&path, b"hello\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let world_written = Instant::now();
        append(&path, b"world\n");

        let lines = sink.wait_for(2, Duration::from_secs(2)).await;
        assert_eq!(lines, vec!["p> hello", "p> world"]);
        let limit = Duration::from_millis(300);
        assert!(sink.arrived_at(0).duration_since(hello_written) < limit);
        assert!(sink.arrived_at(1).duration_since(world_written) < limit);

        tokio::time::sleep(Duration::from_millis(300)).await;
        capture.close().await;
        assert_eq!(sink.lines(), vec!["p> hello", "p> world"]);
    }

    #[tokio::test]
    async fn test_existing_content_not_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reused.log");
        std::fs::write(&path, "old\n").unwrap();
        let sink = Arc::new(MemorySink::default());
        let tool = StderrTailingTool::with_launcher(
            RecordingLauncher::default(),
            sh("unused"),
            &path,
            true,
            sink.clone(),
            "",
        )
        .poll_interval(Duration::from_millis(20));

        let ((), capture) = tool.open().unwrap();
        append(&path, b"new\n");
        sink.wait_for(1, Duration::from_secs(2)).await;
        let report = capture.close().await;

        assert_eq!(sink.lines(), vec!["new"]);
        assert_eq!(report.tail_offset, Some(8));
    }

    #[tokio::test]
    async fn test_echo_disabled_still_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quiet.log");
        let sink = Arc::new(MemorySink::default());
        let tool = tool(sh("echo quiet-diag >&2"), &path, false, sink.clone());

        let (transport, capture) = tool.open().unwrap();
        assert!(!capture.is_tailing());
        transport.close(Duration::from_secs(2)).await;
        let report = capture.close().await;

        assert_eq!(
            report.steps,
            vec![
                TeardownStep::StopSignalled,
                TeardownStep::LogFlushed { ok: true },
                TeardownStep::LogClosed { ok: true },
            ]
        );
        assert!(sink.lines().is_empty());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), "quiet-diag");
    }

    #[tokio::test]
    async fn test_log_appends_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append.log");
        let sink = Arc::new(MemorySink::default());

        for word in ["first", "second"] {
            let tool = tool(sh(&format!("echo {word} >&2")), &path, false, sink.clone());
            let (transport, capture) = tool.open().unwrap();
            transport.close(Duration::from_secs(2)).await;
            capture.close().await;
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_launch_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.log");
        let launcher = RecordingLauncher {
            fail: true,
            ..Default::default()
        };
        let tool = StderrTailingTool::with_launcher(
            launcher,
            sh("unused"),
            &path,
            true,
            Arc::new(MemorySink::default()),
            "",
        );

        let err = tool.open().err().unwrap();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_real_spawn_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(
            ToolProcessSpec::new("nonexistent-binary-xyz", vec![]),
            &dir.path().join("err.log"),
            true,
            Arc::new(MemorySink::default()),
        );
        assert!(matches!(tool.open(), Err(LaunchError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_unusable_log_path_still_launches() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the parent directory should be.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let launcher = RecordingLauncher::default();
        let tool = StderrTailingTool::with_launcher(
            launcher,
            sh("unused"),
            blocker.join("err.log"),
            true,
            Arc::new(MemorySink::default()),
            "",
        );

        let ((), capture) = tool.open().unwrap();
        assert!(!capture.is_tailing());
        assert_eq!(capture.path(), None);
        assert_eq!(tool.launcher.launches.lock().unwrap().len(), 1);
        assert_eq!(capture.close().await.steps, vec![TeardownStep::StopSignalled]);
    }

    #[tokio::test]
    async fn test_teardown_order_is_stop_join_close() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();
        let tail = {
            let stop = stop.clone();
            let events = events.clone();
            tokio::spawn(async move {
                stop.cancelled().await;
                events.lock().unwrap().push("tail-exit");
                7u64
            })
        };
        let capture = StderrCapture::from_parts(
            None,
            Some(FailingLog {
                events: events.clone(),
            }),
            stop,
            Some(tail),
            Duration::from_secs(1),
        );

        let report = capture.close().await;

        assert_eq!(*events.lock().unwrap(), vec!["tail-exit", "flush", "close"]);
        assert_eq!(report.steps[0], TeardownStep::StopSignalled);
        assert_eq!(report.steps[1], TeardownStep::TailJoined { ok: true });
        assert_eq!(report.tail_offset, Some(7));
    }

    #[tokio::test]
    async fn test_teardown_survives_crashed_tail_and_failing_close() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let tail: JoinHandle<u64> = tokio::spawn(async {
            if true {
                panic!("tail crashed");
            }
            0
        });
        let capture = StderrCapture::from_parts(
            None,
            Some(FailingLog {
                events: events.clone(),
            }),
            CancellationToken::new(),
            Some(tail),
            Duration::from_secs(1),
        );

        let report = capture.close().await;

        assert!(!report.is_clean());
        assert_eq!(
            report.steps,
            vec![
                TeardownStep::StopSignalled,
                TeardownStep::TailJoined { ok: false },
                TeardownStep::LogFlushed { ok: false },
                TeardownStep::LogClosed { ok: false },
            ]
        );
        assert_eq!(*events.lock().unwrap(), vec!["flush", "close"]);
    }

    #[tokio::test]
    async fn test_hung_tail_is_aborted() {
        let tail: JoinHandle<u64> = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            0
        });
        let capture = StderrCapture::<File>::from_parts(
            None,
            None,
            CancellationToken::new(),
            Some(tail),
            Duration::from_millis(50),
        );
        let started = Instant::now();
        let report = capture.close().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.steps[1], TeardownStep::TailJoined { ok: false });
    }

    #[tokio::test]
    async fn test_close_during_long_poll_sleep() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slow.log");
        let interval = Duration::from_millis(250);
        let tool = StderrTailingTool::with_launcher(
            RecordingLauncher::default(),
            sh("unused"),
            &path,
            true,
            Arc::new(MemorySink::default()),
            "",
        )
        .poll_interval(interval);

        let ((), capture) = tool.open().unwrap();
        // Let the tailer finish its first poll and go to sleep.
        tokio::time::sleep(Duration::from_millis(30)).await;

        let started = Instant::now();
        let report = capture.close().await;
        assert!(started.elapsed() < interval);
        assert!(report.is_clean());
        assert!(matches!(
            report.steps.last(),
            Some(TeardownStep::LogClosed { ok: true })
        ));
    }

    #[tokio::test]
    async fn test_drop_cancels_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.log");
        let sink = Arc::new(MemorySink::default());
        let tool = StderrTailingTool::with_launcher(
            RecordingLauncher::default(),
            sh("unused"),
            &path,
            true,
            sink.clone(),
            "",
        )
        .poll_interval(Duration::from_millis(10));

        let ((), capture) = tool.open().unwrap();
        drop(capture);
        tokio::time::sleep(Duration::from_millis(50)).await;

        append(&path, b"after drop\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_flush_tolerates_device_without_sync() {
        let mut device = OpenOptions::new().write(true).open("/dev/null").unwrap();
        LogFile::flush(&mut device).unwrap();
        LogFile::close(device).unwrap();

        assert!(is_unsyncable(&std::io::Error::from(
            std::io::ErrorKind::InvalidInput
        )));
        assert!(!is_unsyncable(&std::io::Error::other("disk full")));
    }
}
