//! Stdio transport to a tool server: spawn the child, exchange
//! newline-delimited JSON-RPC messages over stdin/stdout, and route its
//! stderr wherever the caller says.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// How a tool server process is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Added on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Text encoding of the stdio streams; only UTF-8 is supported.
    pub encoding: Option<String>,
}

impl ToolProcessSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: BTreeMap::new(),
            encoding: None,
        }
    }
}

/// Errors that prevent a tool server from starting.
#[derive(Debug)]
pub enum LaunchError {
    /// Failed to spawn the tool process.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The process started without one of its stdio pipes.
    MissingPipe(&'static str),
    /// The requested stream encoding is not supported.
    UnsupportedEncoding(String),
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Spawn { command, source } => {
                write!(f, "failed to spawn tool process {command}: {source}")
            }
            LaunchError::MissingPipe(which) => {
                write!(f, "tool process started without a {which} pipe")
            }
            LaunchError::UnsupportedEncoding(enc) => {
                write!(f, "unsupported stdio encoding {enc:?} (only utf-8)")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors on an established transport.
#[derive(Debug)]
pub enum TransportError {
    /// Reading or writing a pipe failed.
    Io(std::io::Error),
    /// A line from the server was not valid JSON.
    Json(serde_json::Error),
    /// The server closed its stdout.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "I/O error on tool transport: {e}"),
            TransportError::Json(e) => write!(f, "invalid JSON from tool server: {e}"),
            TransportError::Closed => write!(f, "tool server closed the transport"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Json(e) => Some(e),
            TransportError::Closed => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Produces a live transport for a tool process whose stderr goes to `stderr`.
pub trait TransportLauncher: Send + Sync {
    type Transport: Send;

    fn launch(&self, spec: &ToolProcessSpec, stderr: Stdio)
        -> Result<Self::Transport, LaunchError>;
}

/// Launches real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioLauncher;

impl TransportLauncher for StdioLauncher {
    type Transport = StdioTransport;

    fn launch(&self, spec: &ToolProcessSpec, stderr: Stdio) -> Result<StdioTransport, LaunchError> {
        StdioTransport::spawn(spec, stderr)
    }
}

fn check_encoding(encoding: Option<&str>) -> Result<(), LaunchError> {
    match encoding {
        None => Ok(()),
        Some(enc) if matches!(enc.to_lowercase().as_str(), "utf-8" | "utf8") => Ok(()),
        Some(enc) => Err(LaunchError::UnsupportedEncoding(enc.to_string())),
    }
}

/// A running tool server speaking line-delimited JSON on stdin/stdout.
pub struct StdioTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl StdioTransport {
    /// Spawn the tool process in its own process group so shutdown can
    /// signal any helpers it forks (npx, node, ...).
    pub fn spawn(spec: &ToolProcessSpec, stderr: Stdio) -> Result<Self, LaunchError> {
        check_encoding(spec.encoding.as_deref())?;

        tracing::info!(
            command = %spec.command,
            args = ?spec.args,
            "spawning tool server"
        );

        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                command: spec.command.clone(),
                source: e,
            })?;

        let stdin = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(LaunchError::MissingPipe("stdout"))?;

        tracing::debug!(pid = ?child.id(), "tool server started");

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        })
    }

    #[cfg(test)]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Write one message as a single JSON line.
    pub async fn send(&mut self, message: &Value) -> Result<(), TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::Closed)?;
        let mut line = serde_json::to_vec(message).map_err(TransportError::Json)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read the next non-blank line and parse it as JSON.
    pub async fn recv(&mut self) -> Result<Value, TransportError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.stdout.read_line(&mut line).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed).map_err(TransportError::Json);
        }
    }

    /// Close stdin and give the server `grace` to exit, then SIGTERM its
    /// process group, then kill it outright.
    pub async fn close(mut self, grace: Duration) -> Option<ExitStatus> {
        drop(self.stdin.take());

        if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
            tracing::debug!(exit_code = ?status.code(), "tool server exited");
            return Some(status);
        }

        if let Some(pid) = self.child.id() {
            tracing::debug!(pid, "tool server still running, sending SIGTERM");
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(error = %e, "SIGTERM to tool process group failed");
            }
            if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
                return Some(status);
            }
        }

        tracing::warn!("tool server ignored SIGTERM, killing");
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "failed to kill tool server");
            return None;
        }
        self.child.wait().await.ok()
    }
}
