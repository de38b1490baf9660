//! Work IQ tool server: decide whether to run it and how to launch it.
//!
//! Work IQ is an MCP server started through `npx` (or an installed
//! `workiq` binary). It needs delegated user sign-in, so it is refused in
//! managed-identity hosts unless explicitly allowed.

use crate::config::WorkIqConfig;
use crate::stderr_capture::{StderrCapture, StderrTailingTool};
use crate::tail::TracingSink;
use crate::transport::{LaunchError, StdioTransport, ToolProcessSpec};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

pub const TOOL_NAME: &str = "workiq";
pub const TOOL_DESCRIPTION: &str = "Microsoft Work IQ MCP server (Microsoft 365 Copilot data)";
pub const STDERR_PREFIX: &str = "WorkIQ(mcp stderr): ";
const PACKAGE: &str = "@microsoft/workiq";

/// Finds executables on `PATH`.
pub trait CommandResolver {
    fn resolve(&self, command: &str) -> Option<PathBuf>;
}

/// `PATH` lookup via the `which` crate.
pub struct WhichResolver;

impl CommandResolver for WhichResolver {
    fn resolve(&self, command: &str) -> Option<PathBuf> {
        which::which(command).ok()
    }
}

/// Where the tool's stderr goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub log_path: PathBuf,
    pub echo: bool,
}

/// A resolved, ready-to-launch Work IQ tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkIqTool {
    pub name: String,
    pub description: String,
    pub approval_mode: Option<String>,
    pub spec: ToolProcessSpec,
    /// `None` leaves the server's stderr attached to ours.
    pub capture: Option<CaptureSettings>,
}

impl WorkIqTool {
    /// Start the server. With capture on, its stderr goes to the log file
    /// and is echoed into the host log when `echo` is set.
    pub fn launch(&self) -> Result<(StdioTransport, StderrCapture), LaunchError> {
        match &self.capture {
            Some(capture) => StderrTailingTool::new(
                self.spec.clone(),
                &capture.log_path,
                capture.echo,
                Arc::new(TracingSink),
                STDERR_PREFIX,
            )
            .open(),
            None => {
                let transport = StdioTransport::spawn(&self.spec, Stdio::inherit())?;
                Ok((transport, StderrCapture::inactive()))
            }
        }
    }
}

/// Build the argument list: `-y @microsoft/workiq [-t <tenant>] mcp`.
pub fn workiq_args(tenant_id: Option<&str>) -> Vec<String> {
    let mut args = vec!["-y".to_string(), PACKAGE.to_string()];
    if let Some(tenant) = tenant_id.map(str::trim).filter(|t| !t.is_empty()) {
        args.push("-t".to_string());
        args.push(tenant.to_string());
    }
    args.push("mcp".to_string());
    args
}

/// Decide whether Work IQ runs in this process and, if so, how.
pub fn build_workiq_tool(
    config: &WorkIqConfig,
    has_msi: bool,
    resolver: &dyn CommandResolver,
) -> Option<WorkIqTool> {
    tracing::info!(
        enabled = config.enabled,
        allow_hosted = config.allow_hosted,
        "WorkIQ"
    );

    if !config.enabled {
        return None;
    }

    if has_msi && !config.allow_hosted {
        tracing::warn!(
            "Work IQ is enabled but this runtime appears to be hosted (MSI_ENDPOINT is set). \
             Work IQ uses delegated user auth that needs an interactive sign-in, which hosted \
             containers cannot provide. Disabling Work IQ; set WORKIQ_ALLOW_HOSTED=true to \
             force-enable it."
        );
        return None;
    }

    let command = match config.command.trim() {
        "" => "npx",
        c => c,
    };
    let Some(resolved) = resolver.resolve(command) else {
        tracing::warn!(
            command,
            "Work IQ is enabled but the command was not found on PATH. Install Node.js (for \
             npx) or install Work IQ globally and set WORKIQ_COMMAND=workiq. Disabling Work IQ \
             for this run."
        );
        return None;
    };
    tracing::debug!(command, path = %resolved.display(), "WorkIQ command resolved");

    let args = workiq_args(config.tenant_id.as_deref());
    tracing::debug!(?args, "WorkIQ args");

    let capture = if config.capture_stderr {
        tracing::info!(
            path = %config.stderr_log_path.display(),
            echo = config.echo_stderr,
            "WorkIQ: capturing MCP stderr"
        );
        Some(CaptureSettings {
            log_path: config.stderr_log_path.clone(),
            echo: config.echo_stderr,
        })
    } else {
        None
    };

    Some(WorkIqTool {
        name: TOOL_NAME.to_string(),
        description: TOOL_DESCRIPTION.to_string(),
        approval_mode: config.approval_mode.clone(),
        spec: ToolProcessSpec::new(command, args),
        capture,
    })
}
