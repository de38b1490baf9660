//! Agent host lifecycle: pick a credential, bring up the optional tool
//! server, then either answer one prompt or serve until interrupted.

use crate::config::{HostConfig, RunMode};
use crate::credential::Credential;
use crate::mcp::{McpClient, McpError, DEFAULT_REQUEST_TIMEOUT};
use crate::serve::{self, AppState};
use crate::stderr_capture::{StderrCapture, TeardownReport};
use crate::workiq::{self, WhichResolver, WorkIqTool};
use std::time::Duration;

/// Time a tool server gets to exit after its stdin closes.
const TOOL_EXIT_GRACE: Duration = Duration::from_secs(5);

/// A running tool server plus its stderr capture.
pub struct ToolSession {
    name: String,
    client: McpClient,
    capture: StderrCapture,
    tools: Vec<String>,
}

impl ToolSession {
    /// Launch the tool, run the MCP handshake, and list its tools.
    ///
    /// On handshake failure the server and capture are torn down before
    /// the error is returned.
    pub async fn start(tool: &WorkIqTool, timeout: Duration) -> Result<Self, McpError> {
        tracing::info!(
            tool = %tool.name,
            description = %tool.description,
            approval_mode = ?tool.approval_mode,
            "starting tool server"
        );
        let (transport, capture) = tool.launch()?;
        tracing::debug!(
            log = ?capture.path(),
            tailing = capture.is_tailing(),
            "tool stderr capture"
        );
        let mut client = McpClient::new(transport, timeout);

        let handshake = async {
            client.initialize().await?;
            client.list_tools().await
        }
        .await;

        match handshake {
            Ok(tools) => {
                tracing::info!(tool = %tool.name, count = tools.len(), "tool server ready");
                Ok(Self {
                    name: tool.name.clone(),
                    client,
                    capture,
                    tools,
                })
            }
            Err(e) => {
                client.into_transport().close(TOOL_EXIT_GRACE).await;
                capture.close().await;
                Err(e)
            }
        }
    }

    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    /// Stop the server first so its last stderr lines are drained, then
    /// close the capture.
    pub async fn shutdown(self) -> TeardownReport {
        let status = self.client.into_transport().close(TOOL_EXIT_GRACE).await;
        tracing::debug!(tool = %self.name, exit = ?status, "tool server stopped");
        let report = self.capture.close().await;
        tracing::debug!(tool = %self.name, tail_offset = ?report.tail_offset, "stderr capture closed");
        if !report.is_clean() {
            tracing::warn!(tool = %self.name, ?report, "stderr capture teardown had errors");
        }
        report
    }
}

async fn start_tools(tool: Option<&WorkIqTool>) -> Result<Option<ToolSession>, McpError> {
    match tool {
        Some(tool) => Ok(Some(ToolSession::start(tool, DEFAULT_REQUEST_TIMEOUT).await?)),
        None => Ok(None),
    }
}

/// Run the host in the configured mode.
pub async fn run(config: &HostConfig) -> Result<(), Box<dyn std::error::Error>> {
    let has_msi = config.auth.has_msi_endpoint();
    let credential = Credential::select(has_msi, config.auth.use_azure_cli_credential);
    tracing::info!(
        agent = config.agent_name(),
        credential = %credential,
        hosted = has_msi,
        mode = ?config.run.mode,
        "starting agent host"
    );

    let tool = workiq::build_workiq_tool(&config.workiq, has_msi, &WhichResolver);

    match config.run.mode {
        RunMode::Prompt => run_prompt(config, credential, tool.as_ref()).await,
        RunMode::Server => run_server(config, tool.as_ref()).await,
    }
}

/// One-shot mode: describe the agent request that would be sent and exit.
async fn run_prompt(
    config: &HostConfig,
    credential: Credential,
    tool: Option<&WorkIqTool>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Agent name: {}", config.agent_name());

    let session = start_tools(tool).await?;
    let tools = session
        .as_ref()
        .map(|s| s.tools().to_vec())
        .unwrap_or_default();

    println!(
        "Endpoint: {}",
        config.foundry.project_endpoint.as_deref().unwrap_or("<unset>")
    );
    println!(
        "Deployment: {}",
        config
            .foundry
            .model_deployment_name
            .as_deref()
            .unwrap_or("<unset>")
    );
    println!("Credential: {credential}");
    println!("Instructions: {}", config.agent.instructions);
    if tools.is_empty() {
        println!("Tools: (none)");
    } else {
        println!("Tools: {}", tools.join(", "));
    }
    println!("Prompt: {}", config.run.prompt);

    if let Some(session) = session {
        session.shutdown().await;
    }
    Ok(())
}

/// Hosted mode: keep the tool server up and serve until Ctrl-C.
async fn run_server(
    config: &HostConfig,
    tool: Option<&WorkIqTool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = start_tools(tool).await?;
    let tools = session
        .as_ref()
        .map(|s| s.tools().to_vec())
        .unwrap_or_default();
    let state = AppState::new(config.agent_name(), tools);

    let served = serve::run(&config.server, state, shutdown_signal()).await;

    if let Some(session) = session {
        session.shutdown().await;
    }
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
