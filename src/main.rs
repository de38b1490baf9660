mod config;
mod credential;
mod host;
mod logging;
mod mcp;
mod serve;
mod stderr_capture;
mod tail;
mod transport;
mod workiq;

use clap::Parser;
use config::{ProcessEnv, RunMode};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::filter::LevelFilter;

/// Launch a hosted conversational agent with an optional stdio tool server
/// whose stderr is captured to a log file and echoed into this process's log.
#[derive(Parser, Debug)]
#[command(name = "foundry-agent-host", version, about)]
pub struct Cli {
    /// Config file path (missing file = defaults + environment)
    #[arg(short, long, default_value = "agent-host.toml")]
    config: PathBuf,

    /// Run mode (overrides RUN_MODE)
    #[arg(short, long, value_enum)]
    mode: Option<RunMode>,

    /// Prompt for prompt mode (overrides PROMPT)
    #[arg(short, long)]
    prompt: Option<String>,

    /// Listen port for server mode (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Debug logging regardless of LOG_LEVEL
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut config::HostConfig) {
        if let Some(mode) = self.mode {
            config.run.mode = mode;
        }
        if let Some(prompt) = &self.prompt {
            config.run.prompt = prompt.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let dotenv = config::load_dotenv();

    let mut config = match config::load(&cli.config, &ProcessEnv) {
        Ok(config) => config,
        Err(e) => {
            let _telemetry = logging::init(LevelFilter::INFO, None);
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);

    let _telemetry = logging::init(
        logging::resolve_level(&config.logging, cli.verbose),
        logging::otlp_endpoint(config.server.enable_otel, config.auth.has_msi_endpoint()),
    );
    tracing::debug!(?cli, "parsed CLI arguments");
    match dotenv {
        Ok(Some(path)) => tracing::debug!(path = %path.display(), "loaded .env"),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "ignoring unreadable .env"),
    }

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(rendered) => {
                println!("{rendered}");
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to render config");
                return ExitCode::FAILURE;
            }
        }
    }

    match host::run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
