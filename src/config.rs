use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Values accepted as "on" by the loose flag parser.
const TRUTHY: &[&str] = &["1", "true", "yes", "on"];

/// Default destination for captured tool stderr.
pub const DEFAULT_STDERR_LOG_PATH: &str = "/tmp/workiq-mcp.stderr.log";

/// Top-level configuration loaded from agent-host.toml and overlaid by env vars.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HostConfig {
    pub server: ServerConfig,
    pub foundry: FoundryConfig,
    pub agent: AgentConfig,
    pub logging: LoggingConfig,
    pub auth: AuthConfig,
    pub run: RunConfig,
    pub workiq: WorkIqConfig,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub enable_otel: bool,
    pub enable_server_tracing: bool,
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FoundryConfig {
    pub project_endpoint: Option<String>,
    pub model_deployment_name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: Option<String>,
    pub instructions: String,
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub debug: bool,
    pub af_debug: bool,
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub use_azure_cli_credential: bool,
    /// Set by the hosting platform; never read from the config file.
    #[serde(skip)]
    pub msi_endpoint: Option<String>,
}

impl AuthConfig {
    /// Whether this process runs inside a managed-identity host.
    pub fn has_msi_endpoint(&self) -> bool {
        self.msi_endpoint.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Send a single prompt and exit.
    Prompt,
    /// Run as a long-lived hosted server.
    #[default]
    Server,
}

impl RunMode {
    /// Anything other than `prompt` selects server mode.
    pub fn parse_lenient(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("prompt") {
            RunMode::Prompt
        } else {
            RunMode::Server
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    pub mode: RunMode,
    pub prompt: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkIqConfig {
    pub enabled: bool,
    pub allow_hosted: bool,
    pub command: String,
    pub tenant_id: Option<String>,
    pub approval_mode: Option<String>,
    pub capture_stderr: bool,
    pub echo_stderr: bool,
    pub stderr_log_path: PathBuf,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8088,
            enable_otel: false,
            enable_server_tracing: false,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: None,
            instructions: "You are good at telling jokes.".to_string(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Server,
            prompt: "Tell me a joke about a pirate.".to_string(),
        }
    }
}

impl Default for WorkIqConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_hosted: false,
            command: "npx".to_string(),
            tenant_id: None,
            approval_mode: None,
            capture_stderr: true,
            echo_stderr: true,
            stderr_log_path: PathBuf::from(DEFAULT_STDERR_LOG_PATH),
        }
    }
}

/// Errors produced while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for `HostConfig`.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A strict boolean variable held something other than true/false.
    InvalidBool { name: String, value: String },
    /// `PORT` was not a valid TCP port.
    InvalidPort { value: String },
    /// A required setting was absent from both the file and the environment.
    Missing { name: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::InvalidBool { name, value } => {
                write!(f, "{name} must be 'true' or 'false' (got {value:?})")
            }
            ConfigError::InvalidPort { value } => {
                write!(f, "PORT must be a TCP port number (got {value:?})")
            }
            ConfigError::Missing { name } => write!(f, "missing required env var: {name}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Where configuration variables are looked up.
///
/// The process environment in production; a plain map in tests.
pub trait EnvSource {
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads from `std::env`.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Loose flag check: `1`, `true`, `yes`, `on` (any case) are on, anything else off.
pub fn env_truthy(env: &dyn EnvSource, name: &str) -> bool {
    env.var(name)
        .map(|v| TRUTHY.contains(&v.trim().to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Strict boolean: unset yields `default`, otherwise only `true`/`false` are accepted.
pub fn get_bool(env: &dyn EnvSource, name: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = env.var(name) else {
        return Ok(default);
    };
    match raw.trim().to_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            name: name.to_string(),
            value: raw,
        }),
    }
}

/// Trimmed string; unset or blank yields `default`.
pub fn get_str(env: &dyn EnvSource, name: &str, default: &str) -> String {
    get_optional_str(env, name).unwrap_or_else(|| default.to_string())
}

/// Trimmed string; unset or blank yields `None`.
pub fn get_optional_str(env: &dyn EnvSource, name: &str) -> Option<String> {
    env.var(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Loose flag that keeps `default` when the variable is unset.
fn get_truthy(env: &dyn EnvSource, name: &str, default: bool) -> bool {
    if env.var(name).is_some() {
        env_truthy(env, name)
    } else {
        default
    }
}

fn overlay_optional(env: &dyn EnvSource, name: &str, slot: &mut Option<String>) {
    if let Some(value) = get_optional_str(env, name) {
        *slot = Some(value);
    }
}

impl HostConfig {
    /// Parse a config file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Overlay environment variables on top of the file values.
    pub fn apply_env(&mut self, env: &dyn EnvSource) -> Result<(), ConfigError> {
        if let Some(port) = get_optional_str(env, "PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidPort { value: port })?;
        }
        self.server.enable_otel = get_bool(env, "ENABLE_OTEL", self.server.enable_otel)?;
        self.server.enable_server_tracing = get_bool(
            env,
            "ENABLE_SERVER_TRACING",
            self.server.enable_server_tracing,
        )?;

        overlay_optional(
            env,
            "AZURE_AI_PROJECT_ENDPOINT",
            &mut self.foundry.project_endpoint,
        );
        overlay_optional(
            env,
            "AZURE_AI_MODEL_DEPLOYMENT_NAME",
            &mut self.foundry.model_deployment_name,
        );

        overlay_optional(env, "AGENT_NAME", &mut self.agent.name);
        self.agent.instructions = get_str(env, "AGENT_INSTRUCTIONS", &self.agent.instructions);

        overlay_optional(env, "LOG_LEVEL", &mut self.logging.level);
        self.logging.debug = get_bool(env, "DEBUG", self.logging.debug)?;
        self.logging.af_debug = get_bool(env, "AF_DEBUG", self.logging.af_debug)?;

        self.auth.use_azure_cli_credential = get_bool(
            env,
            "USE_AZURE_CLI_CREDENTIAL",
            self.auth.use_azure_cli_credential,
        )?;
        self.auth.msi_endpoint = get_optional_str(env, "MSI_ENDPOINT");

        if let Some(mode) = get_optional_str(env, "RUN_MODE") {
            self.run.mode = RunMode::parse_lenient(&mode);
        }
        self.run.prompt = get_str(env, "PROMPT", &self.run.prompt);

        let wq = &mut self.workiq;
        wq.enabled = get_truthy(env, "ENABLE_WORKIQ", wq.enabled);
        wq.allow_hosted = get_truthy(env, "WORKIQ_ALLOW_HOSTED", wq.allow_hosted);
        wq.command = get_str(env, "WORKIQ_COMMAND", &wq.command);
        overlay_optional(env, "WORKIQ_TENANT_ID", &mut wq.tenant_id);
        overlay_optional(env, "WORKIQ_APPROVAL_MODE", &mut wq.approval_mode);
        wq.capture_stderr = get_bool(env, "WORKIQ_CAPTURE_STDERR", wq.capture_stderr)?;
        wq.echo_stderr = get_bool(env, "WORKIQ_ECHO_STDERR", wq.echo_stderr)?;
        if let Some(path) = get_optional_str(env, "WORKIQ_STDERR_LOG_PATH") {
            wq.stderr_log_path = PathBuf::from(path);
        }

        Ok(())
    }

    /// Check that every required setting is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("AZURE_AI_PROJECT_ENDPOINT", &self.foundry.project_endpoint),
            (
                "AZURE_AI_MODEL_DEPLOYMENT_NAME",
                &self.foundry.model_deployment_name,
            ),
            ("AGENT_NAME", &self.agent.name),
        ];
        for (name, value) in required {
            if value.as_deref().map_or(true, |v| v.trim().is_empty()) {
                return Err(ConfigError::Missing {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    /// The agent name, once `validate` has passed.
    pub fn agent_name(&self) -> &str {
        self.agent.name.as_deref().unwrap_or("HostedAgent")
    }
}

/// Load a config file, overlay the environment, and validate.
pub fn load(path: &Path, env: &dyn EnvSource) -> Result<HostConfig, ConfigError> {
    let mut config = HostConfig::from_file(path)?;
    config.apply_env(env)?;
    config.validate()?;
    Ok(config)
}

/// Load `.env` from the working directory (or the nearest parent that has
/// one) into the process environment.
///
/// Values from the file override variables already set. A missing file is
/// not an error.
pub fn load_dotenv() -> Result<Option<PathBuf>, dotenv::Error> {
    let cwd = std::env::current_dir().map_err(dotenv::Error::Io)?;
    match find_dotenv(&cwd) {
        Some(path) => apply_dotenv(&path).map(Some),
        None => Ok(None),
    }
}

fn find_dotenv(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(".env"))
        .find(|candidate| candidate.is_file())
}

#[allow(deprecated)]
fn apply_dotenv(path: &Path) -> Result<PathBuf, dotenv::Error> {
    for item in dotenv::from_path_iter(path)? {
        let (key, value) = item?;
        std::env::set_var(key, value);
    }
    Ok(path.to_path_buf())
}
