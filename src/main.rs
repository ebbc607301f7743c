//! Punchmole - expose a private HTTP service through a public relay
//!
//! One binary, two roles: `punchmole relay` runs the public server that agents
//! register with, `punchmole agent` runs inside the private network and
//! forwards everything the relay hands it to a local target.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use punchmole_agent::config::{DEFAULT_PING_INTERVAL, DEFAULT_RECONNECT_DELAY};
use punchmole_agent::{AgentConfig, Supervisor};
use punchmole_relay::{RelayConfig, RelayServer};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_PORT: u16 = 10000;
const DEFAULT_ENDPOINT_URL: &str = "ws://localhost:10000/_punchmole";
const DEFAULT_TARGET_URL: &str = "http://localhost:3000";

/// Punchmole reverse HTTP/WebSocket tunnel
#[derive(Parser, Debug)]
#[command(name = "punchmole")]
#[command(about = "Punchmole reverse HTTP/WebSocket tunnel")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the public relay
    #[command(long_about = r#"
Run the public relay. Agents connect to the control endpoint, authenticate
with one of the configured API keys and register a domain. Public requests
are routed by their Host header to the agent owning that domain.

EXAMPLES:
  API_KEYS=secret-1,secret-2 punchmole relay
  punchmole relay --port 8080 --api-keys secret-1 --endpoint-path /_tunnel

ENVIRONMENT VARIABLES:
  PORT       Port to listen on (default 10000)
  API_KEYS   Comma-separated list of accepted API keys
"#)]
    Relay(RelayArgs),

    /// Run an agent next to a private service
    #[command(long_about = r#"
Connect to a relay, register a domain and forward every request the relay
receives for it to TARGET_URL. Reconnects after 500ms whenever the control
connection ends.

EXAMPLES:
  PUNCHMOLE_API_KEY=secret-1 DOMAIN=app.example.com punchmole agent
  punchmole agent --endpoint-url wss://relay.example.com/_punchmole \
    --api-key secret-1 --domain app.example.com --target-url http://localhost:8080

ENVIRONMENT VARIABLES:
  PUNCHMOLE_ENDPOINT_URL  Relay control endpoint (default ws://localhost:10000/_punchmole)
  PUNCHMOLE_API_KEY       API key presented at registration
  DOMAIN                  Public domain to register
  TARGET_URL              Private service base URL (default http://localhost:3000)
"#)]
    Agent(AgentArgs),
}

#[derive(Args, Debug, Default)]
struct RelayArgs {
    /// Port to listen on
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<IpAddr>,

    /// Accepted API keys, comma-separated
    #[arg(long, env = "API_KEYS", value_delimiter = ',')]
    api_keys: Vec<String>,

    /// Path of the agent control endpoint
    #[arg(long)]
    endpoint_path: Option<String>,
}

#[derive(Args, Debug, Default)]
struct AgentArgs {
    /// Relay control endpoint URL
    #[arg(long, env = "PUNCHMOLE_ENDPOINT_URL")]
    endpoint_url: Option<String>,

    /// API key presented at registration
    #[arg(long, env = "PUNCHMOLE_API_KEY")]
    api_key: Option<String>,

    /// Public domain to register
    #[arg(long, env = "DOMAIN")]
    domain: Option<String>,

    /// Base URL of the private service
    #[arg(long, env = "TARGET_URL")]
    target_url: Option<String>,

    /// Pause between reconnect attempts, in milliseconds
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,

    /// Keepalive ping interval, in seconds
    #[arg(long)]
    ping_interval_secs: Option<u64>,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    relay: RelayFileConfig,

    #[serde(default)]
    agent: AgentFileConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RelayFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    bind: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    api_keys: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint_path: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgentFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint_url: Option<String>,

    /// Environment variable holding the API key
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key_env: Option<String>,

    /// Direct API key (prefer using api_key_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    target_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    reconnect_delay_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    ping_interval_secs: Option<u64>,
}

/// Setup logging with the specified log level, unless RUST_LOG overrides it
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Drop blanks left by stray commas in `API_KEYS`
fn clean_api_keys(keys: Vec<String>) -> Vec<String> {
    keys.into_iter()
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .collect()
}

/// Merge CLI args with the relay section of the config file, CLI first
fn build_relay_config(args: RelayArgs, file: RelayFileConfig) -> Result<RelayConfig> {
    let port = args.port.or(file.port).unwrap_or(DEFAULT_PORT);
    let bind = args
        .bind
        .or(file.bind)
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let mut api_keys = clean_api_keys(args.api_keys);
    if api_keys.is_empty() {
        api_keys = clean_api_keys(file.api_keys);
    }
    if api_keys.is_empty() {
        anyhow::bail!(
            "Missing API_KEYS, please provide a list of comma-separated API keys allowed to connect to this service (e.g. API_KEYS=random-string punchmole relay)"
        );
    }

    let mut config = RelayConfig::new(SocketAddr::new(bind, port), api_keys);
    if let Some(path) = args.endpoint_path.or(file.endpoint_path) {
        config = config.with_endpoint_path(&path);
    }
    config.validate().context("Invalid relay configuration")?;

    Ok(config)
}

/// Merge CLI args with the agent section of the config file, CLI first
fn build_agent_config(args: AgentArgs, file: AgentFileConfig) -> Result<AgentConfig> {
    let file_api_key = match &file.api_key_env {
        Some(env_var) => Some(
            std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?,
        ),
        None => file.api_key,
    };

    let endpoint_url = args
        .endpoint_url
        .or(file.endpoint_url)
        .unwrap_or_else(|| DEFAULT_ENDPOINT_URL.to_string());
    let target_url = args
        .target_url
        .or(file.target_url)
        .unwrap_or_else(|| DEFAULT_TARGET_URL.to_string());

    let api_key = args.api_key.or(file_api_key).ok_or_else(|| {
        anyhow::anyhow!("API key is required (use --api-key, PUNCHMOLE_API_KEY or config file)")
    })?;
    let domain = args
        .domain
        .or(file.domain)
        .ok_or_else(|| anyhow::anyhow!("Domain is required (use --domain, DOMAIN or config file)"))?;

    let reconnect_delay = args
        .reconnect_delay_ms
        .or(file.reconnect_delay_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_RECONNECT_DELAY);
    let ping_interval = args
        .ping_interval_secs
        .or(file.ping_interval_secs)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_PING_INTERVAL);

    let config = AgentConfig::new(&endpoint_url, &api_key, &domain, &target_url)
        .context("Invalid agent configuration")?
        .with_reconnect_delay(reconnect_delay)
        .with_ping_interval(ping_interval);
    config.validate().context("Invalid agent configuration")?;

    Ok(config)
}

/// Cancel `token` on Ctrl+C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        token.cancel();
    });
}

async fn run_relay(config: RelayConfig) -> Result<()> {
    info!(
        bind = %config.bind_addr,
        endpoint_path = %config.endpoint_path,
        api_keys = config.api_keys.len(),
        "Punchmole relay starting..."
    );

    let server = RelayServer::bind(config)
        .await
        .context("Failed to start relay")?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    server
        .serve_with_shutdown(shutdown)
        .await
        .context("Relay stopped with an error")?;

    info!("Relay stopped");
    Ok(())
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    // Never log the API key
    info!(
        endpoint = %config.endpoint_url,
        domain = %config.domain,
        target = %config.target_url,
        "Punchmole agent starting..."
    );

    let mut supervisor = Supervisor::new(config).context("Failed to create agent")?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    supervisor.run(shutdown).await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    let file = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    match cli.command {
        Command::Relay(args) => run_relay(build_relay_config(args, file.relay)?).await,
        Command::Agent(args) => run_agent(build_agent_config(args, file.agent)?).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_api_keys() {
        let keys = vec!["k1".to_string(), "".to_string(), " k2 ".to_string()];
        assert_eq!(clean_api_keys(keys), vec!["k1", "k2"]);
        assert!(clean_api_keys(vec!["".to_string()]).is_empty());
    }

    #[test]
    fn test_relay_requires_api_keys() {
        let result = build_relay_config(RelayArgs::default(), RelayFileConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_relay_defaults() {
        let args = RelayArgs {
            api_keys: vec!["k1".to_string()],
            ..Default::default()
        };
        let config = build_relay_config(args, RelayFileConfig::default()).unwrap();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.endpoint_path, "/_punchmole");
        assert!(config.accepts_key("k1"));
    }

    #[test]
    fn test_relay_cli_overrides_file() {
        let args = RelayArgs {
            port: Some(8080),
            api_keys: vec!["cli".to_string()],
            ..Default::default()
        };
        let file = RelayFileConfig {
            port: Some(9090),
            api_keys: vec!["file".to_string()],
            endpoint_path: Some("/_tunnel".to_string()),
            ..Default::default()
        };
        let config = build_relay_config(args, file).unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.accepts_key("cli"));
        assert!(!config.accepts_key("file"));
        assert_eq!(config.endpoint_path, "/_tunnel");
    }

    #[test]
    fn test_agent_defaults() {
        let args = AgentArgs {
            api_key: Some("k1".to_string()),
            domain: Some("a.test".to_string()),
            ..Default::default()
        };
        let config = build_agent_config(args, AgentFileConfig::default()).unwrap();
        assert_eq!(config.endpoint_url.as_str(), DEFAULT_ENDPOINT_URL);
        assert_eq!(config.target_url.as_str(), "http://localhost:3000/");
        assert_eq!(config.reconnect_delay, DEFAULT_RECONNECT_DELAY);
        assert_eq!(config.ping_interval, DEFAULT_PING_INTERVAL);
    }

    #[test]
    fn test_agent_requires_key_and_domain() {
        let args = AgentArgs {
            domain: Some("a.test".to_string()),
            ..Default::default()
        };
        assert!(build_agent_config(args, AgentFileConfig::default()).is_err());

        let args = AgentArgs {
            api_key: Some("k1".to_string()),
            ..Default::default()
        };
        assert!(build_agent_config(args, AgentFileConfig::default()).is_err());
    }

    #[test]
    fn test_agent_file_values_fill_gaps() {
        let yaml = r#"
agent:
  api_key: from-file
  domain: file.test
  target_url: http://127.0.0.1:8080
  reconnect_delay_ms: 1000
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let args = AgentArgs {
            domain: Some("cli.test".to_string()),
            ..Default::default()
        };
        let config = build_agent_config(args, file.agent).unwrap();
        assert_eq!(config.api_key, "from-file");
        assert_eq!(config.domain, "cli.test");
        assert_eq!(config.target_url.as_str(), "http://127.0.0.1:8080/");
        assert_eq!(config.reconnect_delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_relay_section_parses() {
        let yaml = r#"
relay:
  port: 10001
  api_keys: [a, b]
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let config = build_relay_config(RelayArgs::default(), file.relay).unwrap();
        assert_eq!(config.bind_addr.port(), 10001);
        assert!(config.accepts_key("b"));
    }
}
