// Command line and environment configuration

use crate::error::RelayError;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModelSource {
    /// Parse the output of `ollama list`.
    Cli,
    /// Query the backend's `/api/tags` endpoint.
    Api,
}

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Streams Ollama generations to clients with per-session cancellation")]
pub struct CliArgs {
    /// Address the relay listens on.
    #[arg(long, env = "RELAY_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// Base URL of the Ollama backend.
    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
    pub backend_url: String,

    /// Model used by `/ask` when the request names none.
    #[arg(long, env = "RELAY_DEFAULT_MODEL", default_value = "gemma3:270m")]
    pub default_model: String,

    /// Model used by `/ask2` when the request names none.
    #[arg(long, env = "RELAY_DEFAULT_SYSTEM_MODEL", default_value = "llama3.2:3b")]
    pub default_system_model: String,

    /// Seconds allowed for establishing a backend connection.
    #[arg(long, env = "RELAY_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Cancel generations that run longer than this many seconds.
    #[arg(long, env = "RELAY_GENERATION_TIMEOUT_SECS")]
    pub generation_timeout_secs: Option<u64>,

    /// Fragments buffered per client before backend reads pause.
    #[arg(long, env = "RELAY_FRAGMENT_BUFFER", default_value_t = 16)]
    pub fragment_buffer: usize,

    /// Where model listings come from.
    #[arg(long, env = "RELAY_MODEL_SOURCE", value_enum, default_value_t = ModelSource::Cli)]
    pub model_source: ModelSource,

    /// Ollama executable used when the model source is `cli`.
    #[arg(long, env = "OLLAMA_BIN", default_value = "ollama")]
    pub ollama_bin: String,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub backend_url: String,
    pub default_model: String,
    pub default_system_model: String,
    pub connect_timeout: Duration,
    pub generation_timeout: Option<Duration>,
    pub fragment_buffer: usize,
    pub model_source: ModelSource,
    pub ollama_bin: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            backend_url: "http://localhost:11434".to_string(),
            default_model: "gemma3:270m".to_string(),
            default_system_model: "llama3.2:3b".to_string(),
            connect_timeout: Duration::from_secs(10),
            generation_timeout: None,
            fragment_buffer: 16,
            model_source: ModelSource::Cli,
            ollama_bin: "ollama".to_string(),
        }
    }
}

impl TryFrom<CliArgs> for RelayConfig {
    type Error = RelayError;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let listen_addr = args
            .listen_addr
            .parse()
            .map_err(|e| RelayError::Config(format!("listen address {:?}: {}", args.listen_addr, e)))?;

        if args.fragment_buffer == 0 {
            return Err(RelayError::Config("fragment buffer must be at least 1".into()));
        }
        if args.generation_timeout_secs == Some(0) {
            return Err(RelayError::Config("generation timeout must be positive".into()));
        }

        let backend_url = args.backend_url.trim_end_matches('/').to_string();
        if !backend_url.starts_with("http://") && !backend_url.starts_with("https://") {
            return Err(RelayError::Config(format!(
                "backend url must be http(s): {backend_url}"
            )));
        }

        Ok(Self {
            listen_addr,
            backend_url,
            default_model: args.default_model,
            default_system_model: args.default_system_model,
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            generation_timeout: args.generation_timeout_secs.map(Duration::from_secs),
            fragment_buffer: args.fragment_buffer,
            model_source: args.model_source,
            ollama_bin: args.ollama_bin,
        })
    }
}
