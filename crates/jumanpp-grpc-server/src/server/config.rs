use crate::server::backend::ScorerDef;
use anyhow::{Context, bail};
use clap::Parser;
use jumanpp_grpc_core::proto::JumanppConfig;
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

/// Runtime configuration for the `jumanpp-grpc-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a `.env`
/// file is honored), with defaults suitable for a single-host deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "jumanpp-grpc-server",
    version,
    about = "A gRPC service for unary and streaming Juman++ lattice analysis"
)]
pub struct CliArgs {
    /// Path to a JSON model configuration: default beams, scorers and the
    /// fields accepted in partial annotations. Built-in defaults are used when
    /// omitted.
    ///
    /// Environment variable: `JUMANPP_CONFIG`
    #[arg(long, env = "JUMANPP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Interface to bind.
    ///
    /// Environment variable: `HOST`
    #[arg(long, env = "HOST", default_value_t = String::from("0.0.0.0"))]
    pub host: String,

    /// Port to bind. `0` lets the OS pick one; the bound port is printed on
    /// stdout either way.
    ///
    /// Environment variable: `PORT`
    #[arg(long, env = "PORT", default_value_t = 0)]
    pub port: u16,

    /// Number of compute threads running analyses.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = num_cpus::get())]
    pub num_workers: usize,

    /// Number of tasks delivering accept, read and write completions.
    ///
    /// Environment variable: `IO_WORKERS`
    #[arg(long, env = "IO_WORKERS", default_value_t = 2)]
    pub io_workers: usize,

    /// Maximum number of analyzers kept alive at once. Requests that find
    /// every analyzer busy fail with `RESOURCE_EXHAUSTED`.
    ///
    /// Environment variable: `CACHE_CAPACITY`
    #[arg(long, env = "CACHE_CAPACITY", default_value_t = 40)]
    pub cache_capacity: usize,

    /// Replies buffered per stream before writes wait for the client.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 8)]
    pub stream_buffer_size: usize,

    /// Seconds to wait for in-flight calls on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,
}

/// Model settings loaded from the `--config` file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub local_beam: i32,
    pub global_beam_left: i32,
    pub global_beam_right: i32,
    pub global_beam_check: bool,
    pub ignore_rnn: bool,
    pub top_n: i32,
    /// Scorers in priority order; the first one is the primary scorer. Empty
    /// means the backend's built-in scorers.
    pub scorers: ScorerDef,
    /// Field names accepted in partial annotations. Empty means the backend's
    /// built-in fields.
    pub fields: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            local_beam: 5,
            global_beam_left: 0,
            global_beam_right: 0,
            global_beam_check: false,
            ignore_rnn: false,
            top_n: 0,
            scorers: ScorerDef::default(),
            fields: Vec::new(),
        }
    }
}

impl ModelConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("malformed model configuration")
    }

    /// The configuration applied to calls that send no header.
    pub fn defaults(&self) -> JumanppConfig {
        JumanppConfig {
            local_beam: self.local_beam,
            global_beam_left: self.global_beam_left,
            global_beam_right: self.global_beam_right,
            global_beam_check: self.global_beam_check,
            ignore_rnn: self.ignore_rnn,
            top_n: self.top_n,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub model: ModelConfig,
    pub server_addr: String,
    pub num_workers: usize,
    pub io_workers: usize,
    pub cache_capacity: usize,
    pub stream_buffer_size: usize,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.io_workers == 0 {
            bail!("IO_WORKERS must be greater than 0");
        }

        if args.cache_capacity == 0 {
            bail!("CACHE_CAPACITY must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        let model = match &args.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                ModelConfig::from_json(&json)?
            }
            None => ModelConfig::default(),
        };

        if let Err(e) = model.defaults().validate() {
            bail!("invalid model configuration: {e}");
        }

        Ok(Self {
            model,
            server_addr: format!("{}:{}", args.host, args.port),
            num_workers: args.num_workers,
            io_workers: args.io_workers,
            cache_capacity: args.cache_capacity,
            stream_buffer_size: args.stream_buffer_size,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}
