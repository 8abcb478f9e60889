use crate::{
    routes::cors::CorsPolicy,
    services::{bot_api_transport::DEFAULT_BOT_API_URL, session_store::{DEFAULT_MAX_TOTAL_CHUNKS, DEFAULT_SESSION_TTL_SECS}},
};
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, fmt::Display, str::FromStr, time::Duration};

/// Default interval between background expiry sweeps: 30 minutes.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30 * 60;

/// Default cap on a single request body. Fits a 4 MiB chunk after base64.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Where assembled files are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Telegram Bot API; the upload `session` is the bot token.
    Bot,
    /// In-process store, for local development.
    Memory,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true)
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub max_body_bytes: usize,
    pub max_total_chunks: usize,
    pub cors: CorsPolicy,
    pub transport: TransportKind,
    pub bot_api_url: String,
    pub chat_id: Option<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked upload relay")]
pub struct Args {
    /// Host to bind to (overrides HCLOUD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides HCLOUD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Upload session lifetime in seconds (overrides HCLOUD_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Seconds between background expiry sweeps (overrides HCLOUD_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Maximum request body size in bytes (overrides HCLOUD_MAX_BODY_BYTES)
    #[arg(long)]
    pub max_body_bytes: Option<usize>,

    /// Largest totalChunks an upload may declare (overrides HCLOUD_MAX_TOTAL_CHUNKS)
    #[arg(long)]
    pub max_total_chunks: Option<usize>,

    /// Allowed CORS origins, `*` or comma separated (overrides HCLOUD_CORS_ORIGIN)
    #[arg(long)]
    pub cors_origin: Option<String>,

    /// Transport for assembled files (overrides HCLOUD_TRANSPORT)
    #[arg(long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Bot API base URL (overrides HCLOUD_BOT_API_URL)
    #[arg(long)]
    pub bot_api_url: Option<String>,

    /// Chat receiving uploaded documents (overrides HCLOUD_CHAT_ID)
    #[arg(long)]
    pub chat_id: Option<String>,
}

/// Read `key` through `lookup` and parse it, or fall back to `default`.
fn env_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::resolve(Args::parse(), |key| env::var(key).ok())
    }

    /// Merge `args` over values produced by `lookup`; CLI wins.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = lookup("HCLOUD_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = env_or(&lookup, "HCLOUD_PORT", 3001u16)?;
        let env_ttl = env_or(&lookup, "HCLOUD_SESSION_TTL_SECS", DEFAULT_SESSION_TTL_SECS as u64)?;
        let env_sweep = env_or(&lookup, "HCLOUD_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)?;
        let env_body = env_or(&lookup, "HCLOUD_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?;
        let env_chunks = env_or(&lookup, "HCLOUD_MAX_TOTAL_CHUNKS", DEFAULT_MAX_TOTAL_CHUNKS)?;
        let env_cors = lookup("HCLOUD_CORS_ORIGIN").unwrap_or_else(|| "*".into());
        let env_transport = env_or(&lookup, "HCLOUD_TRANSPORT", TransportKind::Bot)?;
        let env_bot_url =
            lookup("HCLOUD_BOT_API_URL").unwrap_or_else(|| DEFAULT_BOT_API_URL.into());
        let env_chat = lookup("HCLOUD_CHAT_ID").filter(|v| !v.trim().is_empty());

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            session_ttl: Duration::from_secs(args.session_ttl_secs.unwrap_or(env_ttl)),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs.unwrap_or(env_sweep)),
            max_body_bytes: args.max_body_bytes.unwrap_or(env_body),
            max_total_chunks: args.max_total_chunks.unwrap_or(env_chunks),
            cors: CorsPolicy::parse(&args.cors_origin.unwrap_or(env_cors)),
            transport: args.transport.unwrap_or(env_transport),
            bot_api_url: args.bot_api_url.unwrap_or(env_bot_url),
            chat_id: args.chat_id.or(env_chat),
        };

        // --- Validate ---
        if cfg.session_ttl.is_zero() {
            bail!("session TTL must be positive");
        }
        if cfg.sweep_interval.is_zero() {
            bail!("sweep interval must be positive");
        }
        if cfg.max_total_chunks == 0 {
            bail!("max total chunks must be positive");
        }
        if cfg.transport == TransportKind::Bot && cfg.chat_id.is_none() {
            bail!("HCLOUD_CHAT_ID (or --chat-id) is required for the bot transport");
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
