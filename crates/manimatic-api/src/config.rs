//! API server configuration.
//!
//! Every setting is reachable both as a SCREAMING_SNAKE environment variable
//! and a kebab-case command-line flag. Provider API keys resolve from three
//! sources in order: a secret file, an SSM parameter path, a literal value.

use anyhow::{Context, Result, bail};
use clap::Parser;

use manimatic_core::LogFormat;

use crate::features::Features;

/// Shortest prompt accepted by `/generate` and `/compile`.
pub const MIN_PROMPT_LEN: usize = 8;

/// Manimatic API server arguments.
#[derive(Debug, Parser)]
#[command(name = "manimatic-api")]
#[command(about = "Serves the animation generation API and client event streams")]
#[command(version)]
pub struct Args {
    /// HTTP bind host.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP bind port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Custom AWS endpoint URL (for local stacks).
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    pub aws_endpoint_url: Option<String>,

    /// Task queue URL to publish compile requests to.
    #[arg(long, env = "TASK_QUEUE_URL")]
    pub task_queue_url: String,

    /// Result queue URL to relay compile outcomes from.
    #[arg(long, env = "RESULT_QUEUE_URL")]
    pub result_queue_url: String,

    /// Log level (debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text or json).
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Call the provider's moderation endpoint before generation.
    #[arg(long, env = "ENABLE_MODERATION", default_value_t = false)]
    pub enable_moderation: bool,

    /// Comma-separated feature flags (user-compile, high-quality).
    #[arg(long, env = "FEATURES", default_value = "")]
    pub features: String,

    /// Comma-separated CORS origins; localhost is always allowed.
    #[arg(long, env = "ALLOWED_ORIGINS", default_value = "")]
    pub allowed_origins: String,

    /// OpenAI API key literal.
    #[arg(long, env = "OPENAI_API_KEY")]
    pub openai_api_key: Option<String>,

    /// Path to a secret file containing the OpenAI key.
    #[arg(long, env = "OPENAI_API_KEY_FILE")]
    pub openai_api_key_file: Option<String>,

    /// SSM parameter path for the OpenAI key.
    #[arg(long, env = "OPENAI_API_KEY_SSM_PATH")]
    pub openai_api_key_ssm_path: Option<String>,

    /// xAI API key literal.
    #[arg(long, env = "XAI_API_KEY")]
    pub xai_api_key: Option<String>,

    /// Path to a secret file containing the xAI key.
    #[arg(long, env = "XAI_API_KEY_FILE")]
    pub xai_api_key_file: Option<String>,

    /// SSM parameter path for the xAI key.
    #[arg(long, env = "XAI_API_KEY_SSM_PATH")]
    pub xai_api_key_ssm_path: Option<String>,
}

/// Validated server configuration.
#[derive(Clone)]
pub struct Config {
    /// HTTP bind host.
    pub host: String,
    /// HTTP bind port.
    pub port: u16,
    /// Custom AWS endpoint URL.
    pub aws_endpoint_url: Option<String>,
    /// Task queue URL (compile requests out).
    pub task_queue_url: String,
    /// Result queue URL (compile outcomes in).
    pub result_queue_url: String,
    /// Log level.
    pub log_level: String,
    /// Log format.
    pub log_format: LogFormat,
    /// Whether to gate generation behind moderation.
    pub enable_moderation: bool,
    /// Parsed feature flags.
    pub features: Features,
    /// Explicitly allowed CORS origins.
    pub allowed_origins: Vec<String>,
    /// Resolved OpenAI API key.
    pub openai_api_key: Option<String>,
    /// Resolved xAI API key.
    pub xai_api_key: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("aws_endpoint_url", &self.aws_endpoint_url)
            .field("task_queue_url", &self.task_queue_url)
            .field("result_queue_url", &self.result_queue_url)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("enable_moderation", &self.enable_moderation)
            .field("features", &self.features)
            .field("allowed_origins", &self.allowed_origins)
            .field(
                "openai_api_key",
                &self.openai_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "xai_api_key",
                &self.xai_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl Args {
    /// Resolves secrets and validates the arguments into a [`Config`].
    ///
    /// # Errors
    ///
    /// Returns an error when required settings are missing, a secret source
    /// cannot be read, or no provider key resolves.
    pub async fn into_config(self) -> Result<Config> {
        if self.task_queue_url.trim().is_empty() {
            bail!("task queue URL is required");
        }
        if self.result_queue_url.trim().is_empty() {
            bail!("result queue URL is required");
        }

        let openai_api_key = resolve_key(
            "OpenAI",
            self.openai_api_key.as_deref(),
            self.openai_api_key_file.as_deref(),
            self.openai_api_key_ssm_path.as_deref(),
        )
        .await?;
        let xai_api_key = resolve_key(
            "xAI",
            self.xai_api_key.as_deref(),
            self.xai_api_key_file.as_deref(),
            self.xai_api_key_ssm_path.as_deref(),
        )
        .await?;

        if openai_api_key.is_none() && xai_api_key.is_none() {
            bail!("no provider API key configured; set OPENAI_API_KEY or XAI_API_KEY (or their _FILE/_SSM_PATH variants)");
        }

        Ok(Config {
            host: self.host,
            port: self.port,
            aws_endpoint_url: self.aws_endpoint_url,
            task_queue_url: self.task_queue_url,
            result_queue_url: self.result_queue_url,
            log_level: self.log_level,
            log_format: self.log_format,
            enable_moderation: self.enable_moderation,
            features: Features::from_flags(&self.features),
            allowed_origins: parse_allowed_origins(&self.allowed_origins),
            openai_api_key,
            xai_api_key,
        })
    }
}

/// Resolves one provider key: secret file, then SSM parameter, then literal.
async fn resolve_key(
    provider: &str,
    literal: Option<&str>,
    file: Option<&str>,
    ssm_path: Option<&str>,
) -> Result<Option<String>> {
    if let Some(path) = file {
        let key = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {provider} key from secret file {path}"))?;
        return Ok(Some(key.trim().to_string()));
    }

    if let Some(path) = ssm_path {
        let key = read_ssm_parameter(path)
            .await
            .with_context(|| format!("failed to read {provider} key from SSM parameter {path}"))?;
        return Ok(Some(key));
    }

    Ok(literal
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string))
}

async fn read_ssm_parameter(path: &str) -> Result<String> {
    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
    let client = aws_sdk_ssm::Client::new(&aws_config);

    let output = client
        .get_parameter()
        .name(path)
        .with_decryption(true)
        .send()
        .await
        .context("SSM get_parameter failed")?;

    output
        .parameter()
        .and_then(|parameter| parameter.value())
        .map(str::to_string)
        .context("SSM parameter has no value")
}

fn parse_allowed_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}
