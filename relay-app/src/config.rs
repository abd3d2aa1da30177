//! Relay configuration loader.
//!
//! Everything comes from the process environment (optionally seeded from a
//! `.env` file). Three secrets are required; the rest have defaults.

use relay_channels::LINE_API_BASE_URL;
use relay_llm::{DEFAULT_BASE_URL, DEFAULT_MODEL, SamplingParams};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_LINE_ACCESS_TOKEN: &str = "LINE_CHANNEL_ACCESS_TOKEN";
pub const ENV_LINE_CHANNEL_SECRET: &str = "LINE_CHANNEL_SECRET";
pub const ENV_XAI_API_KEY: &str = "XAI_API_KEY";

#[derive(Clone)]
pub struct RelayConfig {
    pub line: LineConfig,
    pub generation: GenerationConfig,
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
    pub prompts_file: Option<PathBuf>,
}

#[derive(Clone)]
pub struct LineConfig {
    pub access_token: String,
    pub channel_secret: String,
    pub api_base_url: String,
}

#[derive(Clone)]
pub struct GenerationConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub sampling: SamplingParams,
    /// Logged when exceeded; the call is never cancelled.
    pub soft_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_concurrent_requests: usize,
    pub max_segment_chars: usize,
    pub push_delay: Duration,
    pub loading_seconds: u32,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub http_timeout: Duration,
    pub http_max_in_flight: usize,
    /// How long shutdown waits for dispatched messages to be answered.
    pub shutdown_drain: Duration,
}

impl RelayConfig {
    pub fn load() -> anyhow::Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!(path = %path.display(), "loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(anyhow::anyhow!("read .env: {e}")),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let missing: Vec<&str> = [
            ENV_LINE_ACCESS_TOKEN,
            ENV_LINE_CHANNEL_SECRET,
            ENV_XAI_API_KEY,
        ]
        .into_iter()
        .filter(|key| env.get(key).is_none())
        .collect();
        if !missing.is_empty() {
            return Err(anyhow::anyhow!(
                "missing required environment variables: {}",
                missing.join(", ")
            ));
        }

        let cfg = Self {
            line: LineConfig {
                access_token: env.get(ENV_LINE_ACCESS_TOKEN).unwrap_or_default(),
                channel_secret: env.get(ENV_LINE_CHANNEL_SECRET).unwrap_or_default(),
                api_base_url: env
                    .get("LINE_API_BASE_URL")
                    .unwrap_or_else(|| LINE_API_BASE_URL.to_string()),
            },
            generation: GenerationConfig {
                api_key: env.get(ENV_XAI_API_KEY).unwrap_or_default(),
                base_url: env
                    .get("XAI_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
                model: env
                    .get("XAI_MODEL")
                    .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                sampling: SamplingParams {
                    max_tokens: env.parse("XAI_MAX_TOKENS", 1000)?,
                    temperature: env.parse("XAI_TEMPERATURE", 0.7)?,
                },
                soft_timeout: Duration::from_secs(env.parse("GENERATION_SOFT_TIMEOUT_SECS", 15)?),
            },
            pipeline: PipelineConfig {
                max_concurrent_requests: env.parse("MAX_CONCURRENT_REQUESTS", 5)?,
                max_segment_chars: env.parse("MAX_SEGMENT_CHARS", 1000)?,
                push_delay: Duration::from_millis(env.parse("PUSH_DELAY_MS", 500)?),
                loading_seconds: env.parse("LOADING_SECONDS", 10)?,
            },
            server: ServerConfig {
                port: env.parse("PORT", 5000)?,
                http_timeout: Duration::from_secs(env.parse("HTTP_TIMEOUT_SECS", 30)?),
                http_max_in_flight: env.parse("HTTP_MAX_IN_FLIGHT", 256)?,
                shutdown_drain: Duration::from_secs(env.parse("SHUTDOWN_DRAIN_SECS", 60)?),
            },
            prompts_file: env.get("RELAY_PROMPTS_FILE").map(PathBuf::from),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.pipeline.max_concurrent_requests == 0 {
            return Err(anyhow::anyhow!("MAX_CONCURRENT_REQUESTS must be > 0"));
        }
        if self.pipeline.max_segment_chars == 0 {
            return Err(anyhow::anyhow!("MAX_SEGMENT_CHARS must be > 0"));
        }
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("PORT must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("HTTP_MAX_IN_FLIGHT must be > 0"));
        }
        let temperature = self.generation.sampling.temperature;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(anyhow::anyhow!(
                "XAI_TEMPERATURE must be within 0.0..=2.0, got {temperature}"
            ));
        }
        if self.generation.sampling.max_tokens == 0 {
            return Err(anyhow::anyhow!("XAI_MAX_TOKENS must be > 0"));
        }
        Ok(())
    }

    /// Loggable view of the configuration with secrets reduced to presence.
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "line": {
                "access_token_set": !self.line.access_token.is_empty(),
                "channel_secret_set": !self.line.channel_secret.is_empty(),
                "api_base_url": self.line.api_base_url,
            },
            "generation": {
                "api_key_set": !self.generation.api_key.is_empty(),
                "base_url": self.generation.base_url,
                "model": self.generation.model,
                "max_tokens": self.generation.sampling.max_tokens,
                "temperature": self.generation.sampling.temperature,
                "soft_timeout_secs": self.generation.soft_timeout.as_secs(),
            },
            "pipeline": {
                "max_concurrent_requests": self.pipeline.max_concurrent_requests,
                "max_segment_chars": self.pipeline.max_segment_chars,
                "push_delay_ms": self.pipeline.push_delay.as_millis() as u64,
                "loading_seconds": self.pipeline.loading_seconds,
            },
            "server": {
                "port": self.server.port,
                "http_timeout_secs": self.server.http_timeout.as_secs(),
                "http_max_in_flight": self.server.http_max_in_flight,
                "shutdown_drain_secs": self.server.shutdown_drain.as_secs(),
            },
            "prompts_file": self.prompts_file.as_ref().map(|p| p.display().to_string()),
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        }
    }
}
