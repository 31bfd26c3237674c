use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::AppError;

/// Runtime configuration, loaded from the environment (and `.env` in development).
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL; in-memory stores are used when unset.
    pub database_url: Option<String>,
    pub port: u16,

    pub ollama_base_url: String,
    pub ollama_model: String,
    pub openai_base_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub lite_model_cost: i64,
    pub pro_model_cost: i64,

    pub daily_free_tokens: i64,
    pub max_context_messages: usize,
    pub stream_timeout: Duration,
    pub leaf_cache_ttl: Duration,

    pub free_model_requests_per_window: u32,
    pub image_requests_per_window: u32,
    pub rate_window_secs: i64,
    pub max_concurrent_jobs: u32,
    pub image_job_cost: i64,
    pub image_api_base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            port: 8080,
            ollama_base_url: "http://localhost:11434".into(),
            ollama_model: "llama3.2".into(),
            openai_base_url: None,
            openai_api_key: None,
            openai_model: "gpt-4o-mini".into(),
            lite_model_cost: 1,
            pro_model_cost: 5,
            daily_free_tokens: 50,
            max_context_messages: 200,
            stream_timeout: Duration::from_secs(45),
            leaf_cache_ttl: Duration::from_secs(3600),
            free_model_requests_per_window: 30,
            image_requests_per_window: 10,
            rate_window_secs: 7200,
            max_concurrent_jobs: 1,
            image_job_cost: 10,
            image_api_base_url: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let d = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            database_url: text("DATABASE_URL"),
            port: parse(&lookup, "PORT", d.port)?,
            ollama_base_url: text("OLLAMA_API_BASE_URL").unwrap_or(d.ollama_base_url),
            ollama_model: text("OLLAMA_MODEL").unwrap_or(d.ollama_model),
            openai_base_url: text("OPENAI_API_BASE_URL"),
            openai_api_key: text("OPENAI_API_KEY"),
            openai_model: text("OPENAI_MODEL").unwrap_or(d.openai_model),
            lite_model_cost: non_negative(&lookup, "LITE_MODEL_COST", d.lite_model_cost)?,
            pro_model_cost: non_negative(&lookup, "PRO_MODEL_COST", d.pro_model_cost)?,
            daily_free_tokens: non_negative(&lookup, "DAILY_FREE_TOKENS", d.daily_free_tokens)?,
            max_context_messages: parse(&lookup, "MAX_CONTEXT_MESSAGES", d.max_context_messages)?,
            stream_timeout: Duration::from_secs(parse(&lookup, "STREAM_TIMEOUT_SECS", 45)?),
            leaf_cache_ttl: Duration::from_secs(parse(&lookup, "LEAF_CACHE_TTL_SECS", 3600)?),
            free_model_requests_per_window: parse(
                &lookup,
                "FREE_MODEL_REQUESTS_PER_WINDOW",
                d.free_model_requests_per_window,
            )?,
            image_requests_per_window: parse(
                &lookup,
                "IMAGE_REQUESTS_PER_WINDOW",
                d.image_requests_per_window,
            )?,
            rate_window_secs: non_negative(&lookup, "RATE_WINDOW_SECS", d.rate_window_secs)?,
            max_concurrent_jobs: parse(&lookup, "MAX_CONCURRENT_JOBS", d.max_concurrent_jobs)?,
            image_job_cost: non_negative(&lookup, "IMAGE_JOB_COST", d.image_job_cost)?,
            image_api_base_url: text("IMAGE_API_BASE_URL"),
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| AppError::InvalidConfig {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            })
        }
        _ => Ok(default),
    }
}

fn non_negative(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: i64,
) -> Result<i64, AppError> {
    let value = parse(lookup, key, default)?;
    if value < 0 {
        return Err(AppError::InvalidConfig {
            key: key.to_string(),
            message: format!("must not be negative (got {value})"),
        });
    }
    Ok(value)
}
