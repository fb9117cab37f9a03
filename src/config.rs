use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;
pub const DEFAULT_STEP_LIMIT: u32 = 25;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Runtime configuration for the completion client and the workflow engine.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// HTTP timeout in seconds
    pub timeout: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_iterations: u32,
    pub step_limit: u32,
    pub query_service_url: Option<String>,
}

impl Config {
    /// Load configuration from the process environment (call `dotenv` first).
    pub fn load() -> Result<Self, ConfigError> {
        let cfg = Self::from_lookup(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build a configuration from an arbitrary key lookup. Values are parsed but not validated.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = get("LLM_API_KEY").ok_or(ConfigError::Missing("LLM_API_KEY"))?;
        let base_url = get("LLM_BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let model = get("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Ok(Self {
            api_key,
            base_url,
            model,
            timeout: parse_or(get("LLM_TIMEOUT_SECS"), "LLM_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?,
            max_tokens: parse_or(get("LLM_MAX_TOKENS"), "LLM_MAX_TOKENS", DEFAULT_MAX_TOKENS)?,
            temperature: parse_or(get("LLM_TEMPERATURE"), "LLM_TEMPERATURE", 0.0)?,
            max_iterations: parse_or(
                get("WORKFLOW_MAX_ITERATIONS"),
                "WORKFLOW_MAX_ITERATIONS",
                DEFAULT_MAX_ITERATIONS,
            )?,
            step_limit: parse_or(
                get("WORKFLOW_STEP_LIMIT"),
                "WORKFLOW_STEP_LIMIT",
                DEFAULT_STEP_LIMIT,
            )?,
            query_service_url: get("QUERY_SERVICE_URL"),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Missing("LLM_API_KEY"));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "LLM_BASE_URL",
                message: format!("expected an http(s) URL, got '{}'", self.base_url),
            });
        }
        if self.timeout == 0 {
            return Err(ConfigError::Invalid {
                key: "LLM_TIMEOUT_SECS",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid {
                key: "LLM_MAX_TOKENS",
                message: "must be greater than zero".to_string(),
            });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid {
                key: "LLM_TEMPERATURE",
                message: format!("{} is outside 0.0..=2.0", self.temperature),
            });
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKFLOW_MAX_ITERATIONS",
                message: "at least one iteration is required".to_string(),
            });
        }
        if self.step_limit == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKFLOW_STEP_LIMIT",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            message: format!("'{}': {}", value, e),
        }),
    }
}
