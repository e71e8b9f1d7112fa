use anyhow::{Result, anyhow};
use serde::Deserialize;
use std::env;
use std::time::Duration;
use tracing::{info, warn};

use crate::llm_providers::LLMProviderType;
use crate::models::{DEFAULT_MAX_SCORE, MAX_QUESTION_SCORE};
use crate::rate_limiter::{RateLimitPolicy, RateLimiterSettings};

// Import logging macros
use crate::{log_system_event, log_validation};

/// Complete application configuration loaded from environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub llm: LLMConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub grading: GradingConfig,
}

/// Database connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Large Language Model service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LLMConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub provider: LLMProviderType,
    pub model: Option<String>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

/// Logging system configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_enabled: bool,
    pub console_enabled: bool,
    pub log_directory: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Database,
    Memory,
}

/// Grading pipeline tuning
#[derive(Debug, Clone, Deserialize)]
pub struct GradingConfig {
    pub ai_timeout_secs: u64,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_per_sec: u32,
    pub rate_limit_initial_tokens: u32,
    pub rate_limit_policy: RateLimitPolicy,
    pub cache_backend: CacheBackend,
    pub default_max_score: u32,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            ai_timeout_secs: 25,
            rate_limit_capacity: 10,
            rate_limit_refill_per_sec: 1,
            rate_limit_initial_tokens: 5,
            rate_limit_policy: RateLimitPolicy::Advisory,
            cache_backend: CacheBackend::Database,
            default_max_score: DEFAULT_MAX_SCORE,
        }
    }
}

impl Config {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> Result<Self> {
        log_system_event!(config, "Loading application configuration from environment variables");

        let config = Config {
            database: DatabaseConfig::from_env()?,
            llm: LLMConfig::from_env()?,
            server: ServerConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            grading: GradingConfig::from_env()?,
        };

        log_system_event!(config, "Configuration loaded successfully");
        config.log_configuration_summary();

        Ok(config)
    }

    /// Log a summary of loaded configuration (without sensitive data)
    fn log_configuration_summary(&self) {
        info!(
            database_url_masked = %mask_sensitive_data(&self.database.url),
            llm_provider = ?self.llm.provider,
            llm_model = ?self.llm.model,
            llm_api_key_set = !self.llm.api_key.is_empty(),
            server_address = %self.server.address(),
            log_level = %self.logging.level,
            ai_timeout_secs = self.grading.ai_timeout_secs,
            rate_limit_policy = ?self.grading.rate_limit_policy,
            cache_backend = ?self.grading.cache_backend,
            "Configuration summary"
        );
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.database.url.starts_with("sqlite:") {
            return Err(anyhow!("DATABASE_URL must start with 'sqlite:'"));
        }

        if self.server.port == 0 {
            return Err(anyhow!("Server port must be greater than 0"));
        }

        if self.grading.ai_timeout_secs == 0 {
            return Err(anyhow!("GRADING_AI_TIMEOUT_SECS must be greater than 0"));
        }

        if self.grading.default_max_score > MAX_QUESTION_SCORE {
            return Err(anyhow!(
                "GRADING_DEFAULT_MAX_SCORE cannot exceed {}",
                MAX_QUESTION_SCORE
            ));
        }

        if self.grading.rate_limit_capacity == 0 {
            return Err(anyhow!("GRADING_RATE_LIMIT_CAPACITY must be greater than 0"));
        }

        if self.grading.rate_limit_initial_tokens > self.grading.rate_limit_capacity {
            return Err(anyhow!(
                "GRADING_RATE_LIMIT_INITIAL_TOKENS ({}) cannot exceed capacity ({})",
                self.grading.rate_limit_initial_tokens,
                self.grading.rate_limit_capacity
            ));
        }

        if self.llm.api_key.is_empty() {
            warn!("LLM API key is empty - free-text answers will be graded with the fallback heuristic");
        }

        if !["trace", "debug", "info", "warn", "error"]
            .iter()
            .any(|level| self.logging.level.to_lowercase().starts_with(level))
        {
            warn!("Unrecognized log level '{}', using 'info' as fallback", self.logging.level);
        }

        log_validation!(success, "configuration", "Configuration validation completed successfully");
        Ok(())
    }
}

impl DatabaseConfig {
    fn from_env() -> Result<Self> {
        let url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:lms_grader.db".to_string());

        Ok(DatabaseConfig { url })
    }
}

impl LLMConfig {
    fn from_env() -> Result<Self> {
        let api_key = ["LLM_API_KEY", "OPENAI_API_KEY", "OPENAIAPIKEY"]
            .iter()
            .find_map(|name| env::var(name).ok().filter(|v| !v.trim().is_empty()))
            .unwrap_or_default();

        let base_url = env::var("LLM_BASE_URL").ok();

        let provider_str = env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider = LLMProviderType::parse(&provider_str);

        let model = env::var("LLM_MODEL").ok();

        Ok(LLMConfig {
            api_key,
            base_url,
            provider,
            model,
        })
    }
}

impl ServerConfig {
    fn from_env() -> Result<Self> {
        let port_str = env::var("PORT").unwrap_or_else(|_| "3000".to_string());

        let port = port_str.parse::<u16>().map_err(|_| {
            anyhow!("Invalid PORT value: '{}'. Must be a number between 1-65535", port_str)
        })?;

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        Ok(ServerConfig { port, host })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl LoggingConfig {
    fn from_env() -> Result<Self> {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info,lms_grader=debug".to_string());

        let file_enabled = env::var("LOG_FILE_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse::<bool>()
            .unwrap_or(true);

        let console_enabled = env::var("LOG_CONSOLE_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse::<bool>()
            .unwrap_or(true);

        let log_directory = env::var("LOG_DIRECTORY").unwrap_or_else(|_| "logs".to_string());

        Ok(LoggingConfig {
            level,
            file_enabled,
            console_enabled,
            log_directory,
        })
    }
}

impl GradingConfig {
    fn from_env() -> Result<Self> {
        let defaults = GradingConfig::default();

        let rate_limit_policy = match env::var("GRADING_RATE_LIMIT_POLICY") {
            Ok(value) => match value.to_lowercase().as_str() {
                "advisory" => RateLimitPolicy::Advisory,
                "enforce" => RateLimitPolicy::Enforce,
                other => {
                    return Err(anyhow!(
                        "Invalid GRADING_RATE_LIMIT_POLICY '{}'. Expected 'advisory' or 'enforce'",
                        other
                    ));
                }
            },
            Err(_) => defaults.rate_limit_policy,
        };

        let cache_backend = match env::var("GRADING_CACHE_BACKEND") {
            Ok(value) => match value.to_lowercase().as_str() {
                "database" | "db" => CacheBackend::Database,
                "memory" => CacheBackend::Memory,
                other => {
                    return Err(anyhow!(
                        "Invalid GRADING_CACHE_BACKEND '{}'. Expected 'database' or 'memory'",
                        other
                    ));
                }
            },
            Err(_) => defaults.cache_backend,
        };

        Ok(GradingConfig {
            ai_timeout_secs: parse_env_number("GRADING_AI_TIMEOUT_SECS", defaults.ai_timeout_secs)?,
            rate_limit_capacity: parse_env_number(
                "GRADING_RATE_LIMIT_CAPACITY",
                defaults.rate_limit_capacity,
            )?,
            rate_limit_refill_per_sec: parse_env_number(
                "GRADING_RATE_LIMIT_REFILL_PER_SEC",
                defaults.rate_limit_refill_per_sec,
            )?,
            rate_limit_initial_tokens: parse_env_number(
                "GRADING_RATE_LIMIT_INITIAL_TOKENS",
                defaults.rate_limit_initial_tokens,
            )?,
            rate_limit_policy,
            cache_backend,
            default_max_score: parse_env_number(
                "GRADING_DEFAULT_MAX_SCORE",
                defaults.default_max_score,
            )?,
        })
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout_secs)
    }

    pub fn rate_limiter_settings(&self) -> RateLimiterSettings {
        RateLimiterSettings {
            capacity: self.rate_limit_capacity,
            refill_per_sec: self.rate_limit_refill_per_sec,
            initial_tokens: self.rate_limit_initial_tokens,
            policy: self.rate_limit_policy,
        }
    }
}

fn parse_env_number<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow!("Invalid {} value: '{}'", name, value)),
        Err(_) => Ok(default),
    }
}

/// Mask sensitive data in configuration for safe logging
fn mask_sensitive_data(data: &str) -> String {
    if data.len() <= 8 {
        "*".repeat(data.len())
    } else {
        format!("{}***{}", &data[..4], &data[data.len() - 4..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "sqlite:test.db".to_string(),
            },
            llm: LLMConfig {
                api_key: "sk-valid-key".to_string(),
                base_url: None,
                provider: LLMProviderType::OpenAI,
                model: None,
            },
            server: ServerConfig {
                port: 3000,
                host: "0.0.0.0".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file_enabled: true,
                console_enabled: true,
                log_directory: "logs".to_string(),
            },
            grading: GradingConfig::default(),
        }
    }

    #[test]
    fn test_mask_sensitive_data() {
        assert_eq!(mask_sensitive_data("short"), "*****");
        assert_eq!(mask_sensitive_data("sqlite:lms_grader.db"), "sqli***r.db");
        assert_eq!(mask_sensitive_data("sk-1234567890abcdef"), "sk-1***cdef");
    }

    #[test]
    fn test_grading_defaults() {
        let grading = GradingConfig::default();
        assert_eq!(grading.ai_timeout(), Duration::from_secs(25));

        let limiter = grading.rate_limiter_settings();
        assert_eq!(limiter.capacity, 10);
        assert_eq!(limiter.refill_per_sec, 1);
        assert_eq!(limiter.initial_tokens, 5);
        assert_eq!(limiter.policy, RateLimitPolicy::Advisory);
        assert_eq!(grading.cache_backend, CacheBackend::Database);
    }

    #[test]
    fn test_config_validation() {
        let config = valid_config();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.server.port = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.database.url = "postgres://localhost/db".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.grading.ai_timeout_secs = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.grading.rate_limit_initial_tokens = 11;
        assert!(invalid.validate().is_err());

        // a missing key only warns
        let mut keyless = config;
        keyless.llm.api_key = String::new();
        assert!(keyless.validate().is_ok());
    }
}
