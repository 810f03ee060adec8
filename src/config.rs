//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Engine tuning shared by the orchestrator, router and stores.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Budget for every classifier, extractor and commit call.
    pub collaborator_timeout: Duration,
    /// Idle time after which a conversation reads as abandoned.
    pub state_ttl: Duration,
    /// How often the background sweep purges abandoned conversations.
    pub sweep_interval: Duration,
    /// Annual interest rate (percent) for financing estimates.
    pub interest_rate: Decimal,
    /// Idle time before a per-user dispatch worker shuts down.
    pub worker_idle: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            collaborator_timeout: Duration::from_secs(12),
            state_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            interest_rate: dec!(9.5),
            worker_idle: Duration::from_secs(120),
        }
    }
}

/// WhatsApp Cloud API credentials.
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub access_token: SecretString,
    pub phone_number_id: String,
    pub verify_token: SecretString,
    pub app_secret: SecretString,
    pub api_base: String,
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub db_path: Option<PathBuf>,
    pub http_port: u16,
    pub log_dir: Option<PathBuf>,
    pub llm: Option<LlmConfig>,
    pub whatsapp: Option<WhatsAppConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            db_path: Some(PathBuf::from("./data/autosherpa.db")),
            http_port: 8080,
            log_dir: None,
            llm: None,
            whatsapp: None,
        }
    }
}

impl AppConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let engine = EngineConfig {
            collaborator_timeout: Duration::from_secs(parse_or(
                &get,
                "AUTOSHERPA_COLLABORATOR_TIMEOUT_SECS",
                defaults.engine.collaborator_timeout.as_secs(),
            )?),
            state_ttl: Duration::from_secs(
                parse_or(
                    &get,
                    "AUTOSHERPA_STATE_TTL_MIN",
                    defaults.engine.state_ttl.as_secs() / 60,
                )? * 60,
            ),
            sweep_interval: Duration::from_secs(parse_or(
                &get,
                "AUTOSHERPA_SWEEP_INTERVAL_SECS",
                defaults.engine.sweep_interval.as_secs(),
            )?),
            interest_rate: parse_or(&get, "AUTOSHERPA_INTEREST_RATE", defaults.engine.interest_rate)?,
            worker_idle: Duration::from_secs(parse_or(
                &get,
                "AUTOSHERPA_WORKER_IDLE_SECS",
                defaults.engine.worker_idle.as_secs(),
            )?),
        };

        if engine.interest_rate < Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                key: "AUTOSHERPA_INTEREST_RATE".to_string(),
                message: "must not be negative".to_string(),
            });
        }

        let db_path = match get("AUTOSHERPA_DB_PATH") {
            Some(p) if p == ":memory:" => None,
            Some(p) => Some(PathBuf::from(p)),
            None => defaults.db_path,
        };

        let model = get("AUTOSHERPA_MODEL");
        let llm = if let Some(key) = get("ANTHROPIC_API_KEY") {
            Some(LlmConfig {
                backend: LlmBackend::Anthropic,
                api_key: SecretString::from(key),
                model: model.unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
            })
        } else {
            get("OPENAI_API_KEY").map(|key| LlmConfig {
                backend: LlmBackend::OpenAi,
                api_key: SecretString::from(key),
                model: model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
            })
        };

        let whatsapp = match (
            get("WHATSAPP_ACCESS_TOKEN"),
            get("WHATSAPP_PHONE_NUMBER_ID"),
        ) {
            (Some(token), Some(phone_number_id)) => Some(WhatsAppConfig {
                access_token: SecretString::from(token),
                phone_number_id,
                verify_token: SecretString::from(
                    get("WHATSAPP_VERIFY_TOKEN")
                        .ok_or_else(|| ConfigError::MissingEnvVar("WHATSAPP_VERIFY_TOKEN".into()))?,
                ),
                app_secret: SecretString::from(
                    get("WHATSAPP_APP_SECRET")
                        .ok_or_else(|| ConfigError::MissingEnvVar("WHATSAPP_APP_SECRET".into()))?,
                ),
                api_base: get("WHATSAPP_API_BASE")
                    .unwrap_or_else(|| "https://graph.facebook.com/v18.0".to_string()),
            }),
            _ => None,
        };

        Ok(Self {
            engine,
            db_path,
            http_port: parse_or(&get, "AUTOSHERPA_HTTP_PORT", defaults.http_port)?,
            log_dir: get("AUTOSHERPA_LOG_DIR").map(PathBuf::from),
            llm,
            whatsapp,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
