//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{DEFAULT_TRANSCRIPTION_MODEL, LlmConfig};
use crate::sequencer::SequencerConfig;

/// Outbound WhatsApp credentials. Present only when both values are set.
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub access_token: SecretString,
    pub phone_number_id: String,
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub media_dir: PathBuf,
    pub sequencer: SequencerConfig,
    /// How far back an incomplete request is offered to the classifier as
    /// context for the sender's next message.
    pub incomplete_window: chrono::Duration,
    pub llm: LlmConfig,
    pub whatsapp: Option<WhatsAppConfig>,
    /// Token expected in the webhook verification handshake.
    pub verify_token: Option<String>,
    /// Directory for daily-rotated log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build config from any variable lookup.
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let confirm_timeout_secs: u64 = parse(&var, "SHELTER_CONFIRM_TIMEOUT_SECS", 300)?;
        let claim_lease_secs: i64 = parse(&var, "SHELTER_CLAIM_LEASE_SECS", 900)?;
        if claim_lease_secs <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "SHELTER_CLAIM_LEASE_SECS".into(),
                message: "must be positive".into(),
            });
        }

        let incomplete_window_secs: i64 = parse(&var, "SHELTER_INCOMPLETE_WINDOW_SECS", 300)?;
        if incomplete_window_secs < 0 {
            return Err(ConfigError::InvalidValue {
                key: "SHELTER_INCOMPLETE_WINDOW_SECS".into(),
                message: "must not be negative".into(),
            });
        }

        let api_key = var("SHELTER_LLM_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("SHELTER_LLM_API_KEY".into()))?;

        let whatsapp = match (var("WHATSAPP_ACCESS_TOKEN"), var("WHATSAPP_PHONE_NUMBER_ID")) {
            (Some(token), Some(phone_number_id)) => Some(WhatsAppConfig {
                access_token: SecretString::from(token),
                phone_number_id,
            }),
            _ => None,
        };

        Ok(Self {
            db_path: var("SHELTER_DB_PATH")
                .unwrap_or_else(|| "./data/shelter-ledger.db".into())
                .into(),
            port: parse(&var, "SHELTER_PORT", 8080)?,
            media_dir: var("SHELTER_MEDIA_DIR")
                .unwrap_or_else(|| "./data/media".into())
                .into(),
            sequencer: SequencerConfig {
                confirm_timeout: Duration::from_secs(confirm_timeout_secs),
                claim_lease: chrono::Duration::seconds(claim_lease_secs),
            },
            incomplete_window: chrono::Duration::seconds(incomplete_window_secs),
            llm: LlmConfig {
                base_url: var("SHELTER_LLM_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".into()),
                api_key: SecretString::from(api_key),
                model: var("SHELTER_LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".into()),
                transcription_model: var("SHELTER_TRANSCRIPTION_MODEL")
                    .unwrap_or_else(|| DEFAULT_TRANSCRIPTION_MODEL.into()),
            },
            whatsapp,
            verify_token: var("WHATSAPP_VERIFY_TOKEN"),
            log_dir: var("SHELTER_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse<T, F>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}
