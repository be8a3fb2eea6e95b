//! Configuration types, loaded from environment variables.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Top-level bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// HTTP port for the webhook + admin server.
    pub http_port: u16,
    /// Path to the local libSQL database file.
    pub db_path: String,
    pub llm: LlmConfig,
    pub twilio: TwilioConfig,
    pub search: SearchConfig,
    pub retrieval: RetrievalConfig,
    pub vision: VisionConfig,
    pub pipeline: PipelineConfig,
    pub safety: SafetyConfig,
}

impl BotConfig {
    /// Load the full configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            http_port: env_parse("AROGYA_HTTP_PORT", 8000)?,
            db_path: std::env::var("AROGYA_DB_PATH")
                .unwrap_or_else(|_| "./data/arogya-bot.db".to_string()),
            llm: llm_from_env()?,
            twilio: TwilioConfig::from_env()?,
            search: SearchConfig::from_env()?,
            retrieval: RetrievalConfig::from_env()?,
            vision: VisionConfig::from_env()?,
            pipeline: PipelineConfig::from_env()?,
            safety: SafetyConfig::from_env()?,
        })
    }
}

/// Twilio WhatsApp channel credentials.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    /// The bot's WhatsApp sender number, e.g. `whatsapp:+14155238886`.
    pub from_number: String,
}

impl TwilioConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            account_sid: require("TWILIO_ACCOUNT_SID")?,
            auth_token: SecretString::from(require("TWILIO_AUTH_TOKEN")?),
            from_number: require("TWILIO_WHATSAPP_NUMBER")?,
        })
    }
}

/// Serper web-search credentials.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub api_key: SecretString,
    /// Country bias for searches when the user gives no location.
    pub default_region: String,
}

impl SearchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: SecretString::from(require("SERPER_API_KEY")?),
            default_region: std::env::var("AROGYA_SEARCH_REGION")
                .unwrap_or_else(|_| "India".to_string()),
        })
    }
}

/// Vector-search (knowledge retrieval) endpoint settings.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Index host, e.g. `https://arogya-xxxx.svc.pinecone.io`.
    pub index_host: String,
    pub api_key: SecretString,
    /// Namespace holding the shared health reference corpus.
    pub global_namespace: String,
    pub top_k: usize,
}

impl RetrievalConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            index_host: require("PINECONE_INDEX_HOST")?,
            api_key: SecretString::from(require("PINECONE_API_KEY")?),
            global_namespace: std::env::var("AROGYA_KNOWLEDGE_NAMESPACE")
                .unwrap_or_else(|_| "health-reference".to_string()),
            top_k: env_parse("AROGYA_RETRIEVAL_TOP_K", 5)?,
        })
    }
}

/// Vision/document analysis endpoint settings (OpenAI-style multimodal API).
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
}

impl VisionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: std::env::var("AROGYA_VISION_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: SecretString::from(require("OPENAI_API_KEY")?),
            model: std::env::var("AROGYA_VISION_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
        })
    }
}

/// Pipeline-wide knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bound on every external collaborator call.
    pub call_timeout: Duration,
    /// How many recent chat turns feed conversation synthesis.
    pub history_turns: usize,
    /// The language all capability handlers operate in.
    pub working_language: String,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            call_timeout: Duration::from_secs(env_parse("AROGYA_CALL_TIMEOUT_SECS", 20)?),
            history_turns: env_parse("AROGYA_HISTORY_TURNS", 5)?,
            working_language: "en".to_string(),
        })
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(20),
            history_turns: 5,
            working_language: "en".to_string(),
        }
    }
}

/// Safety validator thresholds and local emergency guidance.
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    /// Ages strictly below this get pediatric dosage warnings.
    pub pediatric_age: u32,
    /// Ages strictly above this get geriatric dosage warnings.
    pub geriatric_age: u32,
    /// Hard ceiling accepted by the onboarding age validator.
    pub max_age: u32,
    /// Locally configured emergency contact guidance, inserted into the
    /// fixed emergency template.
    pub emergency_guidance: String,
}

impl SafetyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            pediatric_age: env_parse("AROGYA_PEDIATRIC_AGE", 18)?,
            geriatric_age: env_parse("AROGYA_GERIATRIC_AGE", 65)?,
            max_age: env_parse("AROGYA_MAX_AGE", 120)?,
            emergency_guidance: std::env::var("AROGYA_EMERGENCY_GUIDANCE").unwrap_or_else(|_| {
                "Call 112 (National Emergency) or 108 (Ambulance) in India immediately."
                    .to_string()
            }),
        })
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            pediatric_age: 18,
            geriatric_age: 65,
            max_age: 120,
            emergency_guidance:
                "Call 112 (National Emergency) or 108 (Ambulance) in India immediately."
                    .to_string(),
        }
    }
}

fn llm_from_env() -> Result<LlmConfig, ConfigError> {
    let backend = match std::env::var("AROGYA_LLM_BACKEND").as_deref() {
        Ok("openai") => LlmBackend::OpenAi,
        _ => LlmBackend::Anthropic,
    };
    let key_var = match backend {
        LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
        LlmBackend::OpenAi => "OPENAI_API_KEY",
    };
    let default_model = match backend {
        LlmBackend::Anthropic => "claude-sonnet-4-20250514",
        LlmBackend::OpenAi => "gpt-4o",
    };
    Ok(LlmConfig {
        backend,
        api_key: SecretString::from(require(key_var)?),
        model: std::env::var("AROGYA_LLM_MODEL").unwrap_or_else(|_| default_model.to_string()),
    })
}

fn require(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.call_timeout, Duration::from_secs(20));
        assert_eq!(cfg.working_language, "en");
    }

    #[test]
    fn safety_defaults() {
        let cfg = SafetyConfig::default();
        assert_eq!(cfg.pediatric_age, 18);
        assert_eq!(cfg.geriatric_age, 65);
        assert_eq!(cfg.max_age, 120);
        assert!(cfg.emergency_guidance.contains("112"));
    }

    #[test]
    fn env_parse_uses_default_when_unset() {
        let port: u16 = env_parse("AROGYA_TEST_UNSET_PORT_XYZ", 8000).unwrap();
        assert_eq!(port, 8000);
    }
}
