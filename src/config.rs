use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application-level constants
pub const APP_NAME: &str = "NeoFlow";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "neoflow=info,warn"
}

/// Get the application data directory (~/NeoFlow/).
/// Falls back to the working directory when no home directory is known.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Default location of the SQLite template/result store.
pub fn default_database_path() -> PathBuf {
    app_data_dir().join("neoflow.db")
}

// ═══════════════════════════════════════════════════════════
// LLM endpoint
// ═══════════════════════════════════════════════════════════

/// Connection settings for an OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key: String::new(),
            temperature: 0.7,
            timeout_secs: 120,
        }
    }
}

impl LlmConfig {
    /// Read `LLM_BASE_URL`, `LLM_MODEL_ID`, `LLM_API_KEY`, `LLM_TEMPERATURE`
    /// and `LLM_TIMEOUT_SECS`. Missing or unparseable values keep their default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(model) = std::env::var("LLM_MODEL_ID") {
            config.model = model;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.api_key = key;
        }
        if let Some(t) = std::env::var("LLM_TEMPERATURE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.temperature = t;
        }
        if let Some(secs) = std::env::var("LLM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.timeout_secs = secs;
        }
        config
    }
}

// ═══════════════════════════════════════════════════════════
// Pipeline tuning
// ═══════════════════════════════════════════════════════════

/// Retry envelope for LLM transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 10_000,
        }
    }
}

/// Knobs for one pipeline deployment. Every field has a default so a partial
/// JSON/TOML document deserializes cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// OCR text sent to the classifier is cut to this many characters.
    pub classify_prefix_chars: usize,
    /// OCR text returned in the envelope is cut to this many characters.
    pub ocr_preview_chars: usize,
    /// Concurrent doc_type_a samples in merge mode. 1 = page by page.
    pub sample_concurrency: usize,
    pub retry: RetryConfig,
    /// Entries kept by the OCR result cache. 0 disables caching.
    pub ocr_cache_capacity: usize,
    /// Hard deadline for one pipeline invocation.
    pub run_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classify_prefix_chars: 2000,
            ocr_preview_chars: 500,
            sample_concurrency: 1,
            retry: RetryConfig::default(),
            ocr_cache_capacity: 0,
            run_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_ends_with_app_name() {
        assert!(app_data_dir().ends_with("NeoFlow"));
    }

    #[test]
    fn database_path_under_app_data() {
        assert!(default_database_path().starts_with(app_data_dir()));
    }

    #[test]
    fn pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.classify_prefix_chars, 2000);
        assert_eq!(config.ocr_preview_chars, 500);
        assert_eq!(config.sample_concurrency, 1);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 2_000);
        assert_eq!(config.retry.max_delay_ms, 10_000);
        assert!(config.run_timeout().is_none());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"sample_concurrency": 4, "retry": {"max_attempts": 5}}"#)
                .unwrap();
        assert_eq!(config.sample_concurrency, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 2_000);
        assert_eq!(config.ocr_preview_chars, 500);
    }

    #[test]
    fn api_key_never_serialized() {
        let config = LlmConfig {
            api_key: "sk-secret".into(),
            ..LlmConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
    }
}
