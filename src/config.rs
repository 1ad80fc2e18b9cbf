use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AgentError;
use crate::retry::RetryPolicy;

/// Post-action settle delays outside this range are clamped.
pub const MIN_SETTLE: Duration = Duration::from_millis(300);
pub const MAX_SETTLE: Duration = Duration::from_millis(2000);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub device_id: String,
    /// `None` runs until the task completes, fails or is aborted.
    pub max_steps: Option<usize>,
    #[serde(with = "duration_secs")]
    pub screenshot_settle: Duration,
    /// Extra wait before re-capturing a screen that is still loading.
    #[serde(with = "duration_secs")]
    pub reload_settle: Duration,
    pub retry: RetryPolicy,
    #[serde(with = "duration_secs")]
    pub lookup_timeout: Duration,
    pub lookup_top_n: usize,
    pub use_experience: bool,
    /// Hand finished tasks to the experience learner, when one is attached.
    pub learn_from_tasks: bool,
    pub completion_threshold: f64,
    /// History records shown to the completion judge.
    pub history_tail: usize,
    pub artifacts_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            max_steps: Some(30),
            screenshot_settle: Duration::from_millis(500),
            reload_settle: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            lookup_timeout: Duration::from_secs(30),
            lookup_top_n: 2,
            use_experience: true,
            learn_from_tasks: true,
            completion_threshold: 0.7,
            history_tail: 10,
            artifacts_dir: PathBuf::from("task_artifacts"),
        }
    }
}

impl AgentConfig {
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    pub fn settle_delay(&self) -> Duration {
        self.screenshot_settle.clamp(MIN_SETTLE, MAX_SETTLE)
    }
}

/// Connection details for an OpenAI-compatible chat endpoint.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub api_base: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::from_env("OPENAI")
    }
}

impl ModelConfig {
    /// Reads `{prefix}_BASE_URL`, `{prefix}_API_KEY` and `{prefix}_MODEL`.
    pub fn from_env(prefix: &str) -> Self {
        let var = |name: &str| env::var(format!("{prefix}_{name}")).ok().filter(|v| !v.trim().is_empty());
        Self {
            api_base: var("BASE_URL").unwrap_or_else(|| "https://api.openai.com/v1".into()),
            api_key: var("API_KEY").unwrap_or_default(),
            model: var("MODEL").unwrap_or_else(|| "gpt-4o".into()),
            temperature: 0.0,
            max_tokens: 1024,
        }
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// Optional TOML settings file. Missing tables and keys keep their defaults.
///
/// ```toml
/// [agent]
/// device_id = "emulator-5554"
/// max_steps = 40
/// screenshot_settle = 0.8
///
/// [grounding]
/// api_base = "http://localhost:8000/v1"
/// model = "ui-tars-7b"
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub agent: AgentConfig,
    pub grounding: ModelConfig,
    pub assistant: ModelConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            grounding: ModelConfig::from_env("GROUNDING"),
            assistant: ModelConfig::from_env("ASSISTANT"),
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("read {}: {e}", path.display())))?;
        let settings = Self::from_toml(&content)?;
        tracing::info!(path = %path.display(), device = %settings.agent.device_id, "settings loaded");
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, AgentError> {
        let mut settings: Settings =
            toml::from_str(content).map_err(|e| AgentError::Config(e.to_string()))?;
        // Keys never come from the file.
        if settings.grounding.api_key.is_empty() {
            settings.grounding.api_key = ModelConfig::from_env("GROUNDING").api_key;
        }
        if settings.assistant.api_key.is_empty() {
            settings.assistant.api_key = ModelConfig::from_env("ASSISTANT").api_key;
        }
        Ok(settings)
    }
}

/// (De)serializes a `Duration` as fractional seconds.
pub mod duration_secs {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(D::Error::custom(format!("invalid duration: {secs}")));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
