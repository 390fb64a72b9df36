use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::action::InputMode;
use crate::controller::http::HOMO_TIMEOUT_SECS;
use crate::dialect::Dialect;
use crate::errors::{HarnessError, HarnessResult};
use crate::llm::types::ModelConfig;

pub const API_KEY_ENV: &str = "SCIBENCH_API_KEY";
pub const GROUNDER_API_KEY_ENV: &str = "SCIBENCH_GROUNDER_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelSection,
    pub vm: VmSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub app: AppSection,
    /// Required by the planner dialect.
    #[serde(default)]
    pub grounder: Option<GrounderSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    /// Shown in logs and history records.
    #[serde(default = "default_model_id")]
    pub id: String,
    pub api_base: String,
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Falls back to env var SCIBENCH_API_KEY, which takes precedence.
    #[serde(default)]
    pub api_key: Option<String>,
    /// A round that takes longer ends the episode with TIMEOUT.
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
}

impl ModelSection {
    pub fn api_key(&self) -> String {
        self.api_key_from(API_KEY_ENV)
    }

    /// `env` wins over the configured key.
    pub fn api_key_from(&self, env: &str) -> String {
        std::env::var(env).unwrap_or_else(|_| self.api_key.clone().unwrap_or_default())
    }

    pub fn client_config(&self) -> ModelConfig {
        ModelConfig {
            api_base: self.api_base.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

fn default_model_id() -> String {
    "default".into()
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_model_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSection {
    pub ip: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Run before a task's `initialize` list.
    #[serde(default = "default_reset_command")]
    pub reset_command: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_request_timeout() -> u64 {
    HOMO_TIMEOUT_SECS
}

fn default_reset_command() -> Option<String> {
    Some("/bin/bash /home/user/server/reset.sh".into())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Output dialect of the model; unknown names fail at load.
    #[serde(default = "default_code_style")]
    pub code_style: Dialect,
    #[serde(default)]
    pub input_mode: InputMode,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    /// Earlier rounds replayed to the model, screenshots included.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default)]
    pub set_of_marks: bool,
    /// Pause after each setup step.
    #[serde(default = "default_settle")]
    pub init_settle_secs: f64,
    /// Defaults to the platform data dir.
    #[serde(default)]
    pub history_dir: Option<PathBuf>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            code_style: default_code_style(),
            input_mode: InputMode::default(),
            max_steps: default_max_steps(),
            max_consecutive_failures: default_max_failures(),
            context_window: default_context_window(),
            set_of_marks: false,
            init_settle_secs: default_settle(),
            history_dir: None,
        }
    }
}

fn default_code_style() -> Dialect {
    Dialect::UiTars15
}

fn default_max_steps() -> u32 {
    15
}

fn default_max_failures() -> u32 {
    3
}

fn default_context_window() -> usize {
    3
}

fn default_settle() -> f64 {
    2.0
}

/// Model that grounds a planner's plan into actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrounderSection {
    /// A grounding dialect: `uground` or `atlas`.
    #[serde(default = "default_grounder_style")]
    pub code_style: Dialect,
    #[serde(flatten)]
    pub model: ModelSection,
}

impl GrounderSection {
    pub fn api_key(&self) -> String {
        self.model.api_key_from(GROUNDER_API_KEY_ENV)
    }
}

fn default_grounder_style() -> Dialect {
    Dialect::UGround
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    /// Port of the application's status server; fills `«PORTLIKE»`.
    #[serde(default = "default_app_port")]
    pub port: u16,
}

impl Default for AppSection {
    fn default() -> Self {
        Self { port: default_app_port() }
    }
}

fn default_app_port() -> u16 {
    8000
}

fn resolve_config_path() -> HarnessResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(HarnessError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn parse_config(content: &str) -> HarnessResult<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    if config.agent.max_steps == 0 {
        return Err(HarnessError::Config("agent.max_steps must be positive".into()));
    }
    match (&config.grounder, config.agent.code_style) {
        (None, Dialect::Planner) => {
            return Err(HarnessError::Config("code_style planner needs a [grounder] section".into()));
        }
        (Some(g), _) if !g.code_style.is_grounding() => {
            return Err(HarnessError::Config(format!(
                "grounder.code_style must be a grounding dialect, got {}",
                g.code_style
            )));
        }
        _ => {}
    }
    Ok(config)
}

/// Loads `path`, or `config.toml` next to the executable or in the
/// working directory.
pub fn load_config(path: Option<&Path>) -> HarnessResult<AppConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => resolve_config_path()?,
    };
    let content = std::fs::read_to_string(&path)?;
    let config = parse_config(&content)?;
    tracing::info!(
        path = %path.display(),
        model = %config.model.model,
        code_style = %config.agent.code_style,
        "config loaded"
    );
    Ok(config)
}
