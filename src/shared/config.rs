use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, agent_error::AgentError};

/// Registrar port used when nothing else is configured.
pub const DEFAULT_REGISTRAR_PORT: u16 = 8089;

/// Top-level configuration, usually loaded from a YAML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MamaConfig {
    pub registrar: RegistrarConfig,
    pub semantic: SemanticConfig,
    pub transport: TransportConfig,
    pub agent: AgentRuntimeConfig,
    pub logging: LoggingConfig,
    pub agents: Vec<AgentProfileConfig>,
}

impl MamaConfig {
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let config: MamaConfig = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&source)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Rejects values that would only fail later at call time.
    pub fn validate(&self) -> Result<()> {
        if self.transport.max_attempts == 0 {
            return Err(config_error("transport.max_attempts must be at least 1"));
        }
        if self.agent.registration_attempts == 0 {
            return Err(config_error("agent.registration_attempts must be at least 1"));
        }
        if self.transport.max_frame_bytes == 0 {
            return Err(config_error("transport.max_frame_bytes must be positive"));
        }
        if self.semantic.embedding_dimension == 0 {
            return Err(config_error("semantic.embedding_dimension must be positive"));
        }
        if self.registrar.history_retention == 0 {
            return Err(config_error("registrar.history_retention must be at least 1"));
        }
        for agent in &self.agents {
            agent.validate()?;
        }
        Ok(())
    }
}

fn config_error(message: &str) -> crate::error::Error {
    AgentError::Config(message.to_string()).into()
}

/// Which ranking policy the registrar applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingStrategyKind {
    #[default]
    MarkupMatch,
    SemanticSimilarity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrarConfig {
    pub host: String,
    pub port: u16,
    /// `None` keeps the registry in memory only.
    pub registry_path: Option<PathBuf>,
    pub history_path: Option<PathBuf>,
    /// Most recent queries kept per agent.
    pub history_retention: usize,
    pub strategy: RankingStrategyKind,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_REGISTRAR_PORT,
            registry_path: None,
            history_path: None,
            history_retention: 100,
            strategy: RankingStrategyKind::MarkupMatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SemanticConfig {
    pub min_similarity: f32,
    pub history_bonus: f32,
    pub history_match_threshold: f32,
    pub embedding_dimension: usize,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.5,
            history_bonus: 0.1,
            history_match_threshold: 0.8,
            embedding_dimension: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff: BackoffKind,
    pub attempt_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 100,
            backoff: BackoffKind::Exponential,
            attempt_timeout_ms: 2_000,
            max_frame_bytes: 64 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentRuntimeConfig {
    /// Address agents advertise and bind on.
    pub host: String,
    pub registration_attempts: u32,
    pub registration_base_delay_ms: u64,
    pub reply_timeout_ms: u64,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            registration_attempts: 5,
            registration_base_delay_ms: 20,
            reply_timeout_ms: 5_000,
        }
    }
}

impl AgentRuntimeConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Declarative description of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentProfileConfig {
    pub name: String,
    #[serde(default)]
    pub profile: BTreeMap<String, f64>,
    #[serde(default)]
    pub specialty: Option<String>,
    /// Free text used by semantic ranking. `behavior` is accepted for older agent files.
    #[serde(default, alias = "behavior")]
    pub prompt: Option<String>,
}

impl AgentProfileConfig {
    pub fn new(name: impl Into<String>, profile: BTreeMap<String, f64>) -> Self {
        Self {
            name: name.into(),
            profile,
            specialty: None,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = Some(specialty.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(config_error("agent name must not be empty"));
        }
        if let Some((tag, _)) = self.profile.iter().find(|(_, weight)| !weight.is_finite()) {
            return Err(AgentError::Config(format!(
                "agent {}: weight for tag `{}` is not a finite number",
                self.name, tag
            ))
            .into());
        }
        if self.profile.is_empty() && self.prompt.is_none() {
            return Err(AgentError::Config(format!(
                "agent {} declares neither a profile nor a prompt",
                self.name
            ))
            .into());
        }
        Ok(())
    }

    /// Leans towards positive sentiment.
    pub fn positive_classifier() -> Self {
        Self::new(
            "Positive Classifier",
            BTreeMap::from([
                ("positive".to_string(), 1.0),
                ("negative".to_string(), 0.2),
                ("sarcasm".to_string(), 0.1),
            ]),
        )
    }

    /// Leans towards negative sentiment.
    pub fn negative_classifier() -> Self {
        Self::new(
            "Negative Classifier",
            BTreeMap::from([
                ("positive".to_string(), 0.2),
                ("negative".to_string(), 1.0),
                ("sarcasm".to_string(), 0.1),
            ]),
        )
    }
}

/// Loads one agent profile from a YAML file.
pub fn load_agent_profile(path: impl AsRef<Path>) -> Result<AgentProfileConfig> {
    let path = path.as_ref();
    let source = fs::read_to_string(path)?;
    let profile: AgentProfileConfig = serde_yaml::from_str(&source)?;
    profile.validate()?;
    debug!("Loaded agent profile {} from {}", profile.name, path.display());
    Ok(profile)
}

/// Loads every `*.yaml` / `*.yml` file in `dir`, sorted by file name.
pub fn load_agent_profiles(dir: impl AsRef<Path>) -> Result<Vec<AgentProfileConfig>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir.as_ref())?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    paths.sort();

    paths.iter().map(load_agent_profile).collect()
}
