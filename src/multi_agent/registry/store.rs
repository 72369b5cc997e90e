use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    agent::types::CapabilityProfile,
    error::{Error, Result, agent_error::AgentError},
    multi_agent::communication::RegistrationMessage,
};

/// Registrar-side view of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub expertise_profile: CapabilityProfile,
    /// Last relevance reported or registered.
    pub relevance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Position in first-registered order; survives re-registration.
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub cumulative_relevance: f64,
    #[serde(default)]
    pub query_count: u64,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn from_registration(msg: RegistrationMessage, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            name: msg.agent_name,
            address: msg.address,
            port: msg.port,
            expertise_profile: msg.expertise_profile,
            relevance: msg.relevance,
            specialty: msg.specialty,
            prompt: msg.prompt,
            sequence,
            cumulative_relevance: 0.0,
            query_count: 0,
            registered_at: now,
            updated_at: now,
        }
    }

    /// Overwrites every message-provided field; bookkeeping is kept.
    pub fn apply_registration(&mut self, msg: RegistrationMessage) {
        self.address = msg.address;
        self.port = msg.port;
        self.expertise_profile = msg.expertise_profile;
        self.relevance = msg.relevance;
        self.specialty = msg.specialty;
        self.prompt = msg.prompt;
        self.updated_at = Utc::now();
    }

    /// Average relevance over every served query.
    pub fn popularity(&self) -> f64 {
        if self.query_count == 0 {
            0.0
        } else {
            self.cumulative_relevance / self.query_count as f64
        }
    }
}

/// Agent name → record.
pub type RegistryTable = BTreeMap<String, AgentRecord>;

/// Agent name → queries it answered, oldest first.
pub type QueryHistory = BTreeMap<String, Vec<String>>;

/// Durable home of the registry table and the query history.
pub trait RegistryStore: Send + Sync {
    fn load_registry(&self) -> Result<RegistryTable>;

    fn save_registry(&self, table: &RegistryTable) -> Result<()>;

    fn load_history(&self) -> Result<QueryHistory>;

    fn save_history(&self, history: &QueryHistory) -> Result<()>;
}

/// Keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    registry: Mutex<RegistryTable>,
    history: Mutex<QueryHistory>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> Error {
    AgentError::Persistence("in-memory store lock poisoned".into()).into()
}

impl RegistryStore for MemoryStore {
    fn load_registry(&self) -> Result<RegistryTable> {
        Ok(self.registry.lock().map_err(poisoned)?.clone())
    }

    fn save_registry(&self, table: &RegistryTable) -> Result<()> {
        *self.registry.lock().map_err(poisoned)? = table.clone();
        Ok(())
    }

    fn load_history(&self) -> Result<QueryHistory> {
        Ok(self.history.lock().map_err(poisoned)?.clone())
    }

    fn save_history(&self, history: &QueryHistory) -> Result<()> {
        *self.history.lock().map_err(poisoned)? = history.clone();
        Ok(())
    }
}

/// Two JSON files, each rewritten wholesale and atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    registry_path: PathBuf,
    history_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(registry_path: impl Into<PathBuf>, history_path: impl Into<PathBuf>) -> Self {
        Self {
            registry_path: registry_path.into(),
            history_path: history_path.into(),
        }
    }

    /// History file placed next to the registry file.
    pub fn beside(registry_path: impl Into<PathBuf>) -> Self {
        let registry_path = registry_path.into();
        let history_path = registry_path.with_file_name("query_history.json");
        Self::new(registry_path, history_path)
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }
}

impl RegistryStore for JsonFileStore {
    fn load_registry(&self) -> Result<RegistryTable> {
        read_json_or_default(&self.registry_path)
    }

    fn save_registry(&self, table: &RegistryTable) -> Result<()> {
        write_json_atomically(&self.registry_path, table)
    }

    fn load_history(&self) -> Result<QueryHistory> {
        read_json_or_default(&self.history_path)
    }

    fn save_history(&self, history: &QueryHistory) -> Result<()> {
        write_json_atomically(&self.history_path, history)
    }
}

fn persistence_error(path: &Path, reason: impl std::fmt::Display) -> Error {
    AgentError::Persistence(format!("{}: {}", path.display(), reason)).into()
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        debug!("{} does not exist yet, starting empty", path.display());
        return Ok(T::default());
    }
    let bytes = fs::read(path).map_err(|e| persistence_error(path, e))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| persistence_error(path, e))
}

/// Writes to a temp file in the target directory, then renames over the target.
fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| persistence_error(path, e))?;

    let bytes = serde_json::to_vec_pretty(value).map_err(|e| persistence_error(path, e))?;
    let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| persistence_error(path, e))?;
    temp.write_all(&bytes)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| persistence_error(path, e))?;
    temp.persist(path).map_err(|e| persistence_error(path, e.error))?;

    debug!("Persisted {} bytes to {}", bytes.len(), path.display());
    Ok(())
}
