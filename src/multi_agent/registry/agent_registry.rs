use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    agent::{markup::KeywordMarkupExtractor, types::CapabilityProfile},
    error::{Error, Result, agent_error::AgentError},
    multi_agent::{
        communication::{MessageListener, QueryReport, RegistrarMessage, RegistrationMessage},
        registry::{
            embedding::HashingEmbedder,
            ranking::{
                MarkupMatchStrategy, RankedAgent, RankingContext, RankingStrategy,
                SemanticSimilarityStrategy,
            },
            store::{
                AgentRecord, JsonFileStore, MemoryStore, QueryHistory, RegistryStore,
                RegistryTable,
            },
        },
    },
    shared::{
        Shutdown,
        config::{MamaConfig, RankingStrategyKind, RegistrarConfig, TransportConfig},
    },
};

/// Partial update of an agent record. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentUpdate {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub expertise_profile: Option<CapabilityProfile>,
    pub relevance: Option<f64>,
    pub specialty: Option<String>,
    pub prompt: Option<String>,
}

impl AgentUpdate {
    fn validate(&self) -> Result<()> {
        if let Some(relevance) = self.relevance
            && !relevance.is_finite()
        {
            return Err(AgentError::InvalidMessage("relevance must be finite".into()).into());
        }
        if let Some(profile) = &self.expertise_profile {
            profile.ensure_finite()?;
        }
        Ok(())
    }

    fn apply_to(self, record: &mut AgentRecord) {
        if let Some(address) = self.address {
            record.address = address;
        }
        if let Some(port) = self.port {
            record.port = port;
        }
        if let Some(profile) = self.expertise_profile {
            record.expertise_profile = profile;
        }
        if let Some(relevance) = self.relevance {
            record.relevance = relevance;
        }
        if self.specialty.is_some() {
            record.specialty = self.specialty;
        }
        if self.prompt.is_some() {
            record.prompt = self.prompt;
        }
        record.updated_at = Utc::now();
    }

    fn into_registration(self, name: &str) -> RegistrationMessage {
        RegistrationMessage {
            agent_name: name.to_string(),
            expertise_profile: self.expertise_profile.unwrap_or_default(),
            relevance: self.relevance.unwrap_or(0.0),
            address: self.address.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.unwrap_or(0),
            specialty: self.specialty,
            prompt: self.prompt,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RegistrarState {
    table: RegistryTable,
    history: QueryHistory,
    next_sequence: u64,
}

impl RegistrarState {
    fn new(table: RegistryTable, history: QueryHistory) -> Self {
        let next_sequence = table.values().map(|r| r.sequence + 1).max().unwrap_or(0);
        Self {
            table,
            history,
            next_sequence,
        }
    }
}

/// Which persisted parts a mutation touched.
#[derive(Debug, Clone, Copy)]
struct Dirty {
    table: bool,
    history: bool,
}

/// Central directory of agents.
///
/// Every mutation is persisted before it becomes visible; a failed write leaves
/// the in-memory table exactly as it was.
pub struct Registrar {
    state: Arc<RwLock<RegistrarState>>,
    write_gate: Mutex<()>,
    store: Arc<dyn RegistryStore>,
    strategy: Arc<dyn RankingStrategy>,
    config: RegistrarConfig,
}

impl Registrar {
    /// Opens a registrar over `store`, resuming whatever it already holds.
    pub fn open(
        config: RegistrarConfig,
        store: Arc<dyn RegistryStore>,
        strategy: Arc<dyn RankingStrategy>,
    ) -> Result<Self> {
        let table = store.load_registry()?;
        let history = store.load_history()?;
        info!(
            "Registrar loaded {} agent(s), ranking with {}",
            table.len(),
            strategy.name()
        );

        Ok(Self {
            state: Arc::new(RwLock::new(RegistrarState::new(table, history))),
            write_gate: Mutex::new(()),
            store,
            strategy,
            config,
        })
    }

    /// Non-persistent registrar with markup-match ranking.
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistrarState::default())),
            write_gate: Mutex::new(()),
            store: Arc::new(MemoryStore::new()),
            strategy: Arc::new(MarkupMatchStrategy::default()),
            config: RegistrarConfig::default(),
        }
    }

    /// Builds store and strategy from configuration.
    pub fn from_config(config: &MamaConfig) -> Result<Self> {
        let registrar = &config.registrar;
        let store: Arc<dyn RegistryStore> = match (&registrar.registry_path, &registrar.history_path) {
            (Some(registry), Some(history)) => Arc::new(JsonFileStore::new(registry, history)),
            (Some(registry), None) => Arc::new(JsonFileStore::beside(registry)),
            (None, Some(history)) => Arc::new(JsonFileStore::new(
                history.with_file_name("registry.json"),
                history,
            )),
            (None, None) => Arc::new(MemoryStore::new()),
        };

        let strategy: Arc<dyn RankingStrategy> = match registrar.strategy {
            RankingStrategyKind::MarkupMatch => Arc::new(MarkupMatchStrategy::new(Arc::new(
                KeywordMarkupExtractor::default(),
            ))),
            RankingStrategyKind::SemanticSimilarity => Arc::new(SemanticSimilarityStrategy::new(
                Arc::new(HashingEmbedder::new(config.semantic.embedding_dimension)),
                config.semantic.clone(),
            )),
        };

        Self::open(registrar.clone(), store, strategy)
    }

    pub fn config(&self) -> &RegistrarConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Upserts the record keyed by `agent_name` (last write wins).
    pub async fn register_agent(&self, msg: RegistrationMessage) -> Result<()> {
        if msg.agent_name.trim().is_empty() {
            return Err(AgentError::InvalidMessage("agent_name must not be empty".into()).into());
        }
        msg.validate()?;
        let name = msg.agent_name.clone();
        let (address, port) = (msg.address.clone(), msg.port);

        self.mutate(|state| {
            match state.table.get_mut(&name) {
                Some(record) => record.apply_registration(msg),
                None => {
                    let sequence = state.next_sequence;
                    state.next_sequence += 1;
                    state
                        .table
                        .insert(name.clone(), AgentRecord::from_registration(msg, sequence));
                }
            }
            Ok((
                Dirty {
                    table: true,
                    history: false,
                },
                (),
            ))
        })
        .await?;

        info!("Registered agent '{}' at {}:{}", name, address, port);
        Ok(())
    }

    /// Dispatches one raw inbound message. Malformed input never touches the table.
    pub async fn handle_message(&self, value: Value) -> Result<()> {
        match RegistrarMessage::from_value(value)? {
            RegistrarMessage::Register(msg) => self.register_agent(msg).await,
            RegistrarMessage::Report(report) => self.record_outcome(report).await,
        }
    }

    /// Feeds a served query back: relevance, popularity and query history.
    pub async fn record_outcome(&self, report: QueryReport) -> Result<()> {
        report.validate()?;
        let retention = self.config.history_retention.max(1);
        let name = report.agent_name.clone();

        let popularity = self
            .mutate(|state| {
                let record = state
                    .table
                    .get_mut(&report.agent_name)
                    .ok_or_else(|| AgentError::AgentNotFound(report.agent_name.clone()))?;
                let cumulative = record.cumulative_relevance + report.relevance;
                if !cumulative.is_finite() {
                    return Err(AgentError::InvalidMessage(format!(
                        "cumulative relevance of {} would overflow",
                        report.agent_name
                    ))
                    .into());
                }
                record.relevance = report.relevance;
                record.cumulative_relevance = cumulative;
                record.query_count += 1;
                record.updated_at = Utc::now();
                if let Some(address) = &report.address {
                    record.address = address.clone();
                }
                if let Some(port) = report.port {
                    record.port = port;
                }
                let popularity = record.popularity();

                let usable = !report.result.trim().is_empty();
                if usable {
                    let handled = state.history.entry(report.agent_name.clone()).or_default();
                    handled.push(report.query.clone());
                    if handled.len() > retention {
                        let excess = handled.len() - retention;
                        handled.drain(..excess);
                    }
                }
                Ok((
                    Dirty {
                        table: true,
                        history: usable,
                    },
                    popularity,
                ))
            })
            .await?;

        debug!("Agent '{}' popularity now {:.3}", name, popularity);
        Ok(())
    }

    /// Applies `update`; an unknown name becomes a fresh registration.
    pub async fn update_agent(&self, name: &str, update: AgentUpdate) -> Result<()> {
        update.validate()?;

        let created = self
            .mutate(|state| {
                let created = match state.table.get_mut(name) {
                    Some(record) => {
                        update.apply_to(record);
                        false
                    }
                    None => {
                        let sequence = state.next_sequence;
                        state.next_sequence += 1;
                        let msg = update.into_registration(name);
                        state
                            .table
                            .insert(name.to_string(), AgentRecord::from_registration(msg, sequence));
                        true
                    }
                };
                Ok((
                    Dirty {
                        table: true,
                        history: false,
                    },
                    created,
                ))
            })
            .await?;

        if created {
            info!("Update for unknown agent '{}' registered it", name);
        } else {
            info!("Updated agent '{}'", name);
        }
        Ok(())
    }

    /// Removes the agent and its query history. Returns whether it existed.
    pub async fn remove_agent(&self, name: &str) -> Result<bool> {
        let existed = self
            .mutate(|state| {
                let existed = state.table.remove(name).is_some();
                let had_history = state.history.remove(name).is_some();
                Ok((
                    Dirty {
                        table: existed,
                        history: had_history,
                    },
                    existed,
                ))
            })
            .await?;

        if existed {
            info!("Removed agent '{}'", name);
        }
        Ok(existed)
    }

    /// Best agent for `query`, computed fresh. `None` is a normal outcome.
    pub async fn rank_agents(&self, query: &str) -> Result<Option<RankedAgent>> {
        self.find_next_best(query, &[]).await
    }

    /// Same ranking with `excluding` skipped; the fallback when the first pick fails.
    pub async fn find_next_best(
        &self,
        query: &str,
        excluding: &[String],
    ) -> Result<Option<RankedAgent>> {
        let snapshot = self.state.read().await.clone();
        let ctx = RankingContext {
            table: &snapshot.table,
            history: &snapshot.history,
            excluded: excluding,
        };

        let best = self.strategy.rank(query, ctx).await?;
        match &best {
            Some(agent) => debug!(
                "Best agent for '{}': {} at {}:{} ({:.3})",
                query, agent.name, agent.address, agent.port, agent.relevance
            ),
            None => debug!("No suitable agent for '{}'", query),
        }
        Ok(best)
    }

    pub async fn get_agent(&self, name: &str) -> Option<AgentRecord> {
        self.state.read().await.table.get(name).cloned()
    }

    /// All records in first-registered order.
    pub async fn list_agents(&self) -> Vec<AgentRecord> {
        let state = self.state.read().await;
        let mut records: Vec<AgentRecord> = state.table.values().cloned().collect();
        records.sort_by_key(|r| r.sequence);
        records
    }

    pub async fn popularity(&self, name: &str) -> Option<f64> {
        self.state.read().await.table.get(name).map(AgentRecord::popularity)
    }

    pub async fn history(&self, name: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .history
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.table.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get_stats(&self) -> RegistryStats {
        let state = self.state.read().await;
        RegistryStats {
            total_agents: state.table.len(),
            total_queries: state.table.values().map(|r| r.query_count).sum(),
            remembered_queries: state.history.values().map(Vec::len).sum(),
        }
    }

    /// Binds the configured registrar port.
    pub async fn bind(&self, transport: &TransportConfig) -> Result<MessageListener> {
        MessageListener::bind(&self.config.host, self.config.port, transport).await
    }

    /// Serial accept loop: one message is handled to completion before the next.
    ///
    /// Errors from individual messages are logged and never end the loop.
    pub async fn serve(&self, listener: MessageListener, mut shutdown: Shutdown) -> Result<()> {
        info!(
            "Registrar listening on port {}",
            listener.local_port().unwrap_or(self.config.port)
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Registrar received shutdown signal");
                    break;
                }
                received = listener.recv_value() => match received {
                    Ok(value) => {
                        if let Err(e) = self.handle_message(value).await {
                            warn!("Rejected registrar message: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to receive registrar message: {}", e),
                },
            }
        }

        Ok(())
    }

    /// Runs [`Registrar::serve`] on a background task.
    pub fn spawn_serve(self: Arc<Self>, listener: MessageListener, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.serve(listener, shutdown).await {
                warn!("Registrar serve loop ended with error: {}", e);
            }
        })
    }

    /// Read-modify-persist-commit.
    ///
    /// Writers are serialized by `write_gate`; readers keep seeing the previous state
    /// until the new one is on disk. File I/O runs on the blocking pool.
    async fn mutate<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut RegistrarState) -> Result<(Dirty, R)>,
    {
        let _gate = self.write_gate.lock().await;
        let current = self.state.read().await.clone();
        let mut next = current.clone();
        let (dirty, output) = f(&mut next)?;

        let store = self.store.clone();
        let next = tokio::task::spawn_blocking(move || {
            write_through(store.as_ref(), dirty, &current, &next)?;
            Ok::<_, Error>(next)
        })
        .await
        .map_err(|e| AgentError::Persistence(format!("persistence task failed: {e}")))??;

        *self.state.write().await = next;
        Ok(output)
    }
}

/// Saves history, then the table. If the table write fails the previous
/// history is written back, so the two files never describe different states.
fn write_through(
    store: &dyn RegistryStore,
    dirty: Dirty,
    previous: &RegistrarState,
    next: &RegistrarState,
) -> Result<()> {
    if dirty.history {
        store.save_history(&next.history).map_err(persist_failed)?;
    }
    if dirty.table
        && let Err(e) = store.save_registry(&next.table)
    {
        if dirty.history
            && let Err(rollback) = store.save_history(&previous.history)
        {
            error!("Could not restore query history after failed write: {}", rollback);
        }
        return Err(persist_failed(e));
    }
    Ok(())
}

fn persist_failed(error: Error) -> Error {
    match error {
        Error::AgentError(AgentError::Persistence(_)) => error,
        other => AgentError::Persistence(other.to_string()).into(),
    }
}

/// Snapshot counters
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryStats {
    pub total_agents: usize,
    pub total_queries: u64,
    pub remembered_queries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registration(name: &str, positive: f64, negative: f64, port: u16) -> RegistrationMessage {
        RegistrationMessage::new(
            name,
            CapabilityProfile::new()
                .with("positive", positive)
                .with("negative", negative),
            "127.0.0.1",
            port,
        )
    }

    fn report(name: &str, query: &str, result: &str, relevance: f64) -> QueryReport {
        QueryReport {
            agent_name: name.into(),
            query: query.into(),
            result: result.into(),
            relevance,
            address: None,
            port: None,
        }
    }

    /// Store whose writes always fail.
    struct ReadOnlyStore;

    impl RegistryStore for ReadOnlyStore {
        fn load_registry(&self) -> Result<RegistryTable> {
            Ok(RegistryTable::new())
        }
        fn save_registry(&self, _: &RegistryTable) -> Result<()> {
            Err(AgentError::Persistence("read-only".into()).into())
        }
        fn load_history(&self) -> Result<QueryHistory> {
            Ok(QueryHistory::new())
        }
        fn save_history(&self, _: &QueryHistory) -> Result<()> {
            Err(AgentError::Persistence("read-only".into()).into())
        }
    }

    #[tokio::test]
    async fn test_empty_registrar_ranks_none() {
        let registrar = Registrar::in_memory();
        assert!(registrar.rank_agents("good").await.unwrap().is_none());
        assert!(registrar.rank_agents("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let registrar = Registrar::in_memory();
        registrar
            .register_agent(registration("agent-a", 1.0, 0.2, 4000).with_prompt("first"))
            .await
            .unwrap();
        registrar
            .register_agent(registration("agent-a", 0.3, 0.9, 4001))
            .await
            .unwrap();

        assert_eq!(registrar.len().await, 1);
        let record = registrar.get_agent("agent-a").await.unwrap();
        assert_eq!(record.port, 4001);
        assert_eq!(record.expertise_profile.weight("positive"), 0.3);
        assert_eq!(record.prompt, None);
    }

    #[tokio::test]
    async fn test_malformed_message_leaves_table_untouched() {
        let registrar = Registrar::in_memory();
        registrar
            .register_agent(registration("agent-a", 1.0, 0.2, 4000))
            .await
            .unwrap();

        let err = registrar
            .handle_message(json!({"agent_name": "agent-a", "relevance": 0.5}))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::AgentError(AgentError::MalformedMessage { ref field }) if field == "expertise_profile"
        ));
        assert_eq!(registrar.get_agent("agent-a").await.unwrap().port, 4000);
    }

    #[tokio::test]
    async fn test_remove_then_rank_falls_to_next() {
        let registrar = Registrar::in_memory();
        registrar
            .register_agent(registration("A", 1.0, 0.2, 4000))
            .await
            .unwrap();
        registrar
            .register_agent(registration("B", 0.2, 1.0, 4001))
            .await
            .unwrap();

        let query = "I love this, it's great and good";
        assert_eq!(registrar.rank_agents(query).await.unwrap().unwrap().name, "A");

        assert!(registrar.remove_agent("A").await.unwrap());
        assert!(!registrar.remove_agent("A").await.unwrap());
        assert_eq!(registrar.rank_agents(query).await.unwrap().unwrap().name, "B");
    }

    #[tokio::test]
    async fn test_find_next_best_skips_excluded() {
        let registrar = Registrar::in_memory();
        registrar
            .register_agent(registration("A", 1.0, 0.2, 4000))
            .await
            .unwrap();
        registrar
            .register_agent(registration("B", 0.2, 1.0, 4001))
            .await
            .unwrap();

        let next = registrar
            .find_next_best("good", &["A".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.name, "B");

        let none = registrar
            .find_next_best("good", &["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_agent_registers_it() {
        let registrar = Registrar::in_memory();
        registrar
            .update_agent(
                "late",
                AgentUpdate {
                    port: Some(4100),
                    expertise_profile: Some(CapabilityProfile::new().with("positive", 0.5)),
                    ..AgentUpdate::default()
                },
            )
            .await
            .unwrap();

        let record = registrar.get_agent("late").await.unwrap();
        assert_eq!(record.port, 4100);
        assert_eq!(record.address, "127.0.0.1");

        registrar
            .update_agent(
                "late",
                AgentUpdate {
                    relevance: Some(0.7),
                    ..AgentUpdate::default()
                },
            )
            .await
            .unwrap();
        let record = registrar.get_agent("late").await.unwrap();
        assert_eq!(record.relevance, 0.7);
        assert_eq!(record.port, 4100);
    }

    #[tokio::test]
    async fn test_outcomes_drive_popularity_and_bounded_history() {
        let registrar = Registrar::open(
            RegistrarConfig {
                history_retention: 2,
                ..RegistrarConfig::default()
            },
            Arc::new(MemoryStore::new()),
            Arc::new(MarkupMatchStrategy::default()),
        )
        .unwrap();
        registrar
            .register_agent(registration("A", 1.0, 0.2, 4000))
            .await
            .unwrap();

        registrar.record_outcome(report("A", "q1", "positive", 1.0)).await.unwrap();
        registrar.record_outcome(report("A", "q2", "", 0.5)).await.unwrap();
        registrar.record_outcome(report("A", "q3", "negative", 0.0)).await.unwrap();
        registrar.record_outcome(report("A", "q4", "neutral", 0.5)).await.unwrap();

        assert_eq!(registrar.popularity("A").await, Some(0.5));
        assert_eq!(registrar.history("A").await, vec!["q3", "q4"]);
        assert_eq!(registrar.get_agent("A").await.unwrap().relevance, 0.5);

        let err = registrar
            .record_outcome(report("ghost", "q", "positive", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentError(AgentError::AgentNotFound(_))));
    }

    #[tokio::test]
    async fn test_persistence_failure_fails_call_and_keeps_table() {
        let registrar = Registrar::open(
            RegistrarConfig::default(),
            Arc::new(ReadOnlyStore),
            Arc::new(MarkupMatchStrategy::default()),
        )
        .unwrap();

        let err = registrar
            .register_agent(registration("A", 1.0, 0.2, 4000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentError(AgentError::Persistence(_))));
        assert!(registrar.is_empty().await);
    }

    #[tokio::test]
    async fn test_restart_resumes_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = MamaConfig {
            registrar: RegistrarConfig {
                registry_path: Some(dir.path().join("registry.json")),
                ..RegistrarConfig::default()
            },
            ..MamaConfig::default()
        };

        {
            let registrar = Registrar::from_config(&config).unwrap();
            registrar
                .register_agent(registration("A", 1.0, 0.2, 4000))
                .await
                .unwrap();
            registrar
                .register_agent(registration("B", 0.2, 1.0, 4001))
                .await
                .unwrap();
            registrar.record_outcome(report("B", "bad", "negative", 0.9)).await.unwrap();
        }

        let restarted = Registrar::from_config(&config).unwrap();
        let names: Vec<String> = restarted.list_agents().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(restarted.history("B").await, vec!["bad"]);

        restarted
            .register_agent(registration("C", 0.1, 0.1, 4002))
            .await
            .unwrap();
        assert_eq!(restarted.get_agent("C").await.unwrap().sequence, 2);
        assert!(dir.path().join("query_history.json").exists());
    }

    #[tokio::test]
    async fn test_stats() {
        let registrar = Registrar::in_memory();
        registrar
            .register_agent(registration("A", 1.0, 0.2, 4000))
            .await
            .unwrap();
        registrar.record_outcome(report("A", "good", "positive", 0.8)).await.unwrap();

        let stats = registrar.get_stats().await;
        assert_eq!(stats.total_agents, 1);
        assert_eq!(stats.total_queries, 1);
        assert_eq!(stats.remembered_queries, 1);
    }

    /// In-memory store whose writes can be made to fail one file at a time.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_registry: std::sync::atomic::AtomicBool,
        fail_history: std::sync::atomic::AtomicBool,
    }

    impl FlakyStore {
        fn fail(flag: &std::sync::atomic::AtomicBool) -> Result<()> {
            if flag.load(std::sync::atomic::Ordering::SeqCst) {
                Err(AgentError::Persistence("disk full".into()).into())
            } else {
                Ok(())
            }
        }
    }

    impl RegistryStore for FlakyStore {
        fn load_registry(&self) -> Result<RegistryTable> {
            self.inner.load_registry()
        }
        fn save_registry(&self, table: &RegistryTable) -> Result<()> {
            Self::fail(&self.fail_registry)?;
            self.inner.save_registry(table)
        }
        fn load_history(&self) -> Result<QueryHistory> {
            self.inner.load_history()
        }
        fn save_history(&self, history: &QueryHistory) -> Result<()> {
            Self::fail(&self.fail_history)?;
            self.inner.save_history(history)
        }
    }

    fn flaky_registrar() -> (Arc<FlakyStore>, Registrar) {
        let store = Arc::new(FlakyStore::default());
        let registrar = Registrar::open(
            RegistrarConfig::default(),
            store.clone(),
            Arc::new(MarkupMatchStrategy::default()),
        )
        .unwrap();
        (store, registrar)
    }

    #[tokio::test]
    async fn test_failed_history_write_leaves_disk_and_memory_in_step() {
        use std::sync::atomic::Ordering;

        let (store, registrar) = flaky_registrar();
        registrar
            .register_agent(registration("A", 1.0, 0.2, 4000))
            .await
            .unwrap();

        store.fail_history.store(true, Ordering::SeqCst);
        let err = registrar
            .record_outcome(report("A", "good", "positive", 0.9))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentError(AgentError::Persistence(_))));

        assert_eq!(registrar.get_agent("A").await.unwrap().query_count, 0);
        assert_eq!(store.load_registry().unwrap()["A"].query_count, 0);
        assert!(store.load_history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_table_write_restores_history() {
        use std::sync::atomic::Ordering;

        let (store, registrar) = flaky_registrar();
        registrar
            .register_agent(registration("A", 1.0, 0.2, 4000))
            .await
            .unwrap();
        registrar
            .record_outcome(report("A", "first", "positive", 0.5))
            .await
            .unwrap();

        store.fail_registry.store(true, Ordering::SeqCst);
        assert!(registrar.remove_agent("A").await.is_err());
        assert!(
            registrar
                .record_outcome(report("A", "second", "positive", 0.5))
                .await
                .is_err()
        );

        assert_eq!(registrar.history("A").await, vec!["first"]);
        assert_eq!(store.load_history().unwrap()["A"], vec!["first"]);
        assert_eq!(store.load_registry().unwrap()["A"].query_count, 1);
        assert_eq!(registrar.get_agent("A").await.unwrap().query_count, 1);
    }

    #[tokio::test]
    async fn test_overflowing_relevance_never_reaches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = MamaConfig {
            registrar: RegistrarConfig {
                registry_path: Some(dir.path().join("registry.json")),
                ..RegistrarConfig::default()
            },
            ..MamaConfig::default()
        };

        let registrar = Registrar::from_config(&config).unwrap();
        registrar
            .register_agent(registration("A", 1.0, 0.2, 4000))
            .await
            .unwrap();

        let huge = json!({"agent_name": "A", "query": "q", "result": "positive", "relevance": 1.7e308});
        registrar.handle_message(huge.clone()).await.unwrap();
        let err = registrar.handle_message(huge).await.unwrap_err();
        assert!(matches!(err, Error::AgentError(AgentError::InvalidMessage(_))));

        let mut nan = registration("B", 1.0, 0.2, 4001);
        nan.relevance = f64::NAN;
        assert!(registrar.register_agent(nan).await.is_err());
        assert!(
            registrar
                .update_agent(
                    "A",
                    AgentUpdate {
                        expertise_profile: Some(CapabilityProfile::new().with("positive", f64::INFINITY)),
                        ..AgentUpdate::default()
                    },
                )
                .await
                .is_err()
        );

        let reopened = Registrar::from_config(&config).unwrap();
        let record = reopened.get_agent("A").await.unwrap();
        assert_eq!(record.query_count, 1);
        assert!(record.cumulative_relevance.is_finite());
        assert!(reopened.get_agent("B").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_update_racing_remove_never_errors() {
        let registrar = Arc::new(Registrar::in_memory());

        for round in 0..50u16 {
            registrar
                .register_agent(registration("A", 1.0, 0.2, 4000))
                .await
                .unwrap();

            let updater = registrar.clone();
            let update = tokio::spawn(async move {
                updater
                    .update_agent(
                        "A",
                        AgentUpdate {
                            port: Some(5000 + round),
                            ..AgentUpdate::default()
                        },
                    )
                    .await
            });
            let removed = registrar.remove_agent("A").await;

            update.await.unwrap().unwrap();
            removed.unwrap();
            registrar.remove_agent("A").await.unwrap();
        }
    }
}
