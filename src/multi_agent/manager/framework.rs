use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    agent::{core::Agent, types::AgentPorts},
    error::{Result, agent_error::AgentError},
    multi_agent::{
        communication::{MessageListener, QueryReply, QueryRequest, Transport},
        registry::{RankedAgent, Registrar},
    },
    shared::{
        Shutdown, ShutdownTrigger,
        config::{AgentProfileConfig, MamaConfig},
        shutdown_channel,
    },
};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A query answered by an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteResult {
    pub agent: String,
    pub result: String,
    pub relevance: f64,
    /// Popularity as recorded when the reply arrived.
    pub popularity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Routed(RouteResult),
    NoSuitableAgent,
}

/// Running agent task
struct AgentHandle {
    task: Option<JoinHandle<()>>,
    shutdown: ShutdownTrigger,
    ports: AgentPorts,
}

impl AgentHandle {
    async fn stop(mut self, name: &str) {
        self.shutdown.trigger();
        if let Some(task) = self.task.take()
            && tokio::time::timeout(STOP_TIMEOUT, task).await.is_err()
        {
            warn!("Agent {} did not stop within {:?}", name, STOP_TIMEOUT);
        }
    }
}

/// Owns the registrar, the agent tasks and the routing loop.
pub struct Framework {
    registrar: Arc<Registrar>,
    registrar_host: String,
    registrar_port: u16,
    agents: Arc<RwLock<HashMap<String, AgentHandle>>>,
    transport: Transport,
    config: MamaConfig,
    shutdown: ShutdownTrigger,
    registrar_task: Mutex<Option<JoinHandle<()>>>,
}

impl Framework {
    /// Opens the registrar from `config`, binds its port and starts serving.
    ///
    /// A configured port of 0 binds an ephemeral port; agents are pointed at it.
    pub async fn start(config: MamaConfig) -> Result<Self> {
        config.validate()?;
        let registrar = Arc::new(Registrar::from_config(&config)?);
        let listener = registrar.bind(&config.transport).await?;
        let registrar_port = listener.local_port()?;

        let (shutdown, signal) = shutdown_channel();
        let task = registrar.clone().spawn_serve(listener, signal);

        info!(
            "Framework started, registrar on {}:{} ranking with {}",
            config.registrar.host,
            registrar_port,
            registrar.strategy_name()
        );

        Ok(Self {
            registrar,
            registrar_host: config.registrar.host.clone(),
            registrar_port,
            agents: Arc::new(RwLock::new(HashMap::new())),
            transport: Transport::new(config.transport.clone()),
            config,
            shutdown,
            registrar_task: Mutex::new(Some(task)),
        })
    }

    /// Starts the framework and one agent per profile listed in `config.agents`.
    pub async fn start_with_agents(config: MamaConfig) -> Result<Self> {
        let profiles = config.agents.clone();
        let framework = Self::start(config).await?;
        for profile in profiles {
            framework.spawn_agent(profile).await?;
        }
        Ok(framework)
    }

    pub fn registrar(&self) -> &Arc<Registrar> {
        &self.registrar
    }

    pub fn registrar_port(&self) -> u16 {
        self.registrar_port
    }

    pub fn config(&self) -> &MamaConfig {
        &self.config
    }

    /// Builds an agent with default collaborators and adds it.
    pub async fn spawn_agent(&self, profile: AgentProfileConfig) -> Result<AgentPorts> {
        profile.validate()?;
        self.add_agent(Agent::new(profile, &self.config)).await
    }

    /// Registers `agent` (with retry), binds its receive port and spawns its serve task.
    ///
    /// An agent already running under the same name is stopped first.
    pub async fn add_agent(&self, mut agent: Agent) -> Result<AgentPorts> {
        let name = agent.name().to_string();
        agent.set_registrar(self.registrar_host.clone(), self.registrar_port);

        let previous = self.agents.write().await.remove(&name);
        if let Some(previous) = previous {
            info!("Replacing running agent {}", name);
            previous.stop(&name).await;
        }

        agent.register(&self.shutdown.subscribe()).await?;
        let listener = agent.bind().await?;
        let ports = agent.ports();

        let (trigger, signal) = shutdown_channel();
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = agent.serve_on(listener, signal).await {
                error!("Agent {} serve loop failed: {}", task_name, e);
            }
        });

        self.agents.write().await.insert(
            name.clone(),
            AgentHandle {
                task: Some(task),
                shutdown: trigger,
                ports,
            },
        );

        info!("Agent {} added on port {}", name, ports.receive);
        Ok(ports)
    }

    /// Best agent for `query` without dispatching it.
    pub async fn select(&self, query: &str) -> Result<Option<RankedAgent>> {
        let selected = self.registrar.rank_agents(query).await?;
        match &selected {
            Some(agent) => info!(
                "Selected {} for '{}' (relevance {:.3})",
                agent.name, query, agent.relevance
            ),
            None => info!("No suitable agent for '{}'", query),
        }
        Ok(selected)
    }

    /// Delivers `query` to the best agent and waits for its answer.
    ///
    /// An agent that cannot be reached, times out or answers with an empty result is
    /// skipped and the next best one is tried.
    pub async fn route(&self, query: &str) -> Result<RouteOutcome> {
        let mut tried: Vec<String> = Vec::new();

        loop {
            let Some(candidate) = self.registrar.find_next_best(query, &tried).await? else {
                info!("No suitable agent for '{}' after {} attempt(s)", query, tried.len());
                return Ok(RouteOutcome::NoSuitableAgent);
            };

            match self.dispatch(&candidate, query).await {
                Ok(reply) if !reply.result.trim().is_empty() => {
                    let popularity = self.registrar.popularity(&reply.agent).await.unwrap_or(0.0);
                    info!("'{}' routed to {}: {}", query, candidate.name, reply.result);
                    return Ok(RouteOutcome::Routed(RouteResult {
                        agent: candidate.name,
                        result: reply.result,
                        relevance: candidate.relevance,
                        popularity,
                    }));
                }
                Ok(_) => warn!("Agent {} returned an empty result", candidate.name),
                Err(e) => warn!("Agent {} failed: {}", candidate.name, e),
            }
            tried.push(candidate.name);
        }
    }

    async fn dispatch(&self, candidate: &RankedAgent, query: &str) -> Result<QueryReply> {
        let host = self.config.agent.host.as_str();
        let listener = MessageListener::bind(host, 0, &self.config.transport).await?;
        let request = QueryRequest::new(query).reply_to(host, listener.local_port()?);

        self.transport
            .send(&candidate.address, candidate.port, &request)
            .await?;

        let timeout = self.config.agent.reply_timeout();
        let waiting = await_reply(&listener, request.request_id.as_deref());

        match tokio::time::timeout(timeout, waiting).await {
            Ok(reply) => reply,
            Err(_) => Err(AgentError::Transport {
                target: format!("{}:{}", candidate.address, candidate.port),
                attempts: 1,
                reason: format!("no reply within {timeout:?}"),
            }
            .into()),
        }
    }

    /// Stops the agent's task and removes it from the registrar.
    pub async fn remove_agent(&self, name: &str) -> Result<bool> {
        let handle = self.agents.write().await.remove(name);
        let was_running = handle.is_some();
        if let Some(handle) = handle {
            handle.stop(name).await;
        }

        let was_registered = self.registrar.remove_agent(name).await?;
        if was_running || was_registered {
            info!("Agent {} removed", name);
        }
        Ok(was_running || was_registered)
    }

    /// Names of agents with a running serve task.
    pub async fn running_agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn agent_ports(&self, name: &str) -> Option<AgentPorts> {
        self.agents.read().await.get(name).map(|handle| handle.ports)
    }

    /// Stops every agent, then the registrar. Registrations stay persisted.
    pub async fn shutdown_all(&self) -> Result<()> {
        let handles: Vec<(String, AgentHandle)> = self.agents.write().await.drain().collect();
        join_all(handles.into_iter().map(|(name, handle)| async move {
            handle.stop(&name).await;
        }))
        .await;

        self.shutdown.trigger();
        if let Some(task) = self.registrar_task.lock().await.take()
            && tokio::time::timeout(STOP_TIMEOUT, task).await.is_err()
        {
            warn!("Registrar did not stop within {:?}", STOP_TIMEOUT);
        }

        info!("All agents shut down");
        Ok(())
    }

    /// A signal that fires when [`Framework::shutdown_all`] runs.
    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.subscribe()
    }
}

/// Next reply carrying `request_id`; replies to other requests are dropped.
async fn await_reply(listener: &MessageListener, request_id: Option<&str>) -> Result<QueryReply> {
    loop {
        let reply: QueryReply = listener.recv().await?;
        if reply.request_id.as_deref() == request_id {
            return Ok(reply);
        }
        debug!("Discarding stray reply from {}", reply.agent);
    }
}
