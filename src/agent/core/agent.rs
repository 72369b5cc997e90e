use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    agent::{
        classifier::{Classifier, KeywordClassifier},
        markup::{KeywordMarkupExtractor, MarkupExtractor},
        reinforcement::{NoReinforcement, ReinforcementPolicy},
        types::{AgentLifecycleState, AgentPorts, CapabilityProfile, QueryMarkup, markup_relevance},
    },
    error::{Error, Result, agent_error::AgentError},
    multi_agent::communication::{
        MessageListener, QueryReply, QueryReport, QueryRequest, RegistrationMessage, Transport,
        ephemeral_port,
    },
    shared::{
        Shutdown,
        config::{AgentProfileConfig, AgentRuntimeConfig, BackoffKind, MamaConfig},
    },
    utils::retry::{RetryError, RetryPolicy},
};

/// A specialist that registers with the registrar and answers routed queries.
pub struct Agent {
    name: String,
    expertise: CapabilityProfile,
    specialty: Option<String>,
    prompt: Option<String>,
    host: String,
    registrar_host: String,
    ports: AgentPorts,
    state: AgentLifecycleState,
    /// Running relevance, adjusted by the reinforcement policy after each query.
    relevance: f64,
    runtime: AgentRuntimeConfig,
    transport: Transport,
    extractor: Arc<dyn MarkupExtractor>,
    classifier: Arc<dyn Classifier>,
    policy: Arc<dyn ReinforcementPolicy>,
}

impl Agent {
    pub fn new(profile: AgentProfileConfig, config: &MamaConfig) -> Self {
        Self {
            name: profile.name,
            expertise: profile.profile.into(),
            specialty: profile.specialty,
            prompt: profile.prompt,
            host: config.agent.host.clone(),
            registrar_host: config.registrar.host.clone(),
            ports: AgentPorts {
                receive: 0,
                reply: 0,
                registrar: config.registrar.port,
            },
            state: AgentLifecycleState::Uninitialized,
            relevance: 0.0,
            runtime: config.agent.clone(),
            transport: Transport::new(config.transport.clone()),
            extractor: Arc::new(KeywordMarkupExtractor::default()),
            classifier: Arc::new(KeywordClassifier::default()),
            policy: Arc::new(NoReinforcement),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn MarkupExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn ReinforcementPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Points the agent at a registrar other than the configured one.
    pub fn set_registrar(&mut self, host: impl Into<String>, port: u16) {
        self.registrar_host = host.into();
        self.ports.registrar = port;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expertise(&self) -> &CapabilityProfile {
        &self.expertise
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ports(&self) -> AgentPorts {
        self.ports
    }

    pub fn state(&self) -> AgentLifecycleState {
        self.state
    }

    pub fn relevance(&self) -> f64 {
        self.relevance
    }

    /// Picks fresh ephemeral receive and reply ports.
    pub fn assign_ports(&mut self) -> Result<AgentPorts> {
        self.ports = fresh_ports(&self.host, self.ports.registrar)?;
        if self.state == AgentLifecycleState::Uninitialized {
            self.state = AgentLifecycleState::PortsAssigned;
        }
        debug!(
            "{} assigned receive port {} and reply port {}",
            self.name, self.ports.receive, self.ports.reply
        );
        Ok(self.ports)
    }

    pub fn registration_message(&self) -> RegistrationMessage {
        RegistrationMessage {
            agent_name: self.name.clone(),
            expertise_profile: self.expertise.clone(),
            relevance: self.relevance,
            address: self.host.clone(),
            port: self.ports.receive,
            specialty: self.specialty.clone(),
            prompt: self.prompt.clone(),
        }
    }

    /// Announces the agent to the registrar.
    ///
    /// Each failed attempt is followed by a backoff and a fresh pair of ports.
    /// Gives up with [`AgentError::RegistrationFailed`] once attempts run out.
    pub async fn register(&mut self, shutdown: &Shutdown) -> Result<()> {
        if self.state == AgentLifecycleState::Uninitialized {
            self.assign_ports()?;
        }

        let policy = RetryPolicy::new(
            self.runtime.registration_attempts,
            Duration::from_millis(self.runtime.registration_base_delay_ms),
            BackoffKind::Exponential,
        );
        let transport = &self.transport;
        let registrar_host = self.registrar_host.as_str();
        let host = self.host.as_str();
        let current = self.ports;
        let template = self.registration_message();

        let outcome = policy
            .run_until(
                |attempt| {
                    let ports = if attempt == 1 {
                        Ok(current)
                    } else {
                        fresh_ports(host, current.registrar)
                    };
                    let mut msg = template.clone();
                    async move {
                        let ports = ports?;
                        msg.port = ports.receive;
                        transport
                            .try_send(registrar_host, ports.registrar, &msg)
                            .await
                            .map(|_| ports)
                    }
                },
                Error::is_transport,
                shutdown,
            )
            .await;

        match outcome {
            Ok(ports) => {
                self.ports = ports;
                self.state = AgentLifecycleState::Registered;
                info!(
                    "Agent {} registered on port {} with registrar {}:{}",
                    self.name, ports.receive, self.registrar_host, ports.registrar
                );
                Ok(())
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!("Agent {} could not register: {}", self.name, last);
                Err(AgentError::RegistrationFailed {
                    agent: self.name.clone(),
                    attempts,
                }
                .into())
            }
            Err(RetryError::Fatal { error, .. }) => Err(error),
            Err(RetryError::Cancelled { .. }) => Err(AgentError::Cancelled.into()),
        }
    }

    /// Markup and raw relevance of this agent for `query`.
    pub fn evaluate(&self, query: &str) -> (QueryMarkup, f64) {
        let markup = self.extractor.extract(query);
        let relevance = markup_relevance(&self.expertise, &markup);
        (markup, relevance)
    }

    /// Classifies `query` and updates the running relevance. Never fails.
    pub fn process_query(&mut self, query: &str) -> (String, f64) {
        let (markup, observed) = self.evaluate(query);
        self.relevance = self.policy.adjust(self.relevance, observed);
        let label = self.classifier.classify(query, &markup);
        debug!(
            "{} labelled '{}' as {} (relevance {:.3})",
            self.name, query, label, self.relevance
        );
        (label, self.relevance)
    }

    /// Answers one request: reply to the requester, then report to the registrar.
    ///
    /// Both sends are attempted; the first failure is returned.
    pub async fn handle_request(&mut self, request: QueryRequest) -> Result<QueryReply> {
        let (result, relevance) = self.process_query(&request.query);

        let reply = QueryReply {
            agent: self.name.clone(),
            result: result.clone(),
            request_id: request.request_id.clone(),
        };
        let reply_host = request.reply_address.as_deref().unwrap_or(&self.host);
        let reply_port = request.reply_port.unwrap_or(self.ports.reply);
        let reply_sent = self.transport.send(reply_host, reply_port, &reply).await;
        if let Err(e) = &reply_sent {
            warn!("{} could not deliver its reply: {}", self.name, e);
        }

        let report = QueryReport {
            agent_name: self.name.clone(),
            query: request.query,
            result,
            relevance,
            address: Some(self.host.clone()),
            port: Some(self.ports.receive),
        };
        let report_sent = self
            .transport
            .send(&self.registrar_host, self.ports.registrar, &report)
            .await;
        if let Err(e) = &report_sent {
            warn!("{} could not report to the registrar: {}", self.name, e);
        }

        reply_sent?;
        report_sent?;
        Ok(reply)
    }

    /// Binds the receive port chosen at registration.
    pub async fn bind(&self) -> Result<MessageListener> {
        if self.state == AgentLifecycleState::Uninitialized {
            return Err(AgentError::InvalidState(format!("{} has no ports yet", self.name)).into());
        }
        MessageListener::bind(&self.host, self.ports.receive, self.transport.config()).await
    }

    /// Binds the receive port and serves until `shutdown` fires.
    pub async fn serve(&mut self, shutdown: Shutdown) -> Result<()> {
        let listener = self.bind().await?;
        self.serve_on(listener, shutdown).await
    }

    /// One request per connection. A bad request is logged and skipped.
    pub async fn serve_on(&mut self, listener: MessageListener, mut shutdown: Shutdown) -> Result<()> {
        self.state = AgentLifecycleState::Serving;
        info!("Agent {} serving on port {}", self.name, self.ports.receive);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Agent {} received shutdown signal", self.name);
                    break;
                }
                received = listener.recv::<QueryRequest>() => match received {
                    Ok(request) => {
                        if let Err(e) = self.handle_request(request).await {
                            warn!("Agent {} failed to answer a request: {}", self.name, e);
                        }
                    }
                    Err(e) => warn!("Agent {} skipped a bad request: {}", self.name, e),
                },
            }
        }

        self.state = AgentLifecycleState::Stopped;
        info!("Agent {} stopped", self.name);
        Ok(())
    }
}

fn fresh_ports(host: &str, registrar: u16) -> Result<AgentPorts> {
    Ok(AgentPorts {
        receive: ephemeral_port(host)?,
        reply: ephemeral_port(host)?,
        registrar,
    })
}
