use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    agent::types::CapabilityProfile,
    error::{Result, agent_error::AgentError},
};

/// Registration message (PML): what an agent announces about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationMessage {
    pub agent_name: String,
    pub expertise_profile: CapabilityProfile,
    pub relevance: f64,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl RegistrationMessage {
    /// Fields every registration must carry.
    pub const REQUIRED_FIELDS: [&'static str; 5] = [
        "agent_name",
        "expertise_profile",
        "relevance",
        "address",
        "port",
    ];

    pub fn new(
        agent_name: impl Into<String>,
        expertise_profile: CapabilityProfile,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            expertise_profile,
            relevance: 0.0,
            address: address.into(),
            port,
            specialty: None,
            prompt: None,
        }
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = relevance;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = Some(specialty.into());
        self
    }

    /// Decodes raw JSON, naming the first missing required field.
    pub fn from_value(value: Value) -> Result<Self> {
        require_fields(&value, &Self::REQUIRED_FIELDS)?;
        let msg: Self = serde_json::from_value(value)
            .map_err(|e| AgentError::InvalidMessage(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }

    /// Relevance and every profile weight must be finite.
    pub fn validate(&self) -> Result<()> {
        ensure_finite_relevance(self.relevance)?;
        self.expertise_profile.ensure_finite()
    }
}

/// Post-query report (PML) sent by an agent after serving a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryReport {
    pub agent_name: String,
    pub query: String,
    pub result: String,
    pub relevance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, alias = "agent_port", skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl QueryReport {
    pub const REQUIRED_FIELDS: [&'static str; 4] = ["agent_name", "query", "result", "relevance"];

    pub fn from_value(value: Value) -> Result<Self> {
        require_fields(&value, &Self::REQUIRED_FIELDS)?;
        let report: Self = serde_json::from_value(value)
            .map_err(|e| AgentError::InvalidMessage(e.to_string()))?;
        report.validate()?;
        Ok(report)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_finite_relevance(self.relevance)
    }
}

/// Anything the registrar accepts on its well-known port.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrarMessage {
    Register(RegistrationMessage),
    Report(QueryReport),
}

impl RegistrarMessage {
    /// Objects carrying a `query` key are reports, everything else is a registration.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(AgentError::InvalidMessage("expected a JSON object".into()).into());
        }
        if value.get("query").is_some() {
            QueryReport::from_value(value).map(RegistrarMessage::Report)
        } else {
            RegistrationMessage::from_value(value).map(RegistrarMessage::Register)
        }
    }

    pub fn agent_name(&self) -> &str {
        match self {
            RegistrarMessage::Register(msg) => &msg.agent_name,
            RegistrarMessage::Report(report) => &report.agent_name,
        }
    }
}

/// Query delivered to an agent's receive port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            reply_address: None,
            reply_port: None,
            request_id: None,
        }
    }

    /// Asks the agent to answer on `address:port`, tagged with a fresh request id.
    pub fn reply_to(mut self, address: impl Into<String>, port: u16) -> Self {
        self.reply_address = Some(address.into());
        self.reply_port = Some(port);
        self.request_id = Some(uuid::Uuid::new_v4().to_string());
        self
    }
}

/// Agent's answer to a [`QueryRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryReply {
    pub agent: String,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

fn ensure_finite_relevance(relevance: f64) -> Result<()> {
    if relevance.is_finite() {
        Ok(())
    } else {
        Err(AgentError::InvalidMessage(format!("relevance {relevance} is not finite")).into())
    }
}

fn require_fields(value: &Value, fields: &[&str]) -> Result<()> {
    let object = value
        .as_object()
        .ok_or_else(|| AgentError::InvalidMessage("expected a JSON object".into()))?;

    match fields.iter().find(|field| !object.contains_key(**field)) {
        Some(field) => Err(AgentError::MalformedMessage {
            field: field.to_string(),
        }
        .into()),
        None => Ok(()),
    }
}
