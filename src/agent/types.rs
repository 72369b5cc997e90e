use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::error::{Result, agent_error::AgentError};

/// Tag → expertise weight declared by an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityProfile(BTreeMap<String, f64>);

impl CapabilityProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tag: impl Into<String>, weight: f64) -> Self {
        self.0.insert(tag.into(), weight);
        self
    }

    /// Weight for `tag`, zero when the tag is not declared.
    pub fn weight(&self, tag: &str) -> f64 {
        self.0.get(tag).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, tag: impl Into<String>, weight: f64) {
        self.0.insert(tag.into(), weight);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(tag, weight)| (tag.as_str(), *weight))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Rejects NaN and infinite weights, which cannot be written back as JSON.
    pub fn ensure_finite(&self) -> Result<()> {
        match self.0.iter().find(|(_, weight)| !weight.is_finite()) {
            Some((tag, _)) => Err(AgentError::InvalidMessage(format!(
                "weight for tag `{tag}` must be finite"
            ))
            .into()),
            None => Ok(()),
        }
    }
}

impl From<BTreeMap<String, f64>> for CapabilityProfile {
    fn from(map: BTreeMap<String, f64>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for CapabilityProfile {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Per-query tag weights. Computed on demand, never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryMarkup(BTreeMap<String, f64>);

impl QueryMarkup {
    pub fn weight(&self, tag: &str) -> f64 {
        self.0.get(tag).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, tag: impl Into<String>, weight: f64) {
        self.0.insert(tag.into(), weight);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(tag, weight)| (tag.as_str(), *weight))
    }

    /// Tag with the highest weight; ties go to the lexicographically smallest tag.
    pub fn dominant_tag(&self) -> Option<&str> {
        let mut best: Option<(&str, f64)> = None;
        for (tag, weight) in self.iter() {
            match best {
                Some((_, best_weight)) if weight <= best_weight => {}
                _ => best = Some((tag, weight)),
            }
        }
        best.map(|(tag, _)| tag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for QueryMarkup {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Σ profile[tag] × markup[tag] over the tags of the markup.
pub fn markup_relevance(profile: &CapabilityProfile, markup: &QueryMarkup) -> f64 {
    markup
        .iter()
        .map(|(tag, weight)| profile.weight(tag) * weight)
        .sum()
}

/// Agent lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentLifecycleState {
    Uninitialized,
    PortsAssigned,
    Registered,
    Serving,
    Stopped,
}

impl fmt::Display for AgentLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentLifecycleState::Uninitialized => write!(f, "uninitialized"),
            AgentLifecycleState::PortsAssigned => write!(f, "ports-assigned"),
            AgentLifecycleState::Registered => write!(f, "registered"),
            AgentLifecycleState::Serving => write!(f, "serving"),
            AgentLifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Ports an agent listens on or reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPorts {
    /// Incoming query requests.
    pub receive: u16,
    /// Default destination for replies when a request names none.
    pub reply: u16,
    /// Registrar's well-known port.
    pub registrar: u16,
}
