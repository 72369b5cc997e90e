use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::{
    agent::{
        markup::{KeywordMarkupExtractor, MarkupExtractor},
        types::markup_relevance,
    },
    error::Result,
    multi_agent::registry::{
        embedding::{Embedder, HashingEmbedder, cosine_similarity},
        store::{AgentRecord, QueryHistory, RegistryTable},
    },
    shared::config::SemanticConfig,
};

/// Where to deliver a query, and how relevant the agent scored.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedAgent {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub relevance: f64,
}

impl RankedAgent {
    fn from_record(record: &AgentRecord, relevance: f64) -> Self {
        Self {
            name: record.name.clone(),
            address: record.address.clone(),
            port: record.port,
            relevance,
        }
    }
}

/// Consistent snapshot a strategy ranks over.
#[derive(Debug, Clone, Copy)]
pub struct RankingContext<'a> {
    pub table: &'a RegistryTable,
    pub history: &'a QueryHistory,
    /// Names that must not be selected.
    pub excluded: &'a [String],
}

impl<'a> RankingContext<'a> {
    /// Records not excluded, in first-registered order.
    pub fn candidates(&self) -> Vec<&'a AgentRecord> {
        let mut records: Vec<&AgentRecord> = self
            .table
            .values()
            .filter(|record| !self.excluded.contains(&record.name))
            .collect();
        records.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.name.cmp(&b.name)));
        records
    }
}

/// A ranking policy. Returning `None` means no agent qualifies, which is not an error.
#[async_trait]
pub trait RankingStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn rank(&self, query: &str, ctx: RankingContext<'_>) -> Result<Option<RankedAgent>>;
}

/// Keeps the first maximum, so ties go to the earliest registration.
fn keep_best(best: &mut Option<RankedAgent>, candidate: RankedAgent) {
    match best {
        Some(current) if candidate.relevance <= current.relevance => {}
        _ => *best = Some(candidate),
    }
}

/// Weighted tag overlap between the query markup and each agent profile.
///
/// Only agents with a strictly positive weight for the markup's dominant tag compete.
pub struct MarkupMatchStrategy {
    extractor: Arc<dyn MarkupExtractor>,
}

impl MarkupMatchStrategy {
    pub fn new(extractor: Arc<dyn MarkupExtractor>) -> Self {
        Self { extractor }
    }
}

impl Default for MarkupMatchStrategy {
    fn default() -> Self {
        Self::new(Arc::new(KeywordMarkupExtractor::default()))
    }
}

#[async_trait]
impl RankingStrategy for MarkupMatchStrategy {
    fn name(&self) -> &str {
        "markup_match"
    }

    async fn rank(&self, query: &str, ctx: RankingContext<'_>) -> Result<Option<RankedAgent>> {
        let markup = self.extractor.extract(query);
        let Some(dominant) = markup.dominant_tag() else {
            return Ok(None);
        };

        let mut best = None;
        for record in ctx.candidates() {
            if record.expertise_profile.weight(dominant) <= 0.0 {
                continue;
            }
            let relevance = markup_relevance(&record.expertise_profile, &markup);
            debug!("{} scores {:.3} on `{}`", record.name, relevance, dominant);
            keep_best(&mut best, RankedAgent::from_record(record, relevance));
        }
        Ok(best)
    }
}

/// Cosine similarity between the query and each agent's declared prompt,
/// plus a bonus when the agent already answered a near-duplicate query.
pub struct SemanticSimilarityStrategy {
    embedder: Arc<dyn Embedder>,
    config: SemanticConfig,
}

impl SemanticSimilarityStrategy {
    pub fn new(embedder: Arc<dyn Embedder>, config: SemanticConfig) -> Self {
        Self { embedder, config }
    }

    async fn history_bonus(&self, query_embedding: &[f32], handled: &[String]) -> Result<f32> {
        for previous in handled {
            let embedding = self.embedder.embed(previous).await?;
            if cosine_similarity(query_embedding, &embedding) > self.config.history_match_threshold {
                return Ok(self.config.history_bonus);
            }
        }
        Ok(0.0)
    }
}

impl Default for SemanticSimilarityStrategy {
    fn default() -> Self {
        let config = SemanticConfig::default();
        Self::new(
            Arc::new(HashingEmbedder::new(config.embedding_dimension)),
            config,
        )
    }
}

#[async_trait]
impl RankingStrategy for SemanticSimilarityStrategy {
    fn name(&self) -> &str {
        "semantic_similarity"
    }

    async fn rank(&self, query: &str, ctx: RankingContext<'_>) -> Result<Option<RankedAgent>> {
        let query_embedding = self.embedder.embed(query).await?;

        let mut best = None;
        for record in ctx.candidates() {
            let Some(prompt) = record.prompt.as_deref().filter(|p| !p.trim().is_empty()) else {
                continue;
            };
            let prompt_embedding = self.embedder.embed(prompt).await?;
            let similarity = cosine_similarity(&query_embedding, &prompt_embedding);

            let handled = ctx.history.get(&record.name).map(Vec::as_slice).unwrap_or(&[]);
            let score = similarity + self.history_bonus(&query_embedding, handled).await?;

            debug!("{} similarity {:.3}, score {:.3}", record.name, similarity, score);
            if score < self.config.min_similarity {
                continue;
            }
            keep_best(&mut best, RankedAgent::from_record(record, score as f64));
        }
        Ok(best)
    }
}
