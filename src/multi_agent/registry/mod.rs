pub mod agent_registry;
pub mod embedding;
pub mod ranking;
pub mod store;

pub use agent_registry::{AgentUpdate, Registrar, RegistryStats};
pub use embedding::{Embedder, HashingEmbedder, cosine_similarity};
pub use ranking::{
    MarkupMatchStrategy, RankedAgent, RankingContext, RankingStrategy, SemanticSimilarityStrategy,
};
pub use store::{AgentRecord, JsonFileStore, MemoryStore, QueryHistory, RegistryStore, RegistryTable};
