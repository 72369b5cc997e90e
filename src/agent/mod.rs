pub mod classifier;
pub mod core;
pub mod markup;
pub mod reinforcement;
pub mod types;

pub use classifier::{Classifier, DominantTagClassifier, KeywordClassifier};
pub use self::core::Agent;
pub use markup::{KeywordMarkupExtractor, KeywordRule, MarkupExtractor};
pub use reinforcement::{
    NoReinforcement, RandomReinforcement, ReinforcementPolicy, SmoothedReinforcement,
};
pub use types::{AgentLifecycleState, AgentPorts, CapabilityProfile, QueryMarkup, markup_relevance};
