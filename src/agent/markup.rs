use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::agent::types::QueryMarkup;

/// Derives per-query tag weights from raw text. Must be total over any input.
pub trait MarkupExtractor: Send + Sync {
    fn extract(&self, query: &str) -> QueryMarkup;
}

/// One keyword heuristic producing a single tag weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub tag: String,
    /// Fires when any of these substrings is present.
    #[serde(default)]
    pub any_of: Vec<String>,
    /// Fires only when all of these substrings are present.
    #[serde(default)]
    pub all_of: Vec<String>,
    pub hit_weight: f64,
    pub miss_weight: f64,
}

impl KeywordRule {
    pub fn any_of(tag: &str, keywords: &[&str], hit_weight: f64, miss_weight: f64) -> Self {
        Self {
            tag: tag.to_string(),
            any_of: keywords.iter().map(|k| k.to_string()).collect(),
            all_of: Vec::new(),
            hit_weight,
            miss_weight,
        }
    }

    pub fn all_of(tag: &str, keywords: &[&str], hit_weight: f64, miss_weight: f64) -> Self {
        Self {
            tag: tag.to_string(),
            any_of: Vec::new(),
            all_of: keywords.iter().map(|k| k.to_string()).collect(),
            hit_weight,
            miss_weight,
        }
    }

    fn matches(&self, text: &str) -> bool {
        if self.any_of.is_empty() && self.all_of.is_empty() {
            return false;
        }
        let any = self.any_of.is_empty() || self.any_of.iter().any(|k| text.contains(k.as_str()));
        let all = self.all_of.iter().all(|k| text.contains(k.as_str()));
        any && all
    }
}

static DEFAULT_RULES: Lazy<Vec<KeywordRule>> = Lazy::new(|| {
    vec![
        KeywordRule::any_of("positive", &["good", "happy"], 0.8, 0.2),
        KeywordRule::any_of("negative", &["bad", "sad"], 0.8, 0.2),
        KeywordRule::all_of("sarcasm", &["not", "happy"], 0.9, 0.1),
    ]
});

/// Case-insensitive substring heuristic. Intentionally simple, not NLP.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordMarkupExtractor {
    rules: Vec<KeywordRule>,
}

impl KeywordMarkupExtractor {
    pub fn new(rules: Vec<KeywordRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|mut rule| {
                rule.any_of.iter_mut().for_each(|k| *k = k.to_lowercase());
                rule.all_of.iter_mut().for_each(|k| *k = k.to_lowercase());
                rule
            })
            .collect();
        Self { rules }
    }

    pub fn rules(&self) -> &[KeywordRule] {
        &self.rules
    }
}

impl Default for KeywordMarkupExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_RULES.clone())
    }
}

impl MarkupExtractor for KeywordMarkupExtractor {
    fn extract(&self, query: &str) -> QueryMarkup {
        let text = query.to_lowercase();
        self.rules
            .iter()
            .map(|rule| {
                let weight = if rule.matches(&text) {
                    rule.hit_weight
                } else {
                    rule.miss_weight
                };
                (rule.tag.clone(), weight)
            })
            .collect()
    }
}
