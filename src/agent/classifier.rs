use crate::agent::types::QueryMarkup;

/// "Given text, return a label." Stands in for the LLM completion endpoint.
pub trait Classifier: Send + Sync {
    fn classify(&self, query: &str, markup: &QueryMarkup) -> String;
}

/// First matching keyword decides the label.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordClassifier {
    rules: Vec<(String, String)>,
    fallback: String,
}

impl KeywordClassifier {
    pub fn new(rules: Vec<(String, String)>, fallback: impl Into<String>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(keyword, label)| (keyword.to_lowercase(), label))
                .collect(),
            fallback: fallback.into(),
        }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(
            vec![
                ("good".to_string(), "positive".to_string()),
                ("bad".to_string(), "negative".to_string()),
            ],
            "neutral",
        )
    }
}

impl Classifier for KeywordClassifier {
    fn classify(&self, query: &str, _markup: &QueryMarkup) -> String {
        let text = query.to_lowercase();
        self.rules
            .iter()
            .find(|(keyword, _)| text.contains(keyword.as_str()))
            .map(|(_, label)| label.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Labels by the markup's dominant tag.
#[derive(Debug, Clone, Default)]
pub struct DominantTagClassifier;

impl Classifier for DominantTagClassifier {
    fn classify(&self, _query: &str, markup: &QueryMarkup) -> String {
        markup.dominant_tag().unwrap_or("neutral").to_string()
    }
}
