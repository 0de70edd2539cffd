use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Clamp a confidence / importance / strength value into `[0.0, 1.0]`.
///
/// `NaN` maps to `0.0`.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// Clamp a sentiment / valence value into `[-1.0, 1.0]`.
///
/// `NaN` maps to `0.0` (neutral).
pub fn clamp_signed(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(-1.0, 1.0) }
}

/// A concept recognised in one utterance by the perception stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    /// e.g. `"entity"`, `"action"`, `"PERSON"`.
    pub category: String,
    pub confidence: f64,
}

impl Concept {
    pub fn new(name: impl Into<String>, category: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            confidence: clamp_unit(confidence),
        }
    }
}

/// A typed, weighted relationship between two concepts of one utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    pub strength: f64,
}

impl Relationship {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        relation_type: impl Into<String>,
        strength: f64,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relation_type: relation_type.into(),
            strength: clamp_unit(strength),
        }
    }
}

/// Structured output of the perception stage for one input utterance.
///
/// Only `raw_text` is required when deserialising; every other field
/// defaults to its empty / neutral value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Percept {
    #[serde(default)]
    pub concepts: Vec<Concept>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    /// In `[-1.0, 1.0]`.
    #[serde(default)]
    pub sentiment: f64,
    /// In `[0.0, 1.0]`.
    #[serde(default)]
    pub complexity: f64,
    /// Ordered by salience, most salient first.
    #[serde(default)]
    pub keywords: Vec<String>,
    pub raw_text: String,

    /// Primary intent label (e.g. `"question"`, `"greeting"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_tone: Option<String>,
    /// Coarse complexity bucket as labelled by the context analyser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Concept names grouped by abstraction level.  When empty, levels are
    /// derived from concept categories; see [`Percept::abstraction_levels`].
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub abstraction_levels: BTreeMap<u8, Vec<String>>,
}

impl Percept {
    pub fn new(raw_text: impl Into<String>) -> Self {
        Self {
            raw_text: raw_text.into(),
            ..Default::default()
        }
    }

    pub fn with_concepts(mut self, concepts: Vec<Concept>) -> Self {
        self.concepts = concepts;
        self
    }

    pub fn with_relationships(mut self, relationships: Vec<Relationship>) -> Self {
        self.relationships = relationships;
        self
    }

    pub fn with_keywords<S: Into<String>>(mut self, keywords: impl IntoIterator<Item = S>) -> Self {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sentiment(mut self, sentiment: f64) -> Self {
        self.sentiment = clamp_signed(sentiment);
        self
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = clamp_unit(complexity);
        self
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Concept names grouped by abstraction level.
    ///
    /// Returns the explicit grouping when the perception stage supplied one.
    /// Otherwise concepts are bucketed by category: level 0 holds concrete
    /// entities, level 1 actions and qualities, level 2 everything else.
    pub fn abstraction_levels(&self) -> BTreeMap<u8, Vec<String>> {
        if !self.abstraction_levels.is_empty() {
            return self.abstraction_levels.clone();
        }
        let mut levels: BTreeMap<u8, Vec<String>> = BTreeMap::new();
        for concept in &self.concepts {
            let level = match concept.category.as_str() {
                "entity" | "PERSON" | "ORG" | "PRODUCT" => 0,
                "action" | "quality" => 1,
                _ => 2,
            };
            let bucket = levels.entry(level).or_default();
            if !bucket.contains(&concept.name) {
                bucket.push(concept.name.clone());
            }
        }
        levels
    }
}

/// Which store a recalled memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    WorkingMemory,
    Episodic,
    Association,
}

impl std::fmt::Display for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemorySource::WorkingMemory => write!(f, "working_memory"),
            MemorySource::Episodic => write!(f, "episodic"),
            MemorySource::Association => write!(f, "association"),
        }
    }
}

/// Why a memory was considered relevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    WorkingMemory,
    KeywordMatch,
    EmotionalSimilarity,
    Association,
}

/// One fused recall result handed to the reasoning layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevantMemory {
    pub source: MemorySource,
    pub kind: MatchKind,
    pub content: Value,
    /// Each source's own relevance score; higher is more relevant.
    pub relevance: f64,
}

/// Result of recording one percept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// `None` when the episode could not be persisted.
    pub episode_id: Option<String>,
    /// Spreading-activation levels keyed by concept label.
    pub activation: BTreeMap<String, f64>,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_helpers_bound_values_and_neutralise_nan() {
        assert_eq!(clamp_unit(1.7), 1.0);
        assert_eq!(clamp_unit(-0.2), 0.0);
        assert_eq!(clamp_unit(f64::NAN), 0.0);
        assert_eq!(clamp_signed(-3.0), -1.0);
        assert_eq!(clamp_signed(0.4), 0.4);
        assert_eq!(clamp_signed(f64::NAN), 0.0);
    }

    #[test]
    fn percept_deserialises_with_only_raw_text() {
        let p: Percept = serde_json::from_str(r#"{"raw_text":"hello there"}"#).unwrap();
        assert_eq!(p.raw_text, "hello there");
        assert!(p.concepts.is_empty());
        assert!(p.intent.is_none());
        assert_eq!(p.sentiment, 0.0);
    }

    #[test]
    fn relationship_type_field_uses_wire_name() {
        let rel = Relationship::new("dog", "animal", "is_a", 0.9);
        let json = serde_json::to_value(&rel).unwrap();
        assert_eq!(json["type"], "is_a");
    }

    #[test]
    fn abstraction_levels_derived_from_categories() {
        let p = Percept::new("the dog runs happily").with_concepts(vec![
            Concept::new("dog", "entity", 0.9),
            Concept::new("run", "action", 0.8),
            Concept::new("happiness", "emotion", 0.6),
            Concept::new("Alice", "PERSON", 0.7),
        ]);
        let levels = p.abstraction_levels();
        assert_eq!(levels[&0], vec!["dog", "Alice"]);
        assert_eq!(levels[&1], vec!["run"]);
        assert_eq!(levels[&2], vec!["happiness"]);
    }

    #[test]
    fn explicit_abstraction_levels_win() {
        let mut p = Percept::new("x").with_concepts(vec![Concept::new("dog", "entity", 0.9)]);
        p.abstraction_levels.insert(2, vec!["dog".to_string()]);
        let levels = p.abstraction_levels();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[&2], vec!["dog"]);
    }

    #[test]
    fn memory_source_display_matches_serde() {
        for source in [
            MemorySource::WorkingMemory,
            MemorySource::Episodic,
            MemorySource::Association,
        ] {
            let json = serde_json::to_string(&source).unwrap();
            assert_eq!(json, format!("\"{source}\""));
        }
    }
}
