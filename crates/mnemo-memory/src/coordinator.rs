//! Memory Coordinator.
//!
//! Single entry point the reasoning layer talks to.  It owns the three
//! stores and turns each perceived utterance into:
//!
//! 1. working-memory items (raw input and top concepts),
//! 2. one persisted [`Episode`](crate::episodic::Episode) with derived
//!    importance and tags,
//! 3. association updates and one step of spreading activation.
//!
//! [`MemoryCoordinator::recall`] fuses hits from all three stores into one
//! ranked list.  A failing store never aborts a turn: its error is logged
//! and its contribution replaced by an empty/neutral default.
//!
//! # Locking
//!
//! `record` and `consolidate` share a write gate so a consolidation can
//! never interleave with a half-finished record.  `recall` and `stats` do
//! not take the gate; they rely on the per-store locks.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use mnemo_types::{MatchKind, MemorySource, Percept, RecordOutcome, RelevantMemory, clamp_unit};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::associations::{AssociationGraph, GraphError, GraphStats};
use crate::cache::{CacheStats, ShortTermCache};
use crate::config::MemoryConfig;
use crate::consolidation::{ConsolidationReport, find_patterns, reinforce_patterns};
use crate::episodic::{
    Episode, EpisodeQuery, EpisodicError, EpisodicStats, EpisodicStore, NewEpisode,
};

/// Importance of the raw-input working-memory item.
const RAW_INPUT_IMPORTANCE: f64 = 0.8;
/// Concepts cached per record, in perception order.
const CACHED_CONCEPTS: usize = 5;
/// Keywords turned into `keyword_*` tags.
const TAGGED_KEYWORDS: usize = 5;
/// Strength of the weak edge between concepts on one abstraction level.
const SAME_LEVEL_STRENGTH: f64 = 0.3;
/// Concepts above this confidence are activated and used as recall cues.
const ACTIVE_CONFIDENCE: f64 = 0.5;

const RECALL_CACHE_LIMIT: usize = 3;
const RECALL_KEYWORDS: usize = 3;
const RECALL_PER_KEYWORD: usize = 2;
const RECALL_EMOTION_MIN: f64 = 0.3;
const RECALL_EMOTION_WINDOW: f64 = 0.2;
const RECALL_EMOTION_LIMIT: usize = 2;
const RECALL_ASSOCIATIONS: usize = 3;

/// Aggregated figures of all three stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub working_memory: CacheStats,
    pub episodic: EpisodicStats,
    pub associations: GraphStats,
    pub records_since_consolidation: u64,
    pub consolidation_due: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Episode derivation
// ─────────────────────────────────────────────────────────────────────────────

/// `0.5 + 0.3·complexity + 0.2·|sentiment| + min(concepts/10, 0.3)`, plus
/// `0.2` for questions, clamped to `[0, 1]`.
pub fn episode_importance(percept: &Percept) -> f64 {
    let mut importance = 0.5;
    importance += percept.complexity * 0.3;
    importance += percept.sentiment.abs() * 0.2;
    importance += (percept.concepts.len() as f64 / 10.0).min(0.3);
    if percept.intent.as_deref() == Some("question") {
        importance += 0.2;
    }
    clamp_unit(importance)
}

/// Tags describing a percept: intent, emotional tone, complexity bucket,
/// concept categories, populated abstraction levels, language and the
/// leading keywords.
pub fn episode_tags(percept: &Percept) -> Vec<String> {
    let mut tags = Vec::new();
    let mut push = |tag: String| {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    };

    if let Some(intent) = &percept.intent {
        push(format!("intent_{intent}"));
    }
    let emotion = match &percept.emotional_tone {
        Some(tone) => tone.clone(),
        None if percept.sentiment > 0.3 => "positive".into(),
        None if percept.sentiment < -0.3 => "negative".into(),
        None => "neutral".into(),
    };
    push(format!("emotion_{emotion}"));
    let complexity = match &percept.complexity_level {
        Some(level) => level.clone(),
        None if percept.complexity < 0.3 => "low".into(),
        None if percept.complexity < 0.7 => "medium".into(),
        None => "high".into(),
    };
    push(format!("complexity_{complexity}"));

    for concept in &percept.concepts {
        push(format!("category_{}", concept.category));
    }
    for (level, names) in percept.abstraction_levels() {
        if !names.is_empty() {
            push(format!("abstraction_level_{level}"));
        }
    }
    if let Some(language) = &percept.language {
        push(format!("language_{language}"));
    }
    for keyword in percept.keywords.iter().take(TAGGED_KEYWORDS) {
        push(format!("keyword_{keyword}"));
    }
    tags
}

fn episode_id(percept: &Percept, at: DateTime<Utc>) -> String {
    let seed = format!("{}_{}", percept.raw_text, at.to_rfc3339_opts(SecondsFormat::Nanos, true));
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
}

fn episode_content(percept: &Percept, at: DateTime<Utc>) -> Value {
    json!({
        "raw_text": percept.raw_text,
        "concepts": percept.concepts,
        "relationships": percept.relationships,
        "keywords": percept.keywords,
        "sentiment": percept.sentiment,
        "complexity": percept.complexity,
        "recorded_at": at,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryCoordinator
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the cache, episodic store and association graph.
pub struct MemoryCoordinator {
    cache: Mutex<ShortTermCache>,
    episodic: EpisodicStore,
    associations: AssociationGraph,
    config: MemoryConfig,
    write_gate: Mutex<()>,
    records_since_consolidation: AtomicU64,
    consolidation_due: AtomicBool,
    /// Disambiguates raw-input cache keys recorded within one millisecond.
    input_seq: AtomicU64,
}

impl MemoryCoordinator {
    /// Open all durable stores named by `config`.
    pub fn open(config: MemoryConfig) -> Result<Self, EpisodicError> {
        let config = config.validated();
        let cache = ShortTermCache::new(config.cache.capacity);
        let episodic = EpisodicStore::from_config(&config.episodic)?;
        let associations = AssociationGraph::open(&config.associations);
        Ok(Self::with_stores(cache, episodic, associations, config))
    }

    /// Assemble a coordinator from already-built stores.
    pub fn with_stores(
        cache: ShortTermCache,
        episodic: EpisodicStore,
        associations: AssociationGraph,
        config: MemoryConfig,
    ) -> Self {
        Self {
            cache: Mutex::new(cache),
            episodic,
            associations,
            config: config.validated(),
            write_gate: Mutex::new(()),
            records_since_consolidation: AtomicU64::new(0),
            consolidation_due: AtomicBool::new(false),
            input_seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn episodic(&self) -> &EpisodicStore {
        &self.episodic
    }

    pub fn associations(&self) -> &AssociationGraph {
        &self.associations
    }

    /// Run `f` with exclusive access to the working-memory cache.
    pub fn with_cache<R>(&self, f: impl FnOnce(&mut ShortTermCache) -> R) -> R {
        f(&mut self.lock_cache())
    }

    fn lock_cache(&self) -> MutexGuard<'_, ShortTermCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_gate(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── record ───────────────────────────────────────────────────────────────

    /// Fold one percept into memory.  `context` is stored verbatim as the
    /// episode's context snapshot.
    pub fn record(&self, percept: &Percept, context: &Map<String, Value>) -> RecordOutcome {
        let _gate = self.lock_gate();
        let now = Utc::now();

        self.cache_percept(percept, now);
        let episode_id = self.persist_episode(percept, context, now);
        self.update_associations(percept);
        let activation = self.activate_concepts(percept);

        let recorded = self.records_since_consolidation.fetch_add(1, Ordering::SeqCst) + 1;
        if recorded >= self.config.consolidation.every_n_records {
            self.records_since_consolidation.store(0, Ordering::SeqCst);
            self.consolidation_due.store(true, Ordering::SeqCst);
            if self.config.consolidation.inline {
                self.consolidate_locked();
            }
        }

        debug!(
            episode = episode_id.as_deref().unwrap_or("-"),
            activated = activation.len(),
            "percept recorded"
        );
        RecordOutcome {
            episode_id,
            activation,
            recorded_at: now,
        }
    }

    fn cache_percept(&self, percept: &Percept, now: DateTime<Utc>) {
        let seq = self.input_seq.fetch_add(1, Ordering::Relaxed);
        let mut cache = self.lock_cache();
        cache.store(
            format!("input:{}-{seq}", now.timestamp_millis()),
            Value::String(percept.raw_text.clone()),
            RAW_INPUT_IMPORTANCE,
        );
        for concept in percept.concepts.iter().take(CACHED_CONCEPTS) {
            cache.store(
                format!("concept:{}", concept.name),
                json!({
                    "name": concept.name,
                    "category": concept.category,
                    "confidence": concept.confidence,
                }),
                concept.confidence,
            );
        }
    }

    fn persist_episode(
        &self,
        percept: &Percept,
        context: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let id = episode_id(percept, now);
        let episode = NewEpisode::new(id.clone(), episode_content(percept, now))
            .with_context(context.clone())
            .with_valence(percept.sentiment)
            .with_importance(episode_importance(percept))
            .with_tags(episode_tags(percept))
            .recorded_at(now);

        match self.episodic.store_episode(&episode) {
            Ok(()) => Some(id),
            Err(e) => {
                warn!(error = %e, "failed to persist episode");
                None
            }
        }
    }

    fn update_associations(&self, percept: &Percept) {
        for rel in &percept.relationships {
            let result = self.associations.create_or_reinforce(
                &rel.source,
                &rel.target,
                rel.strength,
                &rel.relation_type,
            );
            if let Err(e) = result {
                warn!(
                    source = %rel.source,
                    target = %rel.target,
                    error = %e,
                    "skipped relationship"
                );
            }
        }
        for (level, names) in percept.abstraction_levels() {
            let kind = format!("same_level_{level}");
            for (i, a) in names.iter().enumerate() {
                for b in &names[i + 1..] {
                    let result =
                        self.associations.create_or_reinforce(a, b, SAME_LEVEL_STRENGTH, &kind);
                    if let Err(e) = result {
                        warn!(a = %a, b = %b, error = %e, "skipped same-level association");
                    }
                }
            }
        }
    }

    fn activate_concepts(&self, percept: &Percept) -> BTreeMap<String, f64> {
        let active: Vec<&str> = percept
            .concepts
            .iter()
            .filter(|c| c.confidence > ACTIVE_CONFIDENCE)
            .map(|c| c.name.as_str())
            .collect();
        if active.is_empty() {
            return Default::default();
        }
        self.associations.activate(&active)
    }

    // ── recall ───────────────────────────────────────────────────────────────

    /// Memories relevant to `percept`, most relevant first.
    ///
    /// Sources: working-memory search on the raw text, episodes matching the
    /// leading keywords, episodes with similar valence (strongly emotional
    /// input only) and associations of the confident concepts.  Each source
    /// scores with its own relevance; an episode found by several cues is
    /// reported once.
    pub fn recall(&self, percept: &Percept) -> Vec<RelevantMemory> {
        let mut memories = Vec::new();

        let hits = self.lock_cache().search(&percept.raw_text, RECALL_CACHE_LIMIT);
        for hit in hits {
            memories.push(RelevantMemory {
                source: MemorySource::WorkingMemory,
                kind: MatchKind::WorkingMemory,
                content: json!({
                    "key": hit.key,
                    "content": hit.content,
                    "importance": hit.importance,
                    "age_seconds": hit.age_seconds,
                }),
                relevance: hit.relevance,
            });
        }

        let mut seen_episodes = HashSet::new();
        for keyword in percept.keywords.iter().take(RECALL_KEYWORDS) {
            let query = EpisodeQuery::new().text(keyword.as_str());
            self.collect_episodes(
                &query,
                RECALL_PER_KEYWORD,
                MatchKind::KeywordMatch,
                &mut seen_episodes,
                &mut memories,
            );
        }

        if percept.sentiment.abs() > RECALL_EMOTION_MIN {
            let query = EpisodeQuery::new().valence_range(
                percept.sentiment - RECALL_EMOTION_WINDOW,
                percept.sentiment + RECALL_EMOTION_WINDOW,
            );
            self.collect_episodes(
                &query,
                RECALL_EMOTION_LIMIT,
                MatchKind::EmotionalSimilarity,
                &mut seen_episodes,
                &mut memories,
            );
        }

        for concept in percept.concepts.iter().filter(|c| c.confidence > ACTIVE_CONFIDENCE) {
            for assoc in self.associations.associations_of(&concept.name, RECALL_ASSOCIATIONS) {
                memories.push(RelevantMemory {
                    source: MemorySource::Association,
                    kind: MatchKind::Association,
                    content: json!({
                        "from": concept.name,
                        "concept": assoc.concept,
                        "strength": assoc.strength,
                        "kind": assoc.kind,
                        "reinforcement_count": assoc.reinforcement_count,
                    }),
                    relevance: assoc.strength,
                });
            }
        }

        memories.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        memories.truncate(self.config.recall.max_results);
        debug!(results = memories.len(), "recall finished");
        memories
    }

    fn collect_episodes(
        &self,
        query: &EpisodeQuery,
        limit: usize,
        kind: MatchKind,
        seen: &mut HashSet<String>,
        out: &mut Vec<RelevantMemory>,
    ) {
        let episodes = match self.episodic.search(query, limit) {
            Ok(episodes) => episodes,
            Err(e) => {
                warn!(error = %e, ?kind, "episodic recall failed");
                return;
            }
        };
        for episode in episodes {
            if !seen.insert(episode.id.clone()) {
                continue;
            }
            match episode_json(&episode) {
                Ok(content) => out.push(RelevantMemory {
                    source: MemorySource::Episodic,
                    kind,
                    content,
                    relevance: episode.importance,
                }),
                Err(e) => warn!(id = %episode.id, error = %e, "unserialisable episode"),
            }
        }
    }

    // ── consolidation ────────────────────────────────────────────────────────

    /// True once `every_n_records` records happened since the last run.
    pub fn consolidation_due(&self) -> bool {
        self.consolidation_due.load(Ordering::SeqCst)
    }

    /// Consolidate if due.  Returns the report of the run, if any.
    pub fn run_due_consolidation(&self) -> Option<ConsolidationReport> {
        if !self.consolidation_due() {
            return None;
        }
        Some(self.consolidate())
    }

    /// Mine recent episodes for recurring tags, reinforce the implied
    /// associations, prune and save the graph.
    pub fn consolidate(&self) -> ConsolidationReport {
        let _gate = self.lock_gate();
        self.consolidate_locked()
    }

    fn consolidate_locked(&self) -> ConsolidationReport {
        self.consolidation_due.store(false, Ordering::SeqCst);
        let settings = &self.config.consolidation;
        let mut report = ConsolidationReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let episodes = match self.episodic.recent_episodes(settings.window) {
            Ok(episodes) => episodes,
            Err(e) => {
                warn!(error = %e, "consolidation skipped: cannot read recent episodes");
                return report;
            }
        };
        report.episodes_scanned = episodes.len();
        report.patterns = find_patterns(&episodes, settings.window, settings.min_pattern_size);

        match reinforce_patterns(&self.associations, &report.patterns) {
            Ok(applied) => report.associations_reinforced = applied,
            Err(e) => {
                warn!(error = %e, "consolidation skipped: reinforcement failed");
                return report;
            }
        }
        report.edges_pruned = self.associations.prune();
        match self.associations.save() {
            Ok(()) => report.saved = true,
            Err(e) => warn!(error = %e, "consolidation could not save association graph"),
        }

        info!(
            scanned = report.episodes_scanned,
            patterns = report.patterns.len(),
            reinforced = report.associations_reinforced,
            pruned = report.edges_pruned,
            saved = report.saved,
            "memory consolidated"
        );
        report
    }

    // ── observability / lifecycle ────────────────────────────────────────────

    pub fn stats(&self) -> MemoryStats {
        let episodic = self.episodic.stats().unwrap_or_else(|e| {
            warn!(error = %e, "episodic stats unavailable");
            EpisodicStats::default()
        });
        MemoryStats {
            working_memory: self.lock_cache().stats(),
            episodic,
            associations: self.associations.stats(),
            records_since_consolidation: self.records_since_consolidation.load(Ordering::SeqCst),
            consolidation_due: self.consolidation_due(),
        }
    }

    /// Persist the association graph.  Waits for an in-flight record or
    /// consolidation to finish first.
    pub fn shutdown(&self) -> Result<(), GraphError> {
        let _gate = self.lock_gate();
        self.associations.save()?;
        info!("memory coordinator shut down");
        Ok(())
    }
}

fn episode_json(episode: &Episode) -> Result<Value, serde_json::Error> {
    serde_json::to_value(episode)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssociationConfig;
    use mnemo_types::{Concept, Relationship};
    use std::sync::Arc;
    use std::thread;

    fn coordinator() -> MemoryCoordinator {
        MemoryCoordinator::with_stores(
            ShortTermCache::new(7),
            EpisodicStore::open_in_memory().unwrap(),
            AssociationGraph::new(&AssociationConfig::default()),
            MemoryConfig::default(),
        )
    }

    fn dog_percept() -> Percept {
        Percept::new("Is my dog a good pet?")
            .with_concepts(vec![
                Concept::new("dog", "entity", 0.9),
                Concept::new("pet", "entity", 0.8),
                Concept::new("good", "quality", 0.4),
            ])
            .with_relationships(vec![Relationship::new("dog", "animal", "is_a", 0.9)])
            .with_keywords(["dog", "pet"])
            .with_sentiment(0.5)
            .with_complexity(0.2)
            .with_intent("question")
            .with_language("en")
    }

    // ── derivation ───────────────────────────────────────────────────────────

    #[test]
    fn importance_blends_signals_and_clamps() {
        let plain = Percept::new("hi");
        assert!((episode_importance(&plain) - 0.5).abs() < 1e-12);

        let p = Percept::new("x")
            .with_complexity(0.5)
            .with_sentiment(-0.5)
            .with_concepts(vec![
                Concept::new("a", "entity", 0.9),
                Concept::new("b", "entity", 0.9),
            ]);
        // 0.5 + 0.15 + 0.1 + 0.2
        assert!((episode_importance(&p) - 0.95).abs() < 1e-12);

        assert_eq!(episode_importance(&dog_percept()), 1.0);
    }

    #[test]
    fn tags_cover_every_signal() {
        let tags = episode_tags(&dog_percept());
        assert_eq!(
            tags,
            vec![
                "intent_question",
                "emotion_positive",
                "complexity_low",
                "category_entity",
                "category_quality",
                "abstraction_level_0",
                "abstraction_level_1",
                "language_en",
                "keyword_dog",
                "keyword_pet",
            ]
        );
    }

    #[test]
    fn explicit_tone_and_level_override_buckets() {
        let mut p = Percept::new("x").with_sentiment(-0.9).with_complexity(0.9);
        p.emotional_tone = Some("calm".into());
        p.complexity_level = Some("simple".into());
        let tags = episode_tags(&p);
        assert!(tags.contains(&"emotion_calm".to_string()));
        assert!(tags.contains(&"complexity_simple".to_string()));
        assert!(!tags.iter().any(|t| t.starts_with("intent_") || t.starts_with("language_")));
    }

    #[test]
    fn episode_ids_differ_per_timestamp() {
        let p = Percept::new("same words");
        let t = Utc::now();
        assert_eq!(episode_id(&p, t), episode_id(&p, t));
        assert_ne!(episode_id(&p, t), episode_id(&p, t + chrono::Duration::microseconds(1)));
    }

    // ── record ───────────────────────────────────────────────────────────────

    #[test]
    fn record_populates_all_three_stores() {
        let mem = coordinator();
        let mut ctx = Map::new();
        ctx.insert("session".into(), json!("abc"));

        let outcome = mem.record(&dog_percept(), &ctx);
        let id = outcome.episode_id.expect("episode persisted");

        let keys: Vec<String> =
            mem.with_cache(|c| c.snapshot().into_iter().map(|e| e.key).collect());
        assert!(keys[0].starts_with("input:"));
        assert_eq!(&keys[1..], ["concept:dog", "concept:pet", "concept:good"]);

        let episode = mem.episodic().retrieve_episode(&id).unwrap().unwrap();
        assert_eq!(episode.context_snapshot, ctx);
        assert_eq!(episode.content["raw_text"], "Is my dog a good pet?");
        assert_eq!(episode.content["concepts"][0]["name"], "dog");
        assert!(episode.tags.contains("intent_question"));
        assert!((episode.emotional_valence - 0.5).abs() < 1e-12);

        let graph = mem.associations();
        assert_eq!(graph.association("dog", "animal").unwrap().kind, "is_a");
        let same_level = graph.association("dog", "pet").unwrap();
        assert_eq!(same_level.kind, "same_level_0");
        assert!((same_level.base_strength - 0.3).abs() < 1e-12);

        // dog and pet are seeds; animal is reached from dog (0.9 × 0.5).
        assert_eq!(outcome.activation["dog"], 1.0);
        assert_eq!(outcome.activation["pet"], 1.0);
        assert!((outcome.activation["animal"] - 0.45).abs() < 1e-6);
        assert!(!outcome.activation.contains_key("good"));
    }

    #[test]
    fn self_relationships_are_skipped_not_fatal() {
        let mem = coordinator();
        let p = Percept::new("echo echo")
            .with_relationships(vec![Relationship::new("echo", "echo", "self", 0.9)]);
        let outcome = mem.record(&p, &Map::new());
        assert!(outcome.episode_id.is_some());
        assert_eq!(mem.associations().edge_count(), 0);
    }

    // ── recall ───────────────────────────────────────────────────────────────

    #[test]
    fn recall_fuses_sources_by_relevance() {
        let mem = coordinator();
        mem.record(&dog_percept(), &Map::new());

        let cue = Percept::new("dog")
            .with_concepts(vec![Concept::new("dog", "entity", 0.9)])
            .with_keywords(["dog", "pet"])
            .with_sentiment(0.6);
        let memories = mem.recall(&cue);

        let kinds: HashSet<MatchKind> = memories.iter().map(|m| m.kind).collect();
        assert!(kinds.contains(&MatchKind::WorkingMemory));
        assert!(kinds.contains(&MatchKind::KeywordMatch));
        assert!(kinds.contains(&MatchKind::Association));
        // Found by both keywords and by valence, reported once.
        let episodic = memories.iter().filter(|m| m.source == MemorySource::Episodic).count();
        assert_eq!(episodic, 1);

        assert!(memories.windows(2).all(|w| w[0].relevance >= w[1].relevance));
        assert!(memories.len() <= 10);
        assert_eq!(memories[0].relevance, 1.0);
    }

    #[test]
    fn emotional_recall_only_for_strong_sentiment() {
        let mem = coordinator();
        mem.record(&Percept::new("what a wonderful day").with_sentiment(0.8), &Map::new());

        let calm = mem.recall(&Percept::new("zzz").with_sentiment(0.1));
        assert!(calm.is_empty());

        let happy = mem.recall(&Percept::new("zzz").with_sentiment(0.7));
        assert_eq!(happy.len(), 1);
        assert_eq!(happy[0].kind, MatchKind::EmotionalSimilarity);
        assert_eq!(happy[0].content["content"]["raw_text"], "what a wonderful day");
    }

    #[test]
    fn recall_is_capped() {
        let mut config = MemoryConfig::default();
        config.recall.max_results = 2;
        let mem = MemoryCoordinator::with_stores(
            ShortTermCache::new(7),
            EpisodicStore::open_in_memory().unwrap(),
            AssociationGraph::new(&config.associations),
            config,
        );
        mem.record(&dog_percept(), &Map::new());
        let cue = dog_percept();
        assert_eq!(mem.recall(&cue).len(), 2);
    }

    #[test]
    fn keyword_recall_ignores_payload_field_names() {
        let mem = coordinator();
        mem.record(&Percept::new("I love my dog"), &Map::new());

        let year = Utc::now().format("%Y").to_string();
        for keyword in ["text", "ship", "sentiment", year.as_str()] {
            let cue = Percept::new("zzz").with_keywords([keyword]);
            let memories = mem.recall(&cue);
            assert!(
                memories.iter().all(|m| m.kind != MatchKind::KeywordMatch),
                "{keyword:?} matched an episode"
            );
        }

        let cue = Percept::new("zzz").with_keywords(["dog"]);
        let memories = mem.recall(&cue);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].kind, MatchKind::KeywordMatch);
    }

    #[test]
    fn back_to_back_records_keep_every_raw_input() {
        let mem = coordinator();
        mem.record(&Percept::new("first"), &Map::new());
        mem.record(&Percept::new("second"), &Map::new());
        mem.record(&Percept::new("third"), &Map::new());

        let inputs: Vec<Value> = mem.with_cache(|c| {
            c.snapshot()
                .into_iter()
                .filter(|e| e.key.starts_with("input:"))
                .map(|e| e.content)
                .collect()
        });
        assert_eq!(inputs, vec![json!("first"), json!("second"), json!("third")]);
    }

    // ── concurrency ──────────────────────────────────────────────────────────

    #[test]
    fn concurrent_writers_and_readers_keep_invariants() {
        const WRITERS: usize = 4;
        const RECORDS_PER_WRITER: usize = 25;

        let mut config = MemoryConfig::default();
        config.episodic.max_episodes = 20;
        config.episodic.prune_slack = 5;
        config.associations.max_associations = 15;
        config.associations.prune_slack = 3;
        config.consolidation.every_n_records = 7;
        config.consolidation.min_pattern_size = 2;
        let mem = Arc::new(MemoryCoordinator::with_stores(
            ShortTermCache::new(7),
            EpisodicStore::open_in_memory().unwrap().with_limits(20, 5),
            AssociationGraph::new(&config.associations),
            config,
        ));

        let mut handles = Vec::new();
        for w in 0..WRITERS {
            let mem = Arc::clone(&mem);
            handles.push(thread::spawn(move || {
                let mut persisted = 0;
                for i in 0..RECORDS_PER_WRITER {
                    let (a, b) = (format!("c{}", (w + i) % 9), format!("c{}", (w * 3 + i + 1) % 9));
                    let p = Percept::new(format!("writer {w} turn {i}"))
                        .with_concepts(vec![Concept::new(&a, "entity", 0.9)])
                        .with_relationships(vec![Relationship::new(&a, &b, "seen_with", 0.8)])
                        .with_keywords(["turn"])
                        .with_intent("statement");
                    if mem.record(&p, &Map::new()).episode_id.is_some() {
                        persisted += 1;
                    }
                    if i % 10 == 9 {
                        mem.consolidate();
                    }
                }
                persisted
            }));
        }
        let reader = {
            let mem = Arc::clone(&mem);
            thread::spawn(move || {
                for i in 0..50 {
                    let cue = Percept::new("turn")
                        .with_concepts(vec![Concept::new(format!("c{}", i % 9), "entity", 0.9)])
                        .with_keywords(["turn"])
                        .with_sentiment(0.5);
                    assert!(mem.recall(&cue).len() <= 10);
                    let _ = mem.stats();
                }
            })
        };

        let persisted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        reader.join().unwrap();
        assert_eq!(persisted, WRITERS * RECORDS_PER_WRITER);

        // Every store above 20 rows drops back to 15, so 100 inserts end at
        // 15 + (100 − 21) mod 6.
        let stats = mem.stats();
        assert_eq!(stats.episodic.count, 15 + (WRITERS * RECORDS_PER_WRITER - 21) % 6);
        assert!(stats.working_memory.size <= 7);
        assert!(stats.associations.edges <= 15);

        let graph = mem.associations();
        let labels: Vec<String> = (0..9).map(|i| format!("c{i}")).collect();
        for label in labels.iter().filter(|l| graph.node(l).is_some()) {
            let connected = labels
                .iter()
                .any(|other| other != label && graph.association(label, other).is_some());
            assert!(connected, "{label} is isolated");
        }
    }

    // ── failure isolation ────────────────────────────────────────────────────

    #[test]
    fn broken_episodic_store_does_not_abort_turn() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig::with_data_dir(dir.path());
        let db_path = config.episodic.db_path.clone();
        let mem = MemoryCoordinator::open(config).unwrap();

        let saboteur = rusqlite::Connection::open(&db_path).unwrap();
        saboteur
            .execute_batch("DROP TABLE episode_tags; DROP TABLE episodes;")
            .unwrap();
        drop(saboteur);

        let outcome = mem.record(&dog_percept(), &Map::new());
        assert!(outcome.episode_id.is_none());
        assert_eq!(outcome.activation["dog"], 1.0);
        assert!(mem.with_cache(|c| c.peek("concept:dog").is_some()));

        let memories = mem.recall(&dog_percept());
        assert!(!memories.is_empty());
        assert!(memories.iter().all(|m| m.source != MemorySource::Episodic));

        let stats = mem.stats();
        assert_eq!(stats.episodic, EpisodicStats::default());
        assert!(stats.associations.edges > 0);

        let report = mem.consolidate();
        assert_eq!(report.episodes_scanned, 0);
        assert!(!report.saved);
    }

    // ── consolidation ────────────────────────────────────────────────────────

    #[test]
    fn counter_marks_consolidation_due() {
        let mut config = MemoryConfig::default();
        config.consolidation.every_n_records = 2;
        let mem = MemoryCoordinator::with_stores(
            ShortTermCache::new(7),
            EpisodicStore::open_in_memory().unwrap(),
            AssociationGraph::new(&config.associations),
            config,
        );
        mem.record(&Percept::new("one"), &Map::new());
        assert!(!mem.consolidation_due());
        assert!(mem.run_due_consolidation().is_none());
        mem.record(&Percept::new("two"), &Map::new());
        assert!(mem.consolidation_due());
        assert_eq!(mem.stats().records_since_consolidation, 0);

        let report = mem.run_due_consolidation().expect("ran");
        assert_eq!(report.episodes_scanned, 2);
        assert!(!mem.consolidation_due());
    }

    #[test]
    fn inline_consolidation_reinforces_patterns_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MemoryConfig::with_data_dir(dir.path());
        config.consolidation.every_n_records = 3;
        config.consolidation.inline = true;
        let mem = MemoryCoordinator::open(config).unwrap();

        for topic in ["bone", "ball", "leash"] {
            let p = Percept::new(format!("my dog likes the {topic}"))
                .with_concepts(vec![Concept::new(topic, "entity", 0.9)])
                .with_intent("statement");
            mem.record(&p, &Map::new());
        }

        assert!(!mem.consolidation_due());
        assert!(dir.path().join("associations.json").exists());
        let edge = mem.associations().association("ball", "leash").expect("pattern edge");
        assert!(edge.kind.starts_with("pattern_"));
        // 3 episodes / window 50, halved.
        assert!((edge.base_strength - 0.03).abs() < 1e-9);
    }

    // ── lifecycle ────────────────────────────────────────────────────────────

    #[test]
    fn shutdown_then_reopen_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig::with_data_dir(dir.path());
        let id = {
            let mem = MemoryCoordinator::open(config.clone()).unwrap();
            let id = mem.record(&dog_percept(), &Map::new()).episode_id.unwrap();
            mem.shutdown().unwrap();
            id
        };

        let mem = MemoryCoordinator::open(config).unwrap();
        assert!(mem.episodic().retrieve_episode(&id).unwrap().is_some());
        assert!(mem.associations().association("dog", "animal").is_some());
        // Working memory is not persisted.
        assert!(mem.with_cache(|c| c.is_empty()));

        let stats = mem.stats();
        assert_eq!(stats.episodic.count, 1);
        assert_eq!(stats.working_memory.capacity, 7);
    }
}
