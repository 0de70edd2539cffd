//! Memory consolidation.
//!
//! Mines a window of recent episodes for tags that recur often enough to be
//! a *pattern*, then reinforces associations between the concepts recorded
//! in those episodes.  [`find_patterns`] and [`reinforce_patterns`] are pure
//! building blocks; [`crate::coordinator::MemoryCoordinator::consolidate`]
//! strings them together with pruning and a snapshot save.
//!
//! [`ConsolidationScheduler`] drives due consolidations from a tokio task so
//! they never run on a request-handling thread.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::associations::{AssociationGraph, GraphError};
use crate::coordinator::MemoryCoordinator;
use crate::episodic::Episode;

/// Pattern strength is scaled by this before reinforcing concept pairs.
const PATTERN_REINFORCEMENT_SCALE: f64 = 0.5;

// ─────────────────────────────────────────────────────────────────────────────
// Pattern mining
// ─────────────────────────────────────────────────────────────────────────────

/// A tag shared by enough recent episodes to count as a pattern.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagPattern {
    pub tag: String,
    pub episode_ids: Vec<String>,
    /// `episodes carrying the tag / window size`.
    pub strength: f64,
    /// Distinct concept names recorded in those episodes, first-seen order.
    pub concepts: Vec<String>,
}

/// Outcome of one consolidation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsolidationReport {
    pub started_at: Option<DateTime<Utc>>,
    pub episodes_scanned: usize,
    pub patterns: Vec<TagPattern>,
    pub associations_reinforced: usize,
    pub edges_pruned: usize,
    pub saved: bool,
}

/// Group `episodes` by tag and keep tags carried by at least `min_size` of
/// them.  Strength is measured against `window`, the nominal batch size.
///
/// Patterns come back ordered by tag.
pub fn find_patterns(episodes: &[Episode], window: usize, min_size: usize) -> Vec<TagPattern> {
    let window = window.max(1) as f64;
    let mut groups: BTreeMap<&str, Vec<&Episode>> = BTreeMap::new();
    for episode in episodes {
        for tag in &episode.tags {
            groups.entry(tag).or_default().push(episode);
        }
    }

    groups
        .into_iter()
        .filter(|(_, members)| members.len() >= min_size.max(1))
        .map(|(tag, members)| {
            let mut concepts: Vec<String> = Vec::new();
            for episode in &members {
                for name in concepts_in(&episode.content) {
                    if !concepts.contains(&name) {
                        concepts.push(name);
                    }
                }
            }
            TagPattern {
                tag: tag.to_string(),
                episode_ids: members.iter().map(|e| e.id.clone()).collect(),
                strength: members.len() as f64 / window,
                concepts,
            }
        })
        .collect()
}

/// Concept names stored under `content.concepts[].name`.
pub fn concepts_in(content: &Value) -> Vec<String> {
    content
        .get("concepts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| c.get("name").and_then(Value::as_str))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pairwise-reinforce every pattern's concepts at `strength × 0.5` with
/// kind `pattern_<tag>`.  Returns the number of reinforcements applied.
pub fn reinforce_patterns(
    graph: &AssociationGraph,
    patterns: &[TagPattern],
) -> Result<usize, GraphError> {
    let mut applied = 0;
    for pattern in patterns {
        let strength = pattern.strength * PATTERN_REINFORCEMENT_SCALE;
        let kind = format!("pattern_{}", pattern.tag);
        for (i, a) in pattern.concepts.iter().enumerate() {
            for b in &pattern.concepts[i + 1..] {
                graph.create_or_reinforce(a, b, strength, &kind)?;
                applied += 1;
            }
        }
        debug!(
            tag = %pattern.tag,
            concepts = pattern.concepts.len(),
            strength,
            "pattern reinforced"
        );
    }
    Ok(applied)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Background driver for due consolidations.
pub struct ConsolidationScheduler;

impl ConsolidationScheduler {
    /// Spawn the scheduler on the current tokio runtime.
    ///
    /// Every `interval` it checks [`MemoryCoordinator::consolidation_due`] and,
    /// if set, runs the consolidation on the blocking pool.
    pub fn spawn(coordinator: Arc<MemoryCoordinator>, interval: Duration) -> ConsolidationHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "consolidation scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !coordinator.consolidation_due() {
                            continue;
                        }
                        let worker = Arc::clone(&coordinator);
                        let run =
                            tokio::task::spawn_blocking(move || worker.run_due_consolidation());
                        match run.await {
                            Ok(Some(report)) => debug!(
                                patterns = report.patterns.len(),
                                reinforced = report.associations_reinforced,
                                "scheduled consolidation finished"
                            ),
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "consolidation task failed"),
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("consolidation scheduler stopped");
        });
        ConsolidationHandle { stop: stop_tx, task }
    }
}

/// Handle to a running [`ConsolidationScheduler`].
pub struct ConsolidationHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsolidationHandle {
    /// Signal the scheduler to stop and wait for it.  A consolidation already
    /// running on the blocking pool is allowed to finish first.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "consolidation scheduler ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
