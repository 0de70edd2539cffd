//! Association Graph.
//!
//! Weighted, undirected graph between concept labels.  Edges remember the
//! strength they were last reinforced to and *when*; the strength observed
//! by readers decays exponentially with the time since that reinforcement:
//!
//! ```text
//! effective = base_strength × exp(−λ × hours_since_last_reinforcement)
//! ```
//!
//! Decay is computed at read time and never written back, so the stored
//! `base_strength` and `last_reinforced_at` stay the only source of truth.
//!
//! ## Model
//!
//! * Nodes are keyed by label in a `BTreeMap`; a node exists only while at
//!   least one edge touches it.
//! * Edges are keyed by the canonical pair `(a, b)` with `a < b`.
//! * A neighbour index maps each label to the labels it shares an edge with.
//!
//! All three maps live behind one `RwLock`.  Queries that bump activation
//! statistics ([`AssociationGraph::associations_of`],
//! [`AssociationGraph::activate`]) take the write side.
//!
//! ## Pruning
//!
//! Once an insert pushes the edge count above `max_associations`, the
//! `edges − max + slack` edges with the lowest effective strength are
//! removed, followed by every node left without edges.
//!
//! # Example
//!
//! ```rust
//! use mnemo_memory::associations::AssociationGraph;
//! use mnemo_memory::config::AssociationConfig;
//!
//! let graph = AssociationGraph::new(&AssociationConfig::default());
//! graph.create_or_reinforce("dog", "animal", 0.9, "is_a").unwrap();
//! graph.create_or_reinforce("dog", "pet", 0.7, "role").unwrap();
//!
//! let activation = graph.activate(&["dog"]);
//! assert_eq!(activation["dog"], 1.0);
//! assert!((activation["animal"] - 0.45).abs() < 1e-6);
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use mnemo_types::clamp_unit;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AssociationConfig;

/// Neighbours fetched per seed during spreading activation.
const ACTIVATION_FANOUT: usize = 10;

/// Secondary activation is damped by this factor before merging.
const SECONDARY_DAMPING: f64 = 0.5;

/// Lower bound on effective strength when converting it to a path weight.
const PATH_STRENGTH_FLOOR: f64 = 0.01;

/// Clusters only follow edges at least this many times the threshold.
const CLUSTER_THRESHOLD_FACTOR: f64 = 1.5;

const SNAPSHOT_VERSION: u32 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from association graph operations.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid association: {0}")]
    InvalidAssociation(String),
    #[error("Edge count {count} exceeds limit {max} after pruning")]
    CapacityViolation { count: usize, max: usize },
}

// ─────────────────────────────────────────────────────────────────────────────
// Nodes and edges
// ─────────────────────────────────────────────────────────────────────────────

/// A concept endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptNode {
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub activation_count: u64,
    pub last_activated_at: Option<DateTime<Utc>>,
}

impl ConceptNode {
    fn new(label: &str, now: DateTime<Utc>) -> Self {
        Self {
            label: label.to_string(),
            created_at: now,
            activation_count: 0,
            last_activated_at: None,
        }
    }

    fn bump(&mut self, now: DateTime<Utc>) {
        self.activation_count += 1;
        self.last_activated_at = Some(now);
    }
}

/// An undirected edge, stored with `a < b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    pub a: String,
    pub b: String,
    /// Strength at the last reinforcement, in `[0.0, 1.0]`.
    pub base_strength: f64,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub last_reinforced_at: DateTime<Utc>,
    pub reinforcement_count: u64,
}

impl Association {
    /// Decayed strength as observed at `now` with decay rate `lambda` (per hour).
    pub fn effective_strength_at(&self, now: DateTime<Utc>, lambda: f64) -> f64 {
        let elapsed_ms = (now - self.last_reinforced_at).num_milliseconds().max(0);
        let hours = elapsed_ms as f64 / 3_600_000.0;
        self.base_strength * (-lambda * hours).exp()
    }
}

/// One neighbour as reported by [`AssociationGraph::associations_of`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssociatedConcept {
    pub concept: String,
    /// Effective (decayed) strength.
    pub strength: f64,
    pub kind: String,
    /// Seconds since the edge was created.
    pub age_seconds: f64,
    pub reinforcement_count: u64,
}

/// Structural figures for observability.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub avg_degree: f64,
    /// Mean local clustering coefficient (unweighted).
    pub clustering_coefficient: f64,
    pub connected_components: usize,
    pub density: f64,
}

#[derive(Serialize, Deserialize)]
struct GraphSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    nodes: Vec<ConceptNode>,
    associations: Vec<Association>,
}

fn canonical(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GraphState
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GraphState {
    nodes: BTreeMap<String, ConceptNode>,
    edges: BTreeMap<(String, String), Association>,
    adjacency: BTreeMap<String, BTreeSet<String>>,
}

impl GraphState {
    fn edge(&self, a: &str, b: &str) -> Option<&Association> {
        self.edges.get(&canonical(a, b))
    }

    fn insert_edge(&mut self, edge: Association) {
        self.adjacency.entry(edge.a.clone()).or_default().insert(edge.b.clone());
        self.adjacency.entry(edge.b.clone()).or_default().insert(edge.a.clone());
        self.edges.insert((edge.a.clone(), edge.b.clone()), edge);
    }

    fn remove_edge(&mut self, key: &(String, String)) {
        if self.edges.remove(key).is_none() {
            return;
        }
        for (from, to) in [(&key.0, &key.1), (&key.1, &key.0)] {
            if let Some(set) = self.adjacency.get_mut(from) {
                set.remove(to);
            }
        }
    }

    /// Remove nodes with no incident edge.  Returns how many were removed.
    fn remove_isolated(&mut self) -> usize {
        let isolated: Vec<String> = self
            .nodes
            .keys()
            .filter(|label| self.adjacency.get(*label).is_none_or(BTreeSet::is_empty))
            .cloned()
            .collect();
        for label in &isolated {
            self.nodes.remove(label);
            self.adjacency.remove(label);
        }
        isolated.len()
    }

    /// Neighbours of `concept` at or above `threshold`, strongest first.
    fn neighbours(
        &self,
        concept: &str,
        limit: usize,
        now: DateTime<Utc>,
        settings: &AssociationConfig,
    ) -> Vec<AssociatedConcept> {
        let Some(adjacent) = self.adjacency.get(concept) else {
            return Vec::new();
        };
        let mut found: Vec<AssociatedConcept> = adjacent
            .iter()
            .filter_map(|other| {
                let edge = self.edge(concept, other)?;
                let strength = edge.effective_strength_at(now, settings.decay_rate);
                (strength >= settings.threshold).then(|| AssociatedConcept {
                    concept: other.clone(),
                    strength,
                    kind: edge.kind.clone(),
                    age_seconds: (now - edge.created_at).num_milliseconds().max(0) as f64 / 1000.0,
                    reinforcement_count: edge.reinforcement_count,
                })
            })
            .collect();
        found.sort_by(|x, y| y.strength.total_cmp(&x.strength));
        found.truncate(limit);
        found
    }

    /// Drop the weakest edges once the count exceeds the limit.
    fn enforce_capacity(&mut self, now: DateTime<Utc>, settings: &AssociationConfig) -> usize {
        if self.edges.len() <= settings.max_associations {
            return 0;
        }
        let excess = self.edges.len() - settings.max_associations + settings.prune_slack;
        let mut ranked: Vec<((String, String), f64)> = self
            .edges
            .iter()
            .map(|(key, edge)| (key.clone(), edge.effective_strength_at(now, settings.decay_rate)))
            .collect();
        ranked.sort_by(|x, y| x.1.total_cmp(&y.1));

        let victims: Vec<_> = ranked.into_iter().take(excess).map(|(key, _)| key).collect();
        for key in &victims {
            self.remove_edge(key);
        }
        let nodes_removed = self.remove_isolated();
        debug!(edges_removed = victims.len(), nodes_removed, "pruned association graph");
        victims.len()
    }

    fn to_snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            nodes: self.nodes.values().cloned().collect(),
            associations: self.edges.values().cloned().collect(),
        }
    }

    /// Rebuild state from a snapshot, repairing anything that would break
    /// the graph invariants (orientation, self-loops, orphan nodes).
    fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let mut state = GraphState::default();
        for node in snapshot.nodes {
            if !node.label.is_empty() {
                state.nodes.insert(node.label.clone(), node);
            }
        }
        for mut edge in snapshot.associations {
            if edge.a.is_empty() || edge.b.is_empty() || edge.a == edge.b {
                continue;
            }
            if edge.a > edge.b {
                std::mem::swap(&mut edge.a, &mut edge.b);
            }
            edge.base_strength = clamp_unit(edge.base_strength);
            for label in [&edge.a, &edge.b] {
                if !state.nodes.contains_key(label) {
                    state.nodes.insert(label.clone(), ConceptNode::new(label, edge.created_at));
                }
            }
            state.insert_edge(edge);
        }
        state.remove_isolated();
        state
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Path search
// ─────────────────────────────────────────────────────────────────────────────

/// Min-heap entry for Dijkstra.
struct Frontier {
    cost: f64,
    label: String,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.label.cmp(&self.label))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AssociationGraph
// ─────────────────────────────────────────────────────────────────────────────

/// Concurrency-safe association graph with optional snapshot persistence.
#[derive(Debug)]
pub struct AssociationGraph {
    state: RwLock<GraphState>,
    settings: AssociationConfig,
    snapshot_path: Option<PathBuf>,
}

impl AssociationGraph {
    /// Empty, memory-only graph.  [`save`][Self::save] is a no-op until a
    /// snapshot path is set with [`with_snapshot_path`][Self::with_snapshot_path].
    pub fn new(config: &AssociationConfig) -> Self {
        let mut settings = config.clone();
        settings.max_associations = settings.max_associations.max(1);
        settings.prune_slack = settings.prune_slack.min(settings.max_associations - 1);
        Self {
            state: RwLock::new(GraphState::default()),
            settings,
            snapshot_path: None,
        }
    }

    /// Graph bound to `config.snapshot_path`, loaded from it when present.
    ///
    /// An unreadable snapshot is logged and the graph starts empty; the
    /// file is left untouched until the next save.
    pub fn open(config: &AssociationConfig) -> Self {
        let graph = Self::new(config).with_snapshot_path(&config.snapshot_path);
        match graph.load() {
            Ok(true) => info!(
                path = %config.snapshot_path.display(),
                nodes = graph.node_count(),
                edges = graph.edge_count(),
                "association graph loaded"
            ),
            Ok(false) => debug!(
                path = %config.snapshot_path.display(),
                "no association snapshot yet"
            ),
            Err(e) => warn!(
                path = %config.snapshot_path.display(),
                error = %e,
                "unreadable association snapshot, starting empty"
            ),
        }
        graph
    }

    pub fn with_snapshot_path(mut self, path: impl AsRef<Path>) -> Self {
        self.snapshot_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    pub fn settings(&self) -> &AssociationConfig {
        &self.settings
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── mutation ─────────────────────────────────────────────────────────────

    /// Create the edge `a — b` or reinforce it if it exists.
    ///
    /// A new edge starts at `strength`; an existing one moves to the mean of
    /// its base strength and `strength` and keeps its original kind.
    pub fn create_or_reinforce(
        &self,
        a: &str,
        b: &str,
        strength: f64,
        kind: &str,
    ) -> Result<(), GraphError> {
        self.create_or_reinforce_at(a, b, strength, kind, Utc::now())
    }

    /// [`create_or_reinforce`][Self::create_or_reinforce] with an explicit
    /// clock, used when replaying historical data.
    pub fn create_or_reinforce_at(
        &self,
        a: &str,
        b: &str,
        strength: f64,
        kind: &str,
        now: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        if a.is_empty() || b.is_empty() {
            return Err(GraphError::InvalidAssociation("empty concept label".into()));
        }
        if a == b {
            return Err(GraphError::InvalidAssociation(format!("self-association on {a:?}")));
        }
        let strength = clamp_unit(strength);
        let key = canonical(a, b);

        let mut state = self.write();
        for label in [a, b] {
            if !state.nodes.contains_key(label) {
                state.nodes.insert(label.to_string(), ConceptNode::new(label, now));
            }
        }
        match state.edges.get_mut(&key) {
            Some(edge) => {
                edge.base_strength = clamp_unit((edge.base_strength + strength) / 2.0);
                edge.reinforcement_count += 1;
                edge.last_reinforced_at = now;
                debug!(
                    a = %key.0,
                    b = %key.1,
                    strength = edge.base_strength,
                    "association reinforced"
                );
            }
            None => {
                state.insert_edge(Association {
                    a: key.0.clone(),
                    b: key.1.clone(),
                    base_strength: strength,
                    kind: kind.to_string(),
                    created_at: now,
                    last_reinforced_at: now,
                    reinforcement_count: 1,
                });
                debug!(a = %key.0, b = %key.1, strength, kind, "association created");
            }
        }

        state.enforce_capacity(now, &self.settings);
        if state.edges.len() > self.settings.max_associations {
            return Err(GraphError::CapacityViolation {
                count: state.edges.len(),
                max: self.settings.max_associations,
            });
        }
        Ok(())
    }

    /// Drop edges that decayed below `prune_floor`, then apply the capacity
    /// rule.  Returns the number of edges removed.
    pub fn prune(&self) -> usize {
        let now = Utc::now();
        let mut state = self.write();
        let faded: Vec<_> = state
            .edges
            .iter()
            .filter(|(_, e)| {
                e.effective_strength_at(now, self.settings.decay_rate) < self.settings.prune_floor
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &faded {
            state.remove_edge(key);
        }
        state.remove_isolated();
        let over_capacity = state.enforce_capacity(now, &self.settings);
        faded.len() + over_capacity
    }

    // ── queries ──────────────────────────────────────────────────────────────

    /// Neighbours of `concept` whose effective strength reaches the
    /// threshold, strongest first.  Counts as an activation of `concept`.
    pub fn associations_of(&self, concept: &str, limit: usize) -> Vec<AssociatedConcept> {
        let now = Utc::now();
        let mut state = self.write();
        let Some(node) = state.nodes.get_mut(concept) else {
            return Vec::new();
        };
        node.bump(now);
        state.neighbours(concept, limit, now, &self.settings)
    }

    /// One step of spreading activation from `concepts`.
    ///
    /// Known seeds get `1.0`; each neighbour gets the strongest edge
    /// strength reaching it from any seed, halved.  Unknown seeds are
    /// skipped.
    pub fn activate<S: AsRef<str>>(&self, concepts: &[S]) -> BTreeMap<String, f64> {
        let now = Utc::now();
        let mut state = self.write();

        let mut activation: BTreeMap<String, f64> = BTreeMap::new();
        for concept in concepts.iter().map(AsRef::as_ref) {
            if activation.contains_key(concept) {
                continue;
            }
            if let Some(node) = state.nodes.get_mut(concept) {
                node.bump(now);
                activation.insert(concept.to_string(), 1.0);
            }
        }

        let mut secondary: BTreeMap<String, f64> = BTreeMap::new();
        for seed in activation.keys() {
            for neighbour in state.neighbours(seed, ACTIVATION_FANOUT, now, &self.settings) {
                let propagated = activation[seed] * neighbour.strength;
                let slot = secondary.entry(neighbour.concept).or_insert(0.0);
                *slot = slot.max(propagated);
            }
        }
        for (concept, level) in secondary {
            activation.entry(concept).or_insert(level * SECONDARY_DAMPING);
        }
        activation
    }

    /// Weighted shortest path from `a` to `b` (edge weight
    /// `1 / max(effective, 0.01)`), or `None` when either end is unknown,
    /// they are disconnected, or the path needs more than `max_length` hops.
    pub fn shortest_path(&self, a: &str, b: &str, max_length: usize) -> Option<Vec<String>> {
        let now = Utc::now();
        let state = self.read();
        if !state.nodes.contains_key(a) || !state.nodes.contains_key(b) {
            return None;
        }
        if a == b {
            return Some(vec![a.to_string()]);
        }

        let mut dist: HashMap<String, f64> = HashMap::from([(a.to_string(), 0.0)]);
        let mut prev: HashMap<String, String> = HashMap::new();
        let mut heap = BinaryHeap::from([Frontier { cost: 0.0, label: a.to_string() }]);

        while let Some(Frontier { cost, label }) = heap.pop() {
            if label == b {
                break;
            }
            if dist.get(&label).is_some_and(|best| cost > *best) {
                continue;
            }
            let Some(adjacent) = state.adjacency.get(&label) else { continue };
            for next in adjacent {
                let Some(edge) = state.edge(&label, next) else { continue };
                let eff = edge.effective_strength_at(now, self.settings.decay_rate);
                let candidate = cost + 1.0 / eff.max(PATH_STRENGTH_FLOOR);
                if dist.get(next).is_none_or(|best| candidate < *best) {
                    dist.insert(next.clone(), candidate);
                    prev.insert(next.clone(), label.clone());
                    heap.push(Frontier { cost: candidate, label: next.clone() });
                }
            }
        }

        if !prev.contains_key(b) {
            return None;
        }
        let mut path = vec![b.to_string()];
        let mut cursor = b;
        while let Some(step) = prev.get(cursor) {
            path.push(step.clone());
            cursor = step;
        }
        path.reverse();
        (path.len() - 1 <= max_length).then_some(path)
    }

    /// Connected components over strong edges (effective ≥ 1.5 × threshold)
    /// with at least `min_size` members.  Members are sorted; clusters are
    /// ordered largest first, then by first label.
    pub fn clusters(&self, min_size: usize) -> Vec<Vec<String>> {
        let now = Utc::now();
        let state = self.read();
        let cutoff = self.settings.threshold * CLUSTER_THRESHOLD_FACTOR;

        let mut strong: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for edge in state.edges.values() {
            if edge.effective_strength_at(now, self.settings.decay_rate) >= cutoff {
                strong.entry(&edge.a).or_default().push(&edge.b);
                strong.entry(&edge.b).or_default().push(&edge.a);
            }
        }

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut clusters = Vec::new();
        for &start in strong.keys() {
            if !seen.insert(start) {
                continue;
            }
            let mut members = vec![start.to_string()];
            let mut queue = VecDeque::from([start]);
            while let Some(label) = queue.pop_front() {
                for &next in strong.get(label).into_iter().flatten() {
                    if seen.insert(next) {
                        members.push(next.to_string());
                        queue.push_back(next);
                    }
                }
            }
            if members.len() >= min_size {
                members.sort();
                clusters.push(members);
            }
        }
        clusters.sort_by(|x, y| y.len().cmp(&x.len()).then_with(|| x[0].cmp(&y[0])));
        clusters
    }

    pub fn node_count(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.read().edges.len()
    }

    pub fn node(&self, label: &str) -> Option<ConceptNode> {
        self.read().nodes.get(label).cloned()
    }

    pub fn association(&self, a: &str, b: &str) -> Option<Association> {
        self.read().edge(a, b).cloned()
    }

    pub fn stats(&self) -> GraphStats {
        let state = self.read();
        let nodes = state.nodes.len();
        if nodes == 0 {
            return GraphStats::default();
        }
        let edges = state.edges.len();

        let mut clustering_sum = 0.0;
        for label in state.nodes.keys() {
            let Some(adjacent) = state.adjacency.get(label) else { continue };
            let k = adjacent.len();
            if k < 2 {
                continue;
            }
            let neighbours: Vec<&String> = adjacent.iter().collect();
            let mut links = 0usize;
            for (i, x) in neighbours.iter().enumerate() {
                for y in &neighbours[i + 1..] {
                    if state.edge(x, y).is_some() {
                        links += 1;
                    }
                }
            }
            clustering_sum += 2.0 * links as f64 / (k * (k - 1)) as f64;
        }

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut components = 0;
        for start in state.nodes.keys() {
            if !seen.insert(start) {
                continue;
            }
            components += 1;
            let mut queue = VecDeque::from([start.as_str()]);
            while let Some(label) = queue.pop_front() {
                for next in state.adjacency.get(label).into_iter().flatten() {
                    if seen.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }

        GraphStats {
            nodes,
            edges,
            avg_degree: 2.0 * edges as f64 / nodes as f64,
            clustering_coefficient: clustering_sum / nodes as f64,
            connected_components: components,
            density: if nodes < 2 {
                0.0
            } else {
                2.0 * edges as f64 / (nodes * (nodes - 1)) as f64
            },
        }
    }

    // ── persistence ──────────────────────────────────────────────────────────

    /// Write a JSON snapshot atomically: `<path>.tmp` is written and synced,
    /// then renamed over the target.
    pub fn save(&self) -> Result<(), GraphError> {
        let Some(path) = &self.snapshot_path else {
            debug!("association graph has no snapshot path, skipping save");
            return Ok(());
        };
        let snapshot = self.read().to_snapshot();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        write_atomically(path, &bytes)?;
        info!(
            path = %path.display(),
            nodes = snapshot.nodes.len(),
            edges = snapshot.associations.len(),
            "association graph saved"
        );
        Ok(())
    }

    /// Replace the in-memory graph with the snapshot on disk.  Returns
    /// `Ok(false)` when there is no snapshot path or no file yet.
    pub fn load(&self) -> Result<bool, GraphError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }
        let raw = fs::read(path)?;
        let snapshot: GraphSnapshot = serde_json::from_slice(&raw)?;
        *self.write() = GraphState::from_snapshot(snapshot);
        Ok(true)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn graph() -> AssociationGraph {
        AssociationGraph::new(&AssociationConfig::default())
    }

    fn graph_with(max: usize, slack: usize) -> AssociationGraph {
        AssociationGraph::new(&AssociationConfig {
            max_associations: max,
            prune_slack: slack,
            ..AssociationConfig::default()
        })
    }

    // ── create / reinforce ───────────────────────────────────────────────────

    #[test]
    fn create_then_reinforce_averages_and_keeps_kind() {
        let g = graph();
        g.create_or_reinforce("dog", "animal", 0.9, "is_a").unwrap();
        g.create_or_reinforce("animal", "dog", 0.5, "other").unwrap();

        let edge = g.association("dog", "animal").unwrap();
        assert_eq!(edge.a, "animal");
        assert_eq!(edge.b, "dog");
        assert!((edge.base_strength - 0.7).abs() < 1e-12);
        assert_eq!(edge.reinforcement_count, 2);
        assert_eq!(edge.kind, "is_a");
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn rejects_self_and_empty_associations() {
        let g = graph();
        assert!(matches!(
            g.create_or_reinforce("dog", "dog", 0.5, "x"),
            Err(GraphError::InvalidAssociation(_))
        ));
        assert!(matches!(
            g.create_or_reinforce("", "dog", 0.5, "x"),
            Err(GraphError::InvalidAssociation(_))
        ));
        assert_eq!(g.node_count(), 0);
    }

    #[test]
    fn strength_is_clamped() {
        let g = graph();
        g.create_or_reinforce("a", "b", 3.0, "x").unwrap();
        assert_eq!(g.association("a", "b").unwrap().base_strength, 1.0);
    }

    // ── decay ────────────────────────────────────────────────────────────────

    #[test]
    fn effective_strength_is_monotone_in_time() {
        let g = graph();
        g.create_or_reinforce("a", "b", 0.8, "x").unwrap();
        let edge = g.association("a", "b").unwrap();
        let t0 = edge.last_reinforced_at;

        let mut previous = edge.effective_strength_at(t0, 0.01);
        assert!((previous - 0.8).abs() < 1e-12);
        for hours in [1, 5, 24, 24 * 7, 24 * 365] {
            let now = t0 + Duration::hours(hours);
            let current = edge.effective_strength_at(now, 0.01);
            assert!(current <= previous);
            previous = current;
        }
        let one_hour = edge.effective_strength_at(t0 + Duration::hours(1), 0.01);
        assert!((one_hour - 0.8 * (-0.01f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn decayed_edges_fall_below_threshold() {
        let g = graph();
        let long_ago = Utc::now() - Duration::hours(200);
        g.create_or_reinforce_at("old", "faded", 0.9, "x", long_ago).unwrap();
        g.create_or_reinforce("old", "fresh", 0.9, "x").unwrap();
        // 0.9 × e^-2 ≈ 0.12 < 0.5
        let assoc = g.associations_of("old", 10);
        assert_eq!(assoc.len(), 1);
        assert_eq!(assoc[0].concept, "fresh");
    }

    // ── associations_of / activate ───────────────────────────────────────────

    #[test]
    fn associations_of_sorted_and_bumps_stats() {
        let g = graph();
        g.create_or_reinforce("dog", "animal", 0.9, "is_a").unwrap();
        g.create_or_reinforce("dog", "pet", 0.7, "role").unwrap();
        g.create_or_reinforce("dog", "flea", 0.2, "has").unwrap();

        let assoc = g.associations_of("dog", 10);
        let names: Vec<_> = assoc.iter().map(|a| a.concept.as_str()).collect();
        assert_eq!(names, vec!["animal", "pet"]);
        assert_eq!(assoc[0].kind, "is_a");
        assert_eq!(g.node("dog").unwrap().activation_count, 1);
        assert_eq!(g.associations_of("dog", 1).len(), 1);
        assert!(g.associations_of("unknown", 10).is_empty());
    }

    #[test]
    fn activation_scenario() {
        let g = graph();
        g.create_or_reinforce("dog", "animal", 0.9, "is_a").unwrap();
        g.create_or_reinforce("dog", "pet", 0.7, "role").unwrap();

        let act = g.activate(&["dog"]);
        assert_eq!(act.len(), 3);
        assert_eq!(act["dog"], 1.0);
        assert!((act["animal"] - 0.45).abs() < 1e-6);
        assert!((act["pet"] - 0.35).abs() < 1e-6);
        assert_eq!(g.node("dog").unwrap().activation_count, 1);
        assert_eq!(g.node("animal").unwrap().activation_count, 0);
    }

    #[test]
    fn activation_takes_max_across_seeds_and_skips_unknown() {
        let g = graph();
        g.create_or_reinforce("cat", "pet", 0.6, "role").unwrap();
        g.create_or_reinforce("dog", "pet", 0.9, "role").unwrap();

        let act = g.activate(&["cat", "dog", "unicorn"]);
        assert!(!act.contains_key("unicorn"));
        assert!((act["pet"] - 0.45).abs() < 1e-6);
    }

    #[test]
    fn seeds_keep_full_activation_when_adjacent() {
        let g = graph();
        g.create_or_reinforce("a", "b", 0.9, "x").unwrap();
        let act = g.activate(&["a", "b"]);
        assert_eq!(act["a"], 1.0);
        assert_eq!(act["b"], 1.0);
    }

    // ── paths / clusters ─────────────────────────────────────────────────────

    #[test]
    fn path_respects_hop_limit() {
        let g = graph();
        g.create_or_reinforce("dog", "animal", 0.9, "is_a").unwrap();
        g.create_or_reinforce("animal", "living", 0.8, "is_a").unwrap();
        g.create_or_reinforce("living", "entity", 0.7, "is_a").unwrap();

        assert_eq!(
            g.shortest_path("dog", "entity", 3),
            Some(vec!["dog".into(), "animal".into(), "living".into(), "entity".into()])
        );
        assert_eq!(g.shortest_path("dog", "entity", 2), None);
        assert_eq!(g.shortest_path("dog", "dog", 0), Some(vec!["dog".to_string()]));
        assert_eq!(g.shortest_path("dog", "nowhere", 5), None);
    }

    #[test]
    fn path_prefers_strong_edges_over_fewer_hops() {
        let g = graph();
        g.create_or_reinforce("a", "z", 0.05, "weak").unwrap();
        g.create_or_reinforce("a", "m", 0.9, "strong").unwrap();
        g.create_or_reinforce("m", "z", 0.9, "strong").unwrap();
        // direct: 1/0.05 = 20; via m: 2/0.9 ≈ 2.2
        assert_eq!(
            g.shortest_path("a", "z", 4),
            Some(vec!["a".into(), "m".into(), "z".into()])
        );
    }

    #[test]
    fn disconnected_nodes_have_no_path() {
        let g = graph();
        g.create_or_reinforce("a", "b", 0.9, "x").unwrap();
        g.create_or_reinforce("c", "d", 0.9, "x").unwrap();
        assert_eq!(g.shortest_path("a", "d", 10), None);
    }

    #[test]
    fn clusters_follow_strong_edges_only() {
        let g = graph();
        for (a, b) in [("a", "b"), ("b", "c"), ("c", "a"), ("x", "y"), ("y", "z"), ("z", "w")] {
            g.create_or_reinforce(a, b, 0.9, "x").unwrap();
        }
        g.create_or_reinforce("c", "x", 0.6, "weak").unwrap();
        g.create_or_reinforce("p", "q", 0.9, "x").unwrap();

        let clusters = g.clusters(3);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0], vec!["w", "x", "y", "z"]);
        assert_eq!(clusters[1], vec!["a", "b", "c"]);
    }

    // ── pruning ──────────────────────────────────────────────────────────────

    #[test]
    fn edge_count_never_exceeds_limit() {
        let g = graph_with(10, 3);
        for i in 0..60 {
            let strength = (i % 9) as f64 / 10.0;
            g.create_or_reinforce(&format!("n{i}"), &format!("n{}", i + 1), strength, "x")
                .unwrap();
            assert!(g.edge_count() <= 10);
        }
    }

    #[test]
    fn pruning_removes_weakest_then_isolated_nodes() {
        let g = graph_with(3, 1);
        g.create_or_reinforce("hub", "a", 0.9, "x").unwrap();
        g.create_or_reinforce("hub", "b", 0.8, "x").unwrap();
        g.create_or_reinforce("lone1", "lone2", 0.1, "x").unwrap();
        // Fourth edge: 4 > 3 ⇒ remove 4 − 3 + 1 = 2 weakest.
        g.create_or_reinforce("hub", "c", 0.2, "x").unwrap();

        assert_eq!(g.edge_count(), 2);
        assert!(g.node("lone1").is_none());
        assert!(g.node("lone2").is_none());
        assert!(g.node("c").is_none());
        assert!(g.association("hub", "a").is_some());
        let stats = g.stats();
        assert_eq!(stats.nodes, 3);
    }

    #[test]
    fn prune_drops_faded_edges() {
        let g = graph();
        let ancient = Utc::now() - Duration::hours(1000);
        g.create_or_reinforce_at("old", "gone", 0.9, "x", ancient).unwrap();
        g.create_or_reinforce("kept", "alive", 0.9, "x").unwrap();

        assert_eq!(g.prune(), 1);
        assert_eq!(g.edge_count(), 1);
        assert!(g.node("old").is_none());
        assert!(g.node("kept").is_some());
    }

    // ── stats ────────────────────────────────────────────────────────────────

    #[test]
    fn stats_of_triangle_plus_pendant() {
        let g = graph();
        g.create_or_reinforce("a", "b", 0.9, "x").unwrap();
        g.create_or_reinforce("b", "c", 0.9, "x").unwrap();
        g.create_or_reinforce("c", "a", 0.9, "x").unwrap();
        g.create_or_reinforce("c", "d", 0.9, "x").unwrap();

        let s = g.stats();
        assert_eq!(s.nodes, 4);
        assert_eq!(s.edges, 4);
        assert!((s.avg_degree - 2.0).abs() < 1e-12);
        // a: 1, b: 1, c: 1/3, d: 0
        assert!((s.clustering_coefficient - (7.0 / 3.0) / 4.0).abs() < 1e-12);
        assert_eq!(s.connected_components, 1);
        assert!((s.density - 4.0 / 6.0).abs() < 1e-12);
        assert_eq!(graph().stats(), GraphStats::default());
    }

    // ── persistence ──────────────────────────────────────────────────────────

    #[test]
    fn save_then_open_restores_graph() {
        let dir = tempfile::tempdir().unwrap();
        let config = AssociationConfig {
            snapshot_path: dir.path().join("graph").join("associations.json"),
            ..AssociationConfig::default()
        };
        let g = AssociationGraph::open(&config);
        g.create_or_reinforce("dog", "animal", 0.9, "is_a").unwrap();
        g.create_or_reinforce("dog", "animal", 0.7, "is_a").unwrap();
        g.save().unwrap();

        let mut tmp = config.snapshot_path.as_os_str().to_owned();
        tmp.push(".tmp");
        assert!(!PathBuf::from(tmp).exists());

        let reopened = AssociationGraph::open(&config);
        let edge = reopened.association("animal", "dog").unwrap();
        assert_eq!(edge.reinforcement_count, 2);
        assert!((edge.base_strength - 0.8).abs() < 1e-12);
        assert_eq!(reopened.node_count(), 2);
    }

    #[test]
    fn corrupt_snapshot_starts_empty_and_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("associations.json");
        fs::write(&path, b"{ not json").unwrap();
        let config = AssociationConfig {
            snapshot_path: path.clone(),
            ..AssociationConfig::default()
        };

        let g = AssociationGraph::open(&config);
        assert_eq!(g.node_count(), 0);
        assert_eq!(fs::read(&path).unwrap(), b"{ not json");
        assert!(matches!(g.load(), Err(GraphError::Json(_))));
    }

    #[test]
    fn save_without_path_is_noop() {
        let g = graph();
        g.create_or_reinforce("a", "b", 0.9, "x").unwrap();
        g.save().unwrap();
        assert!(!g.load().unwrap());
        assert_eq!(g.edge_count(), 1);
    }
}
