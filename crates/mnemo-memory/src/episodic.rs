//! Episodic Memory Store.
//!
//! Persists discrete episodes (one per recorded interaction) to a local
//! SQLite database and answers multi-predicate ranked searches over them.
//!
//! # Storage layout
//!
//! | table          | column            | type    | description                              |
//! |----------------|-------------------|---------|------------------------------------------|
//! | `episodes`     | id                | TEXT    | primary key                              |
//! |                | content           | TEXT    | JSON payload                             |
//! |                | context           | TEXT    | JSON object (session context snapshot)   |
//! |                | created_at        | TEXT    | RFC-3339 UTC, fixed microsecond width    |
//! |                | emotional_valence | REAL    | `[-1, 1]`                                |
//! |                | importance        | REAL    | `[0, 1]`                                 |
//! |                | tags              | TEXT    | JSON array, sorted                       |
//! |                | access_count      | INTEGER |                                          |
//! |                | last_access_at    | TEXT    | RFC-3339 UTC or NULL                     |
//! |                | search_text       | TEXT    | lower-cased string values, for search   |
//! | `episode_tags` | episode_id, tag   | TEXT    | one row per tag, indexed on `tag`        |
//!
//! Timestamps share one fixed-width format so they order lexicographically.
//! Text search runs over `search_text`, so JSON field names and embedded
//! timestamps never match a query.
//! Every mutating call runs in a single transaction with `synchronous =
//! FULL`, so an episode is durable once `store_episode` returns and a crash
//! never leaves a half-written row or a half-applied prune.
//!
//! # Pruning
//!
//! Once a store pushes the row count above `max_episodes`, the
//! `count − max_episodes + prune_slack` least important rows (oldest first
//! among equals) are deleted in the same transaction.
//!
//! # Example
//!
//! ```rust
//! use mnemo_memory::episodic::{EpisodeQuery, EpisodicStore, NewEpisode};
//! use serde_json::json;
//!
//! let store = EpisodicStore::open_in_memory().unwrap();
//! store
//!     .store_episode(&NewEpisode::new("ep-1", json!({"text": "hello"})).with_tags(["greeting"]))
//!     .unwrap();
//!
//! let hits = store.search(&EpisodeQuery::new().tags(["greeting"]), 10).unwrap();
//! assert_eq!(hits[0].id, "ep-1");
//! ```

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use mnemo_types::{clamp_signed, clamp_unit};
use rusqlite::{Connection, OptionalExtension, ToSql, Transaction, params, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::EpisodicConfig;

/// Episodes further apart than this get no temporal-similarity credit.
const SIMILARITY_TIME_HORIZON_SECS: f64 = 30.0 * 24.0 * 3600.0;

/// Half-width of the valence window used to gather similarity candidates.
const SIMILARITY_VALENCE_WINDOW: f64 = 0.3;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from episodic memory operations.
#[derive(Error, Debug)]
pub enum EpisodicError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt episode row: {0}")]
    Corrupt(String),
    #[error("Episodic store lock poisoned")]
    Poisoned,
    #[error("Episode count {count} exceeds limit {max} after pruning")]
    CapacityViolation { count: usize, max: usize },
}

// ─────────────────────────────────────────────────────────────────────────────
// Episode
// ─────────────────────────────────────────────────────────────────────────────

/// One persisted interaction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub content: Value,
    pub created_at: DateTime<Utc>,
    pub context_snapshot: Map<String, Value>,
    /// In `[-1.0, 1.0]`.
    pub emotional_valence: f64,
    /// In `[0.0, 1.0]`.
    pub importance: f64,
    pub tags: BTreeSet<String>,
    pub access_count: u64,
    pub last_access_at: Option<DateTime<Utc>>,
}

/// Input to [`EpisodicStore::store_episode`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewEpisode {
    pub id: String,
    pub content: Value,
    pub context: Map<String, Value>,
    pub emotional_valence: f64,
    pub importance: f64,
    pub tags: BTreeSet<String>,
    /// Creation time; `None` means "now".  Ignored when the id already exists.
    pub recorded_at: Option<DateTime<Utc>>,
}

impl NewEpisode {
    /// A neutral episode (valence 0, importance 0.5, no tags, empty context).
    pub fn new(id: impl Into<String>, content: Value) -> Self {
        Self {
            id: id.into(),
            content,
            context: Map::new(),
            emotional_valence: 0.0,
            importance: 0.5,
            tags: BTreeSet::new(),
            recorded_at: None,
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_valence(mut self, valence: f64) -> Self {
        self.emotional_valence = valence;
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn recorded_at(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = Some(at);
        self
    }
}

/// Predicates for [`EpisodicStore::search`].  Every predicate that is set
/// must hold (logical AND); an empty query matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeQuery {
    /// Case-insensitive (Unicode) substring of any string value in the
    /// content or context.  Object keys and RFC-3339 timestamps are ignored.
    pub text: Option<String>,
    /// Matches episodes sharing at least one of these tags.
    pub tags: Vec<String>,
    /// Inclusive valence bounds.
    pub valence_range: Option<(f64, f64)>,
    /// Inclusive lower importance bound.
    pub importance_min: Option<f64>,
    /// Inclusive creation-time bounds.
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl EpisodeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn valence_range(mut self, low: f64, high: f64) -> Self {
        self.valence_range = Some((low.min(high), low.max(high)));
        self
    }

    pub fn importance_min(mut self, min: f64) -> Self {
        self.importance_min = Some(min);
        self
    }

    pub fn time_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.time_range = Some((from.min(to), from.max(to)));
        self
    }
}

/// Aggregate figures for observability.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EpisodicStats {
    pub count: usize,
    pub avg_importance: f64,
    pub avg_valence: f64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub max_episodes: usize,
    pub utilization: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Similarity
// ─────────────────────────────────────────────────────────────────────────────

/// Weighted similarity in `[0, 1]` between two episodes.
///
/// `0.4 · tag Jaccard + 0.3 · valence closeness + 0.2 · importance closeness
/// + 0.1 · temporal closeness (30-day horizon)`.
pub fn similarity(a: &Episode, b: &Episode) -> f64 {
    let tag_score = if a.tags.is_empty() || b.tags.is_empty() {
        0.0
    } else {
        let common = a.tags.intersection(&b.tags).count() as f64;
        let all = a.tags.union(&b.tags).count() as f64;
        common / all
    };
    let valence_score = (1.0 - (a.emotional_valence - b.emotional_valence).abs()).max(0.0);
    let importance_score = (1.0 - (a.importance - b.importance).abs()).max(0.0);
    let dt_secs = (a.created_at - b.created_at).num_milliseconds().abs() as f64 / 1000.0;
    let time_score = 1.0 - (dt_secs / SIMILARITY_TIME_HORIZON_SECS).min(1.0);

    0.4 * tag_score + 0.3 * valence_score + 0.2 * importance_score + 0.1 * time_score
}

// ─────────────────────────────────────────────────────────────────────────────
// EpisodicStore
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed episodic memory store.
///
/// The connection sits behind a mutex, so every call (reads included) is
/// serialised against writes on this store.
pub struct EpisodicStore {
    conn: Mutex<Connection>,
    max_episodes: usize,
    prune_slack: usize,
}

impl EpisodicStore {
    /// Open (or create) a persistent database at `path`, creating parent
    /// directories as needed.  Uses default limits.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EpisodicError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::from_connection(Connection::open(path)?)?;
        info!(path = %path.display(), episodes = store.count()?, "episodic store opened");
        Ok(store)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, EpisodicError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open the database named by `config` and apply its limits.
    pub fn from_config(config: &EpisodicConfig) -> Result<Self, EpisodicError> {
        Ok(Self::open(&config.db_path)?.with_limits(config.max_episodes, config.prune_slack))
    }

    /// Set the row limit and pruning slack.  Slack is clamped below the limit.
    pub fn with_limits(mut self, max_episodes: usize, prune_slack: usize) -> Self {
        self.max_episodes = max_episodes.max(1);
        self.prune_slack = prune_slack.min(self.max_episodes - 1);
        self
    }

    fn from_connection(conn: Connection) -> Result<Self, EpisodicError> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS episodes (
                id                TEXT NOT NULL PRIMARY KEY,
                content           TEXT NOT NULL,
                context           TEXT NOT NULL,
                created_at        TEXT NOT NULL,
                emotional_valence REAL NOT NULL,
                importance        REAL NOT NULL,
                tags              TEXT NOT NULL,
                access_count      INTEGER NOT NULL DEFAULT 0,
                last_access_at    TEXT,
                search_text       TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_episodes_created_at ON episodes(created_at);
            CREATE INDEX IF NOT EXISTS idx_episodes_importance ON episodes(importance);
            CREATE INDEX IF NOT EXISTS idx_episodes_valence ON episodes(emotional_valence);
            CREATE TABLE IF NOT EXISTS episode_tags (
                episode_id TEXT NOT NULL,
                tag        TEXT NOT NULL,
                PRIMARY KEY (episode_id, tag)
            );
            CREATE INDEX IF NOT EXISTS idx_episode_tags_tag ON episode_tags(tag);",
        )?;
        add_search_text_column(&conn)?;
        let defaults = EpisodicConfig::default();
        Ok(Self {
            conn: Mutex::new(conn),
            max_episodes: defaults.max_episodes,
            prune_slack: defaults.prune_slack,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, EpisodicError> {
        self.conn.lock().map_err(|_| EpisodicError::Poisoned)
    }

    pub fn max_episodes(&self) -> usize {
        self.max_episodes
    }

    /// Insert or update an episode, then prune if over the limit.
    ///
    /// On an existing id the content, context, valence, importance and tags
    /// are replaced; creation time and access statistics are kept.
    pub fn store_episode(&self, episode: &NewEpisode) -> Result<(), EpisodicError> {
        let tags: Vec<&String> = episode.tags.iter().filter(|t| !t.is_empty()).collect();
        let created_at = episode.recorded_at.unwrap_or_else(Utc::now);

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO episodes (
                 id, content, context, created_at, emotional_valence,
                 importance, tags, access_count, last_access_at, search_text
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 content = excluded.content,
                 context = excluded.context,
                 emotional_valence = excluded.emotional_valence,
                 importance = excluded.importance,
                 tags = excluded.tags,
                 search_text = excluded.search_text",
            params![
                episode.id,
                serde_json::to_string(&episode.content)?,
                serde_json::to_string(&episode.context)?,
                format_ts(created_at),
                clamp_signed(episode.emotional_valence),
                clamp_unit(episode.importance),
                serde_json::to_string(&tags)?,
                search_text(&episode.content, &episode.context),
            ],
        )?;
        tx.execute("DELETE FROM episode_tags WHERE episode_id = ?1", params![episode.id])?;
        {
            let mut insert_tag =
                tx.prepare("INSERT OR IGNORE INTO episode_tags (episode_id, tag) VALUES (?1, ?2)")?;
            for tag in &tags {
                insert_tag.execute(params![episode.id, tag])?;
            }
        }
        let pruned = self.prune_within(&tx)?;
        tx.commit()?;

        debug!(id = %episode.id, tags = tags.len(), pruned, "episode stored");
        Ok(())
    }

    /// Fetch an episode by id, counting the access.  The returned record
    /// already reflects the bumped statistics.
    pub fn retrieve_episode(&self, id: &str) -> Result<Option<Episode>, EpisodicError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE episodes SET access_count = access_count + 1, last_access_at = ?1 WHERE id = ?2",
            params![format_ts(Utc::now()), id],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        let row = tx
            .query_row(
                &format!("SELECT {EPISODE_COLUMNS} FROM episodes e WHERE e.id = ?1"),
                params![id],
                EpisodeRow::from_row,
            )
            .optional()?;
        tx.commit()?;
        row.map(EpisodeRow::into_episode).transpose()
    }

    /// Ranked search: every set predicate must hold; results are ordered by
    /// importance (desc) then recency (desc).  Returned episodes have their
    /// access statistics bumped.
    pub fn search(
        &self,
        query: &EpisodeQuery,
        limit: usize,
    ) -> Result<Vec<Episode>, EpisodicError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut episodes = query_episodes(&tx, query, limit)?;

        let now = Utc::now();
        {
            let mut bump = tx.prepare(
                "UPDATE episodes SET access_count = access_count + 1, last_access_at = ?1 WHERE id = ?2",
            )?;
            let stamp = format_ts(now);
            for episode in &mut episodes {
                bump.execute(params![stamp, episode.id])?;
                episode.access_count += 1;
                episode.last_access_at = Some(now);
            }
        }
        tx.commit()?;
        Ok(episodes)
    }

    /// The `count` most recently created episodes, newest first.
    pub fn recent_episodes(&self, count: usize) -> Result<Vec<Episode>, EpisodicError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EPISODE_COLUMNS} FROM episodes e
             ORDER BY e.created_at DESC, e.rowid DESC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![to_sql_limit(count)], EpisodeRow::from_row)?;
        collect_episodes(rows)
    }

    /// Episodes resembling `reference`, most similar first.
    ///
    /// Candidates are the union of a tag-overlap query and a ±0.3 valence
    /// window (each capped at `2 × limit`); the reference itself is
    /// excluded.  Candidate gathering does not count as an access.
    pub fn similar_to(
        &self,
        reference: &Episode,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<(Episode, f64)>, EpisodicError> {
        let fetch = limit.saturating_mul(2);
        let mut candidates = Vec::new();
        {
            let conn = self.lock()?;
            if !reference.tags.is_empty() {
                let q = EpisodeQuery::new().tags(reference.tags.iter().cloned());
                candidates.extend(query_episodes(&conn, &q, fetch)?);
            }
            let v = reference.emotional_valence;
            let q = EpisodeQuery::new()
                .valence_range(v - SIMILARITY_VALENCE_WINDOW, v + SIMILARITY_VALENCE_WINDOW);
            candidates.extend(query_episodes(&conn, &q, fetch)?);
        }

        let mut seen = HashSet::new();
        let mut scored: Vec<(Episode, f64)> = candidates
            .into_iter()
            .filter(|e| e.id != reference.id && seen.insert(e.id.clone()))
            .map(|e| {
                let score = similarity(reference, &e);
                (e, score)
            })
            .filter(|(_, score)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Remove one episode.  Returns `true` if it existed.
    pub fn delete_episode(&self, id: &str) -> Result<bool, EpisodicError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM episode_tags WHERE episode_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM episodes WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn count(&self) -> Result<usize, EpisodicError> {
        let conn = self.lock()?;
        count_rows(&conn)
    }

    pub fn stats(&self) -> Result<EpisodicStats, EpisodicError> {
        let conn = self.lock()?;
        let (count, avg_importance, avg_valence, oldest, newest) = conn.query_row(
            "SELECT COUNT(*), AVG(importance), AVG(emotional_valence), MIN(created_at), MAX(created_at)
             FROM episodes",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )?;
        let count = count.max(0) as usize;
        Ok(EpisodicStats {
            count,
            avg_importance: avg_importance.unwrap_or(0.0),
            avg_valence: avg_valence.unwrap_or(0.0),
            oldest: oldest.as_deref().map(parse_ts).transpose()?,
            newest: newest.as_deref().map(parse_ts).transpose()?,
            max_episodes: self.max_episodes,
            utilization: count as f64 / self.max_episodes as f64,
        })
    }

    /// Delete the least important (then oldest) rows once over the limit.
    fn prune_within(&self, tx: &Transaction<'_>) -> Result<usize, EpisodicError> {
        let count = count_rows(tx)?;
        if count <= self.max_episodes {
            return Ok(0);
        }
        let excess = count - self.max_episodes + self.prune_slack;
        let victims = "SELECT id FROM episodes
                       ORDER BY importance ASC, created_at ASC, id ASC
                       LIMIT ?1";
        tx.execute(
            &format!("DELETE FROM episode_tags WHERE episode_id IN ({victims})"),
            params![to_sql_limit(excess)],
        )?;
        let removed = tx.execute(
            &format!("DELETE FROM episodes WHERE id IN ({victims})"),
            params![to_sql_limit(excess)],
        )?;

        let remaining = count_rows(tx)?;
        if remaining > self.max_episodes {
            return Err(EpisodicError::CapacityViolation {
                count: remaining,
                max: self.max_episodes,
            });
        }
        info!(removed, remaining, max = self.max_episodes, "pruned episodic store");
        Ok(removed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Query helpers
// ─────────────────────────────────────────────────────────────────────────────

const EPISODE_COLUMNS: &str = "e.id, e.content, e.context, e.created_at, e.emotional_valence, \
                               e.importance, e.tags, e.access_count, e.last_access_at";

fn query_episodes(
    conn: &Connection,
    query: &EpisodeQuery,
    limit: usize,
) -> Result<Vec<Episode>, EpisodicError> {
    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(text) = query.text.as_deref().filter(|t| !t.is_empty()) {
        let pattern = format!("%{}%", escape_like(&text.to_lowercase()));
        conditions.push("e.search_text LIKE ? ESCAPE '\\'".into());
        values.push(Box::new(pattern));
    }

    if !query.tags.is_empty() {
        let placeholders = vec!["?"; query.tags.len()].join(", ");
        conditions.push(format!(
            "EXISTS (SELECT 1 FROM episode_tags t WHERE t.episode_id = e.id AND t.tag IN ({placeholders}))"
        ));
        for tag in &query.tags {
            values.push(Box::new(tag.clone()));
        }
    }

    if let Some((low, high)) = query.valence_range {
        conditions.push("e.emotional_valence BETWEEN ? AND ?".into());
        values.push(Box::new(low));
        values.push(Box::new(high));
    }

    if let Some(min) = query.importance_min {
        conditions.push("e.importance >= ?".into());
        values.push(Box::new(min));
    }

    if let Some((from, to)) = query.time_range {
        conditions.push("e.created_at BETWEEN ? AND ?".into());
        values.push(Box::new(format_ts(from)));
        values.push(Box::new(format_ts(to)));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    values.push(Box::new(to_sql_limit(limit)));

    let sql = format!(
        "SELECT {EPISODE_COLUMNS} FROM episodes e
         {where_clause}
         ORDER BY e.importance DESC, e.created_at DESC, e.rowid DESC
         LIMIT ?"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), EpisodeRow::from_row)?;
    collect_episodes(rows)
}

fn collect_episodes(
    rows: impl Iterator<Item = rusqlite::Result<EpisodeRow>>,
) -> Result<Vec<Episode>, EpisodicError> {
    let mut episodes = Vec::new();
    for row in rows {
        episodes.push(row?.into_episode()?);
    }
    Ok(episodes)
}

fn count_rows(conn: &Connection) -> Result<usize, EpisodicError> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get(0))?;
    Ok(n.max(0) as usize)
}

/// Lower-cased string values of `content` and `context`, one per line.
fn search_text(content: &Value, context: &Map<String, Value>) -> String {
    let mut leaves = Vec::new();
    collect_strings(content, &mut leaves);
    for value in context.values() {
        collect_strings(value, &mut leaves);
    }
    leaves.join("\n").to_lowercase()
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) if DateTime::parse_from_rfc3339(s).is_err() => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Databases created before `search_text` existed get the column and a
/// backfill on open.
fn add_search_text_column(conn: &Connection) -> Result<(), EpisodicError> {
    let present = conn
        .prepare("SELECT 1 FROM pragma_table_info('episodes') WHERE name = 'search_text'")?
        .exists([])?;
    if present {
        return Ok(());
    }
    conn.execute_batch("ALTER TABLE episodes ADD COLUMN search_text TEXT NOT NULL DEFAULT ''")?;
    let rows: Vec<(String, String, String)> = conn
        .prepare("SELECT id, content, context FROM episodes")?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<_>>()?;
    let mut update = conn.prepare("UPDATE episodes SET search_text = ?1 WHERE id = ?2")?;
    for (id, content, context) in &rows {
        let content: Value = serde_json::from_str(content)?;
        let context: Map<String, Value> = serde_json::from_str(context)?;
        update.execute(params![search_text(&content, &context), id])?;
    }
    info!(rows = rows.len(), "added search_text column to episodic store");
    Ok(())
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn to_sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, EpisodicError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EpisodicError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

/// Intermediate struct for reading from SQLite.
struct EpisodeRow {
    id: String,
    content: String,
    context: String,
    created_at: String,
    emotional_valence: f64,
    importance: f64,
    tags: String,
    access_count: i64,
    last_access_at: Option<String>,
}

impl EpisodeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content: row.get(1)?,
            context: row.get(2)?,
            created_at: row.get(3)?,
            emotional_valence: row.get(4)?,
            importance: row.get(5)?,
            tags: row.get(6)?,
            access_count: row.get(7)?,
            last_access_at: row.get(8)?,
        })
    }

    fn into_episode(self) -> Result<Episode, EpisodicError> {
        Ok(Episode {
            content: serde_json::from_str(&self.content)?,
            context_snapshot: serde_json::from_str(&self.context)?,
            created_at: parse_ts(&self.created_at)?,
            emotional_valence: self.emotional_valence,
            importance: self.importance,
            tags: serde_json::from_str(&self.tags)?,
            access_count: self.access_count.max(0) as u64,
            last_access_at: self.last_access_at.as_deref().map(parse_ts).transpose()?,
            id: self.id,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
