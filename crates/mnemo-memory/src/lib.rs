//! `mnemo-memory` – The Memory Engine.
//!
//! Gives an agent short-term context, durable episodic recall and a decaying
//! associative network between concepts, all fused behind one coordinator.
//!
//! # Modules
//!
//! - [`cache`] – [`ShortTermCache`][cache::ShortTermCache]: a bounded
//!   working-memory store that evicts by importance and age.
//! - [`episodic`] – [`EpisodicStore`][episodic::EpisodicStore]: persists
//!   interaction episodes to SQLite and answers ranked multi-predicate and
//!   similarity searches.
//! - [`associations`] – [`AssociationGraph`][associations::AssociationGraph]:
//!   a weighted concept graph with lazy exponential decay, spreading
//!   activation, path and cluster queries, and atomic JSON snapshots.
//! - [`coordinator`] – [`MemoryCoordinator`][coordinator::MemoryCoordinator]:
//!   records percepts into all three stores and fuses recall results.
//! - [`consolidation`] – tag-pattern mining over recent episodes and the
//!   [`ConsolidationScheduler`][consolidation::ConsolidationScheduler] that
//!   runs it in the background.
//! - [`config`] – [`MemoryConfig`][config::MemoryConfig]: TOML configuration
//!   with `MNEMO_*` environment overrides.

pub mod associations;
pub mod cache;
pub mod config;
pub mod consolidation;
pub mod coordinator;
pub mod episodic;

pub use config::MemoryConfig;
pub use coordinator::{MemoryCoordinator, MemoryStats};
