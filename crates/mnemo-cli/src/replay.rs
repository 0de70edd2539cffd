//! Replay – feeds a JSON-lines file of percepts through the coordinator.
//!
//! Each non-empty line is either a bare percept:
//!
//! ```json
//! {"raw_text": "hello", "keywords": ["hello"], "sentiment": 0.4}
//! ```
//!
//! or a percept with the session context to store alongside it:
//!
//! ```json
//! {"percept": {"raw_text": "hello"}, "context": {"session": "s-1"}}
//! ```
//!
//! Lines starting with `#` are comments.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use mnemo_memory::MemoryCoordinator;
use mnemo_types::Percept;
use serde_json::{Map, Value};
use tracing::warn;

/// Totals of one replay run.
#[derive(Debug, Default, PartialEq)]
pub struct ReplaySummary {
    pub recorded: usize,
    pub persisted: usize,
    pub skipped_lines: usize,
    pub interrupted: bool,
}

/// Parse one line.  `Ok(None)` for blank and comment lines.
pub(crate) fn parse_line(line: &str) -> Result<Option<(Percept, Map<String, Value>)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(line).map_err(|e| format!("invalid JSON: {e}"))?;
    let (percept, context) = match value {
        Value::Object(mut obj) if obj.contains_key("percept") => {
            let percept = obj.remove("percept").unwrap_or(Value::Null);
            let context = match obj.remove("context") {
                Some(Value::Object(ctx)) => ctx,
                Some(Value::Null) | None => Map::new(),
                Some(_) => return Err("context must be an object".to_string()),
            };
            (percept, context)
        }
        other => (other, Map::new()),
    };
    let percept: Percept =
        serde_json::from_value(percept).map_err(|e| format!("invalid percept: {e}"))?;
    Ok(Some((percept, context)))
}

/// Replay every line of `path`.  `shutdown` is polled between lines; when set
/// the replay stops early.  With `verbose`, recall results are printed
/// before each record.
pub fn run(
    coordinator: &MemoryCoordinator,
    path: &Path,
    shutdown: &AtomicBool,
    verbose: bool,
) -> Result<ReplaySummary, String> {
    let file = File::open(path).map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
    let mut summary = ReplaySummary::default();

    for (number, line) in BufReader::new(file).lines().enumerate() {
        if shutdown.load(Ordering::SeqCst) {
            summary.interrupted = true;
            break;
        }
        let line = line.map_err(|e| format!("Read error in {}: {}", path.display(), e))?;
        let (percept, context) = match parse_line(&line) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = number + 1, error = %e, "skipping replay line");
                summary.skipped_lines += 1;
                continue;
            }
        };

        if verbose {
            let memories = coordinator.recall(&percept);
            println!("{} {}", "›".bold().cyan(), percept.raw_text);
            for memory in &memories {
                println!(
                    "    {:>6.3}  {:<15} {}",
                    memory.relevance,
                    memory.source.to_string().dimmed(),
                    crate::repl::summarise(&memory.content)
                );
            }
        }

        let outcome = coordinator.record(&percept, &context);
        summary.recorded += 1;
        if outcome.episode_id.is_some() {
            summary.persisted += 1;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_memory::MemoryConfig;
    use std::io::Write;

    // ── parsing ──────────────────────────────────────────────────────────────

    #[test]
    fn parses_bare_and_wrapped_percepts() {
        let (p, ctx) = parse_line(r#"{"raw_text":"hi","keywords":["hi"]}"#).unwrap().unwrap();
        assert_eq!(p.raw_text, "hi");
        assert!(ctx.is_empty());

        let wrapped = r#"{"percept":{"raw_text":"yo"},"context":{"session":"s"}}"#;
        let (p, ctx) = parse_line(wrapped).unwrap().unwrap();
        assert_eq!(p.raw_text, "yo");
        assert_eq!(ctx["session"], "s");
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("# a comment").unwrap().is_none());
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert!(parse_line("{nope").is_err());
        assert!(parse_line(r#"{"keywords":[]}"#).is_err());
        assert!(parse_line(r#"{"percept":{"raw_text":"x"},"context":3}"#).is_err());
    }

    // ── run ──────────────────────────────────────────────────────────────────

    #[test]
    fn replay_records_valid_lines_and_counts_bad_ones() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("session.jsonl");
        let mut file = File::create(&input).unwrap();
        writeln!(file, "# demo session").unwrap();
        writeln!(
            file,
            r#"{{"raw_text":"I love my dog","keywords":["dog"],"sentiment":0.7}}"#
        )
        .unwrap();
        writeln!(file, "garbage").unwrap();
        writeln!(
            file,
            r#"{{"percept":{{"raw_text":"the dog barks"}},"context":{{"turn":2}}}}"#
        )
        .unwrap();
        drop(file);

        let config = MemoryConfig::with_data_dir(dir.path().join("data"));
        let coordinator = MemoryCoordinator::open(config).unwrap();
        let summary = run(&coordinator, &input, &AtomicBool::new(false), false).unwrap();
        assert_eq!(
            summary,
            ReplaySummary {
                recorded: 2,
                persisted: 2,
                skipped_lines: 1,
                interrupted: false,
            }
        );
        assert_eq!(coordinator.stats().episodic.count, 2);
    }

    #[test]
    fn replay_stops_when_shutdown_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("session.jsonl");
        std::fs::write(&input, "{\"raw_text\":\"a\"}\n{\"raw_text\":\"b\"}\n").unwrap();

        let coordinator = MemoryCoordinator::open(MemoryConfig::with_data_dir(dir.path())).unwrap();
        let summary = run(&coordinator, &input, &AtomicBool::new(true), false).unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.recorded, 0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = MemoryCoordinator::open(MemoryConfig::with_data_dir(dir.path())).unwrap();
        let err = run(&coordinator, &dir.path().join("nope.jsonl"), &AtomicBool::new(false), false)
            .unwrap_err();
        assert!(err.contains("Failed to open"));
    }
}
