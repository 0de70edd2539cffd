//! REPL – interactive shell over a live memory coordinator.
//!
//! Plain lines are recalled against, then recorded as a minimal percept.
//! Supported slash-commands:
//!   /help               – show this list
//!   /recall <text>      – show what memory returns for `text` without recording
//!   /stats              – print aggregated memory statistics
//!   /consolidate        – run a consolidation now
//!   /clusters           – list strongly connected concept clusters
//!   /path <from> <to>   – strongest association path between two concepts
//!   /quit | /exit       – gracefully exit the CLI

use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use mnemo_memory::MemoryCoordinator;
use mnemo_types::{Percept, RelevantMemory};
use serde_json::{Map, Value};

/// Words shorter than this are not used as keywords.
const MIN_KEYWORD_LEN: usize = 4;

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(coordinator: &MemoryCoordinator, shutdown: &AtomicBool) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "mnemo>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let (cmd, rest) = input.split_once(' ').unwrap_or((input, ""));

        match cmd {
            "/help" => cmd_help(),
            "/recall" => print_memories(&coordinator.recall(&percept_from_text(rest))),
            "/stats" => print_stats(coordinator),
            "/consolidate" => {
                let report = coordinator.consolidate();
                println!(
                    "  scanned {} episode(s), {} pattern(s), {} reinforcement(s), {} edge(s) pruned",
                    report.episodes_scanned,
                    report.patterns.len(),
                    report.associations_reinforced,
                    report.edges_pruned
                );
            }
            "/clusters" => {
                let clusters = coordinator.associations().clusters(2);
                if clusters.is_empty() {
                    println!("  {}", "no clusters yet".dimmed());
                }
                for cluster in clusters {
                    println!("  • {}", cluster.join(", "));
                }
            }
            "/path" => match rest.split_whitespace().collect::<Vec<_>>()[..] {
                [from, to] => match coordinator.associations().shortest_path(from, to, 4) {
                    Some(path) => println!("  {}", path.join(" → ").bold()),
                    None => println!("  {}", "no path within 4 hops".dimmed()),
                },
                _ => println!("{} /path <from> <to>", "Usage:".yellow()),
            },
            "/quit" | "/exit" => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            other if other.starts_with('/') => {
                println!(
                    "{} '{}'. Type {} for available commands.",
                    "Unknown command:".red(),
                    other.yellow(),
                    "/help".bold()
                );
            }
            _ => {
                let percept = percept_from_text(input);
                print_memories(&coordinator.recall(&percept));
                let outcome = coordinator.record(&percept, &Map::new());
                match outcome.episode_id {
                    Some(id) => println!("  {} episode {}", "✓".green(), id.dimmed()),
                    None => println!("  {} episode not persisted (see log)", "!".yellow().bold()),
                }
            }
        }
    }
}

/// A minimal percept for typed input: distinct lower-cased words of at least
/// four letters become keywords, in order of appearance.
pub(crate) fn percept_from_text(text: &str) -> Percept {
    let mut seen = BTreeSet::new();
    let keywords: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN)
        .map(str::to_lowercase)
        .filter(|w| seen.insert(w.clone()))
        .collect();
    Percept::new(text.trim()).with_keywords(keywords)
}

/// One-line rendering of a recalled payload.
pub(crate) fn summarise(content: &Value) -> String {
    let text = content
        .pointer("/content/raw_text")
        .or_else(|| content.get("concept"))
        .or_else(|| content.get("content"))
        .unwrap_or(content);
    let rendered = match text {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if rendered.chars().count() > 60 {
        let cut: String = rendered.chars().take(57).collect();
        format!("{cut}...")
    } else {
        rendered
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Mnemo Commands".bold().underline());
    println!(
        "  {}              – record the line and show related memories",
        "<text>".bold().cyan()
    );
    println!("  {}      – recall without recording", "/recall <text>".bold().cyan());
    println!("  {}              – aggregated memory statistics", "/stats".bold().cyan());
    println!("  {}        – run a consolidation now", "/consolidate".bold().cyan());
    println!("  {}           – strongly connected concept clusters", "/clusters".bold().cyan());
    println!("  {}   – association path between two concepts", "/path <from> <to>".bold().cyan());
    println!("  {}       – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

pub(crate) fn print_memories(memories: &[RelevantMemory]) {
    if memories.is_empty() {
        println!("  {}", "nothing relevant in memory".dimmed());
        return;
    }
    for memory in memories {
        println!(
            "  {:>6.3}  {:<15} {}",
            memory.relevance,
            memory.source.to_string().dimmed(),
            summarise(&memory.content)
        );
    }
}

pub(crate) fn print_stats(coordinator: &MemoryCoordinator) {
    match serde_json::to_string_pretty(&coordinator.stats()) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("{}: {}", "Stats error".red(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn percept_from_text_extracts_distinct_keywords() {
        let p = percept_from_text("  The Weather is nice; weather, always weather!  ");
        assert_eq!(p.raw_text, "The Weather is nice; weather, always weather!");
        assert_eq!(p.keywords, vec!["weather", "nice", "always"]);
        assert!(p.concepts.is_empty());
    }

    #[test]
    fn summarise_prefers_raw_text_then_concept() {
        assert_eq!(summarise(&json!({"content": {"raw_text": "hello"}})), "hello");
        assert_eq!(summarise(&json!({"concept": "animal", "strength": 0.9})), "animal");
        assert_eq!(summarise(&json!({"key": "k", "content": "cached"})), "cached");
        assert_eq!(summarise(&json!(42)), "42");
    }

    #[test]
    fn summarise_truncates_long_text() {
        let long = "x".repeat(100);
        let out = summarise(&json!(long));
        assert_eq!(out.chars().count(), 60);
        assert!(out.ends_with("..."));
    }
}
