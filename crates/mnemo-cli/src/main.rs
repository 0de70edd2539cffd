//! `mnemo-cli` – Mnemo Command Line Interface
//!
//! This binary opens an agent memory rooted at `~/.mnemo/` and:
//!
//! 1. Loads `~/.mnemo/config.toml` (or `$MNEMO_CONFIG`), falling back to
//!    defaults with `MNEMO_*` environment overrides.
//! 2. Starts the background consolidation scheduler.
//! 3. Runs one of the subcommands below, or drops the user into an
//!    **interactive REPL** when none is given.
//! 4. Intercepts **Ctrl-C**, stops the scheduler and saves the association
//!    graph before exiting.
//!
//! ```text
//! mnemo                          interactive REPL
//! mnemo replay <file> [--verbose]
//! mnemo stats
//! mnemo consolidate
//! mnemo init-config
//! ```

mod config;
mod repl;
mod replay;

use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use mnemo_memory::MemoryCoordinator;
use mnemo_memory::consolidation::ConsolidationScheduler;

enum Command {
    Repl,
    Replay { path: PathBuf, verbose: bool },
    Stats,
    Consolidate,
    InitConfig,
    Help,
}

fn main() -> ExitCode {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG selects the level (default "info"); MNEMO_LOG_FORMAT=json
    // switches to newline-delimited JSON.  User-facing output stays on println!.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("MNEMO_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    let command = match parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            print_usage();
            return ExitCode::from(2);
        }
    };

    match command {
        Command::Help => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Command::InitConfig => {
            let path = config::config_path();
            return match config::write_default(&path) {
                Ok(()) => {
                    println!(
                        "  {} Config written to {}",
                        "✓".green().bold(),
                        path.display().to_string().bold()
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error saving config".red(), e);
                    ExitCode::FAILURE
                }
            };
        }
        _ => {}
    }

    if matches!(command, Command::Repl) {
        print_banner();
    }

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – saving memory and shutting down …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(
            error = %e,
            "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available"
        );
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let path = config::config_path();
    let cfg = match config::load(&path) {
        Ok((cfg, true)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok((cfg, false)) => {
            println!(
                "  No config at {}; using defaults (run `{}` to create one).",
                path.display().to_string().dimmed(),
                "mnemo init-config".bold()
            );
            cfg
        }
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    let interval = Duration::from_secs(cfg.consolidation.interval_secs.max(1));

    // ── Memory ────────────────────────────────────────────────────────────
    let coordinator = match MemoryCoordinator::open(cfg) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("{}: {}", "Failed to open memory".red(), e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        episodes = coordinator.stats().episodic.count,
        concepts = coordinator.associations().node_count(),
        "memory opened"
    );

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };
    let scheduler = {
        let _guard = rt.enter();
        ConsolidationScheduler::spawn(Arc::clone(&coordinator), interval)
    };

    let status = match command {
        Command::Repl => {
            println!("  Type {} for a list of commands.\n", "/help".bold().cyan());
            repl::run(&coordinator, &shutdown);
            ExitCode::SUCCESS
        }
        Command::Replay { path, verbose } => {
            match replay::run(&coordinator, &path, &shutdown, verbose) {
                Ok(summary) => {
                    println!(
                        "  {} replayed {} percept(s), {} persisted, {} line(s) skipped{}",
                        "✓".green().bold(),
                        summary.recorded,
                        summary.persisted,
                        summary.skipped_lines,
                        if summary.interrupted { " (interrupted)" } else { "" }
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}: {}", "Replay failed".red(), e);
                    ExitCode::FAILURE
                }
            }
        }
        Command::Stats => {
            repl::print_stats(&coordinator);
            ExitCode::SUCCESS
        }
        Command::Consolidate => {
            let report = coordinator.consolidate();
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("{}: {}", "Report error".red(), e),
            }
            ExitCode::SUCCESS
        }
        Command::Help | Command::InitConfig => ExitCode::SUCCESS,
    };

    // ── Shutdown ──────────────────────────────────────────────────────────
    rt.block_on(scheduler.shutdown());
    match coordinator.shutdown() {
        Ok(()) => status,
        Err(e) => {
            eprintln!("{}: {}", "Failed to save association graph".red(), e);
            ExitCode::FAILURE
        }
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command, String> {
    let Some(sub) = args.next() else {
        return Ok(Command::Repl);
    };
    let command = match sub.as_str() {
        "repl" => Command::Repl,
        "replay" => {
            let mut path = None;
            let mut verbose = false;
            for arg in args.by_ref() {
                match arg.as_str() {
                    "-v" | "--verbose" => verbose = true,
                    flag if flag.starts_with('-') => return Err(format!("unknown flag '{flag}'")),
                    _ if path.is_none() => path = Some(PathBuf::from(&arg)),
                    _ => return Err(format!("unexpected argument '{arg}'")),
                }
            }
            let path = path.ok_or("replay needs a file")?;
            return Ok(Command::Replay { path, verbose });
        }
        "stats" => Command::Stats,
        "consolidate" => Command::Consolidate,
        "init-config" => Command::InitConfig,
        "help" | "-h" | "--help" => Command::Help,
        other => return Err(format!("unknown command '{other}'")),
    };
    match args.next() {
        Some(extra) => Err(format!("unexpected argument '{extra}'")),
        None => Ok(command),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __  ___                      "#.bold().cyan());
    println!("{}", r#"  /  |/  /___  ___ __ _  ___   "#.bold().cyan());
    println!("{}", r#" / /|_/ / _ \/ -_)  ' \/ _ \  "#.bold().cyan());
    println!("{}", r#"/_/  /_/_//_/\__/_/_/_/\___/  "#.bold().cyan());
    println!();
    println!("  {} {}",
        "Mnemo".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Agent Memory");
    println!();
}

fn print_usage() {
    println!();
    println!("{}", "Usage".bold().underline());
    println!("  {}                            – interactive REPL", "mnemo".bold().cyan());
    println!(
        "  {} – record a JSON-lines percept file",
        "mnemo replay <file> [--verbose]".bold().cyan()
    );
    println!("  {}                      – print memory statistics", "mnemo stats".bold().cyan());
    println!("  {}                – run a consolidation now", "mnemo consolidate".bold().cyan());
    println!(
        "  {}                – write the default config file",
        "mnemo init-config".bold().cyan()
    );
    println!();
}
