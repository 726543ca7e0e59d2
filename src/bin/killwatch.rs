//! killwatch: replay killmails against a profile set, or validate profiles.
//!
//! Matches are written to stdout as JSON lines; logs go to stderr and are
//! filtered through `RUST_LOG`.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use killwatch::{
    Compiler, EngineConfig, FileProfileSource, JsonLinesSink, KillmailEvent, SurveillanceService,
};

#[derive(Parser, Debug)]
#[command(name = "killwatch", version, about = "Killmail surveillance matching engine")]
struct Cli {
    /// Engine config file (YAML, or JSON by extension).
    #[arg(long, global = true, env = "KILLWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate a file of killmails (one JSON object per line).
    Replay {
        /// Profile list (YAML, or JSON by extension).
        #[arg(long)]
        profiles: PathBuf,

        /// Killmail events as JSON lines.
        #[arg(long)]
        events: PathBuf,

        /// Print engine statistics to stderr when done.
        #[arg(long)]
        stats: bool,
    },
    /// Compile every profile in a file and report the ones that fail.
    Check {
        #[arg(long)]
        profiles: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            let config = EngineConfig::from_file(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            info!(path = %path.display(), "loaded engine config");
            config
        }
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn replay(
    config: EngineConfig,
    profiles: PathBuf,
    events: PathBuf,
    print_stats: bool,
) -> anyhow::Result<()> {
    let source = FileProfileSource::new(&profiles);
    let sink = Arc::new(JsonLinesSink::new(std::io::stdout()));
    let service = SurveillanceService::start(config, &source, sink)
        .with_context(|| format!("starting with profiles from {}", profiles.display()))?;

    let file = std::fs::File::open(&events)
        .with_context(|| format!("opening events {}", events.display()))?;
    let mut submitted = 0usize;
    let mut skipped = 0usize;
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match KillmailEvent::from_json(&line) {
            Ok(event) => {
                service.submit(event)?;
                submitted += 1;
            }
            Err(err) => {
                skipped += 1;
                warn!(line = line_no + 1, error = %err, "skipping malformed killmail");
            }
        }
    }
    service.stop();

    info!(submitted, skipped, "replay finished");
    if print_stats {
        eprintln!("{}", serde_json::to_string_pretty(&service.get_stats())?);
    }
    Ok(())
}

fn check(config: EngineConfig, profiles: PathBuf) -> anyhow::Result<()> {
    let source = FileProfileSource::new(&profiles);
    let all = source
        .read_all()
        .with_context(|| format!("reading profiles {}", profiles.display()))?;
    let compiler = Compiler::with_config(config.compiler);

    let mut failures = 0usize;
    for profile in &all {
        if let Err(err) = compiler.compile_profile(profile) {
            failures += 1;
            println!("{}\t{}\t{}", profile.id, profile.name, err);
        }
    }
    info!(total = all.len(), failures, "profile check finished");
    if failures > 0 {
        anyhow::bail!("{failures} of {} profiles failed to compile", all.len());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Replay {
            profiles,
            events,
            stats,
        } => replay(config, profiles, events, stats),
        Command::Check { profiles } => check(config, profiles),
    }
}
