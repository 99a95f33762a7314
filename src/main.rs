//! `bench-seq`: validate, preview and run bench sequences from the terminal.

use anyhow::{bail, Context, Result};
use bench_sequencer::config::{default_config_path, Settings};
use bench_sequencer::execution::{ExecutionControl, RunState, Runner};
use bench_sequencer::instrument::SimulatedConnector;
use bench_sequencer::logging::init_tracing;
use bench_sequencer::sequence::library::YamlSource;
use bench_sequencer::sequence::SequenceSource;
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "bench-seq",
    version,
    about = "Timed command sequencer for a laboratory test bench",
    after_help = "Examples:\n  bench-seq validate command.csv\n  bench-seq run command.csv --simulate\n  bench-seq save command.csv --name warmup"
)]
struct Cli {
    /// Configuration file (defaults to config/bench.toml).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load, inline and validate a sequence without touching instruments.
    Validate {
        /// Sequence file (.csv, .yaml or .yml).
        file: PathBuf,
    },
    /// Print the expanded step list with its timeline.
    Plan {
        /// Sequence file (.csv, .yaml or .yml).
        file: PathBuf,
    },
    /// Execute a sequence. Type p, r, s or a + Enter to pause, resume, skip or abort.
    Run {
        /// Sequence file (.csv, .yaml or .yml).
        file: PathBuf,
        /// Drive simulated instruments instead of the bench.
        #[arg(long)]
        simulate: bool,
    },
    /// Store a sequence in the saved-sequence directory.
    Save {
        /// Sequence file (.csv, .yaml or .yml).
        file: PathBuf,
        /// Name to save under; `sequence` rows refer to it.
        #[arg(long)]
        name: String,
        /// Replace an existing saved sequence.
        #[arg(long)]
        force: bool,
    },
    /// List saved sequences.
    List,
    /// Print the effective configuration after file and environment layering.
    Config,
}

fn source_for(path: &Path) -> Result<Box<dyn SequenceSource>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        #[cfg(feature = "source_csv")]
        Some("csv") => Ok(Box::new(
            bench_sequencer::sequence::loader::CsvSource::new(path),
        )),
        Some("yaml") | Some("yml") => Ok(Box::new(YamlSource::new(path))),
        _ => bail!("Unsupported sequence file '{}'", path.display()),
    }
}

/// Operator keys arrive line by line on stdin.
fn spawn_operator_input(control: ExecutionControl) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match line.trim() {
                "p" => control.request_pause(),
                "r" => control.request_resume(),
                "s" => control.request_skip(),
                "a" => {
                    control.request_abort();
                    break;
                }
                "" => {}
                other => eprintln!("Unknown key '{}' (p, r, s, a)", other),
            }
        }
    });
}

fn spawn_status_printer(control: &ExecutionControl) {
    let mut status = control.subscribe();
    tokio::spawn(async move {
        let mut last_state = None;
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            let moved = last_state != Some((snapshot.state, snapshot.step_index));
            if moved {
                eprintln!("{}", snapshot.summary());
                last_state = Some((snapshot.state, snapshot.step_index));
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let settings = Settings::load_from(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    init_tracing(&settings.application)?;
    info!("{} using {}", settings.application.name, config_path.display());

    let runner = Runner::new(settings, Arc::new(SimulatedConnector::new()));

    match cli.command {
        Command::Validate { file } => {
            let seq = runner.prepare(source_for(&file)?.as_ref())?;
            println!(
                "{}: {} steps, nominal duration {:.1} s",
                seq.name,
                seq.len(),
                seq.total_duration()
            );
        }
        Command::Plan { file } => {
            let seq = runner.plan(source_for(&file)?.as_ref())?;
            for (offset, step) in seq.timeline().iter().zip(seq.iter()) {
                println!("{:>9.1}  {:<40} {}", offset, step.describe(), step.origin);
            }
            println!("total {:.1} s", seq.total_duration());
        }
        Command::Run { file, simulate } => {
            if !simulate {
                bail!("No hardware drivers are built into this binary; rerun with --simulate");
            }
            let source = source_for(&file)?;
            let control = ExecutionControl::new();
            spawn_status_printer(&control);
            spawn_operator_input(control.clone());

            let report = runner.run(source.as_ref(), control).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.state != RunState::Completed {
                std::process::exit(2);
            }
        }
        Command::Save { file, name, force } => {
            let library = runner.library();
            if library.exists(&name) && !force {
                bail!("Saved sequence '{}' already exists; pass --force to replace it", name);
            }
            let (seq, path) = runner.save(source_for(&file)?.as_ref(), &name)?;
            println!("Saved {} steps to {}", seq.len(), path.display());
        }
        Command::List => {
            for name in runner.library().list()? {
                println!("{}", name);
            }
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(runner.settings())?);
        }
    }
    Ok(())
}
