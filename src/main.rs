use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use autofire::{keys, AutofireConfig, AutofireEngine, ConfigWatcher, EngineOptions, Notice, Slot, SystemBackend};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Hold-to-repeat keyboard autofire")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "autofire.json")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Arm the configured slots and run until Ctrl+C (default)
    Run {
        /// Do not watch the config file for changes
        #[arg(long)]
        no_reload: bool,
    },
    /// Validate the configuration and list its slots
    Check,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// List supported key names
    Keys,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command.unwrap_or(Command::Run { no_reload: false }) {
        Command::Run { no_reload } => run(&cli.config, !no_reload).await,
        Command::Check => check(&cli.config),
        Command::Init { force } => init(&cli.config, force),
        Command::Keys => {
            list_keys();
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "autofire=debug" } else { "autofire=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Load the config at `path`, or the defaults when it does not exist. Also
/// returns the raw text so the reload watcher can skip unchanged contents.
fn load_config(path: &Path) -> Result<(AutofireConfig, Option<String>)> {
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok((AutofireConfig::default(), None));
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = AutofireConfig::from_json_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok((config, Some(contents)))
}

async fn run(path: &Path, reload: bool) -> Result<()> {
    let (config, loaded) = load_config(path)?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;

    let options = EngineOptions {
        emergency_chord: config.emergency_chord()?,
        ..EngineOptions::default()
    };
    let backend = Arc::new(SystemBackend::new(config.helper_script.clone()));
    let engine = Arc::new(AutofireEngine::new(backend, options));

    println!("{}", config.summary().bold());
    for slot in &config.slots {
        print_slot(slot);
    }

    let mut status = engine.subscribe_status();
    let mut notices = engine.subscribe_notices();
    engine
        .apply(config.slots)
        .await
        .context("failed to apply slots")?;
    engine.start().await.context("failed to arm autofire")?;
    println!(
        "{} Hold a trigger to fire. {} stops everything, Ctrl+C exits.",
        "Armed.".green().bold(),
        config.emergency_hotkey.to_uppercase().yellow()
    );

    let watcher = if reload {
        let task = ConfigWatcher::new(path, loaded)
            .spawn(engine.clone())
            .with_context(|| format!("failed to watch {}", path.display()))?;
        Some(task)
    } else {
        None
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let line = status.borrow_and_update().clone();
                print_status(&line);
            }
            notice = notices.recv() => match notice {
                Ok(notice) => print_notice(&notice),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "notices dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Some(watcher) = watcher {
        watcher.abort();
    }
    println!("{}", "Shutting down...".yellow());
    engine
        .shutdown()
        .await
        .context("autofire did not shut down cleanly")?;
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let (config, _) = load_config(path)?;
    for slot in &config.slots {
        print_slot(slot);
    }
    if let Err(e) = config.validate() {
        bail!("{}: {e}", path.display());
    }
    println!("{} {}", "OK".green().bold(), config.summary());
    Ok(())
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists, pass --force to overwrite it",
            path.display()
        );
    }
    AutofireConfig::default()
        .save_to_file(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("{} {}", "Wrote".green(), path.display());
    Ok(())
}

fn list_keys() {
    println!("{}", "Supported keys:".bold());
    for name in keys::supported_keys() {
        println!("  {name}");
    }
}

fn print_slot(slot: &Slot) {
    let marker = if slot.enabled {
        "on ".green()
    } else {
        "off".dimmed()
    };
    println!("  [{marker}] #{} {}", slot.id, slot.summary());
}

fn print_status(line: &str) {
    if line.starts_with("Active") {
        println!("{}", line.cyan().bold());
    } else if line.starts_with("Running") {
        println!("{}", line.green());
    } else {
        println!("{}", line.dimmed());
    }
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::SlotFailed { slot, reason } => {
            println!("{} slot {slot} stopped: {reason}", "!".red().bold())
        }
        Notice::Rejected { reason } => println!("{} {reason}", "rejected:".red()),
        Notice::EmergencyStop => println!("{}", "EMERGENCY STOP".red().bold()),
        Notice::StopTimedOut { slots } => {
            let ids: Vec<String> = slots.iter().map(|id| id.to_string()).collect();
            println!(
                "{} slots {} were aborted",
                "!".red().bold(),
                ids.join(", ")
            )
        }
    }
}
