use crate::gateway;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tidygram::config::{CliOverrides, load_config};

#[derive(Parser, Debug)]
#[command(name = "tidygram")]
#[command(about = "tidygram - keeps Telegram bot chats tidy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config.json (default: ~/.tidygram/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory for chat snapshots
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log what would be deleted without deleting anything
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Display version information
    Version,
    /// Run the Telegram bot
    Run,
    /// Print the effective configuration without secrets
    Config,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            config_path: self.config.clone(),
            data_dir: self.data_dir.clone(),
            dry_run: self.dry_run,
        }
    }
}

pub fn run(cli: Cli) {
    match cli.command {
        Some(Commands::Version) => {
            print_version();
            process::exit(0);
        }
        Some(Commands::Config) => {
            if let Err(e) = check_explicit_config(&cli) {
                eprintln!("error: {e}");
                process::exit(1);
            }
            match load_config(&cli.overrides()) {
                Ok(config) => {
                    print_config_summary(&config);
                    process::exit(0);
                }
                Err(e) => {
                    eprintln!("error: {e:#}");
                    process::exit(1);
                }
            }
        }
        Some(Commands::Run) => {
            if let Err(e) = check_explicit_config(&cli) {
                eprintln!("error: {e}");
                process::exit(1);
            }
            let config = match load_config(&cli.overrides()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("error: {e:#}");
                    process::exit(1);
                }
            };
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(e) => {
                    eprintln!("error: failed to start async runtime: {e}");
                    process::exit(1);
                }
            };
            if let Err(e) = runtime.block_on(gateway::run_gateway(&config)) {
                tracing::error!("Gateway failed: {:#}", e);
                eprintln!("error: {e:#}");
                process::exit(1);
            }
        }
        None => {
            print_help();
            process::exit(0);
        }
    }
}

/// An explicitly passed config path must exist; the default one may not.
fn check_explicit_config(cli: &Cli) -> Result<(), String> {
    match &cli.config {
        Some(path) if !path.exists() => Err(format!("config file not found: {}", path.display())),
        _ => Ok(()),
    }
}

fn print_version() {
    println!("tidygram {}", env!("CARGO_PKG_VERSION"));
}

fn print_help() {
    let mut command = Cli::command();
    command.print_help().ok();
    println!();
}

fn print_config_summary(config: &tidygram::config::AppConfig) {
    let summary = config.get_safe_summary();
    println!("telegram_configured: {}", summary.telegram_configured);
    println!("persistence_enabled: {}", summary.persistence_enabled);
    if let Some(dir) = config.persistence.resolved_dir() {
        println!("snapshot_dir: {}", dir.display());
    }
    println!("snapshot_ttl_secs: {}", config.persistence.snapshot_ttl_secs);
    println!("dry_run: {}", summary.dry_run);
    println!("max_tracked_messages: {}", summary.max_tracked_messages);
    println!("deletion_batch_size: {}", config.cleaner.deletion_batch_size);
    println!("cleanup_interval_secs: {}", config.cleaner.cleanup_interval_secs);
    println!("inactive_threshold_secs: {}", config.cleaner.inactive_threshold_secs);
}
