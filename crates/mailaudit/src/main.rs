//! Mailaudit command line
//!
//! - `scan`: full, incremental (`--only-new`) or resumed (`--resume`) permission scan
//! - `status`: snapshot files on disk and what the next run would do
//! - `config`: create or show the configuration file

use anyhow::Result;
use clap::{Parser, Subcommand};
use mailaudit::AuditConfig;
use mailaudit_logging::LogConfig;
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

use cli::config::ConfigAction;
use cli::error::HelpfulError;

#[derive(Parser, Debug)]
#[command(name = "mailaudit", version, about = "Mailbox and folder permission auditor")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.mailaudit/config.toml)
    #[arg(long, global = true, env = "MAILAUDIT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan mailbox permissions into the snapshot
    Scan(cli::scan::ScanArgs),

    /// Show snapshot files and the planned next run
    Status(cli::status::StatusArgs),

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

fn command_wants_json(cmd: &Commands) -> bool {
    match cmd {
        Commands::Scan(args) => args.json,
        Commands::Status(args) => args.json,
        Commands::Config {
            action: ConfigAction::Show { json },
        } => *json,
        Commands::Config { .. } => false,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json_mode = command_wants_json(&cli.command);

    if let Err(err) = mailaudit_logging::init_logging(LogConfig {
        app_name: "mailaudit",
        verbose: cli.verbose,
    }) {
        eprintln!("Warning: file logging unavailable: {:#}", err);
        mailaudit_logging::init_console_only(cli.verbose);
    }

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if json_mode {
                cli::error::print_json_error(&err);
            } else {
                eprintln!("{:?}", err);
            }
            ExitCode::from(cli::error::exit_code(&err))
        }
    }
}

fn run_command(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(AuditConfig::default_path);

    if let Commands::Config {
        action: action @ ConfigAction::Init { .. },
    } = cli.command
    {
        return cli::config::run(action, &AuditConfig::default(), &config_path);
    }

    let config = AuditConfig::load_or_default(cli.config.as_deref()).map_err(|e| {
        HelpfulError::new(format!("Cannot load config {}: {}", config_path.display(), e))
            .with_suggestion("TRY: Recreate it: mailaudit config init --force")
            .as_usage()
    })?;
    tracing::debug!(config = %config_path.display(), output = %config.output.display(), "Configuration loaded");

    match cli.command {
        Commands::Scan(args) => cli::scan::run(args, &config),
        Commands::Status(args) => cli::status::run(args, &config),
        Commands::Config { action } => cli::config::run(action, &config, &config_path),
    }
}
