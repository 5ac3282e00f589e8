//! `mailaudit config`

use super::error::HelpfulError;
use anyhow::Context;
use clap::Subcommand;
use mailaudit::AuditConfig;
use std::path::Path;

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a default config file
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

pub fn run(action: ConfigAction, config: &AuditConfig, path: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                return Err(HelpfulError::config_exists(path).into());
            }
            AuditConfig::default()
                .save(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        ConfigAction::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("# {}", path.display());
                print!(
                    "{}",
                    toml::to_string_pretty(config).context("Failed to render config")?
                );
            }
        }
    }
    Ok(())
}
