//! Configuration for mailaudit

use crate::error::{AuditError, Result};
use crate::planner::DEFAULT_DELTA_OVERLAP_HOURS;
use crate::source::{normalize_domain, ResultSize};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration, stored as TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Base path of the snapshot; `.csv`, `-NEW.csv` and `-TEMP.csv` are derived from it
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Tenant mail domain, e.g. `@contoso.com`
    #[serde(default)]
    pub email_domain: Option<String>,

    /// Cap on listed mailboxes
    #[serde(default)]
    pub result_size: ResultSize,

    /// Include folder-level permissions
    #[serde(default)]
    pub include_folders: bool,

    /// Principals excluded like the self-reference principal
    #[serde(default)]
    pub ignored_grantees: Vec<String>,

    /// Directory export read by the built-in backend
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Hours subtracted from the snapshot timestamp for incremental scans
    #[serde(default = "default_delta_overlap_hours")]
    pub delta_overlap_hours: i64,
}

fn default_output() -> PathBuf {
    mailaudit_logging::mailaudit_home()
        .join("output")
        .join("MailboxPermissions")
}

fn default_delta_overlap_hours() -> i64 {
    DEFAULT_DELTA_OVERLAP_HOURS
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            email_domain: None,
            result_size: ResultSize::default(),
            include_folders: false,
            ignored_grantees: Vec::new(),
            directory: None,
            delta_overlap_hours: default_delta_overlap_hours(),
        }
    }
}

impl AuditConfig {
    /// Default location: `<home>/config.toml`.
    pub fn default_path() -> PathBuf {
        mailaudit_logging::mailaudit_home().join("config.toml")
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AuditConfig =
            toml::from_str(&content).map_err(|e| AuditError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default file if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Self::default_path();
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| AuditError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.delta_overlap_hours < 0 {
            return Err(AuditError::Config(format!(
                "delta_overlap_hours must not be negative, got {}",
                self.delta_overlap_hours
            )));
        }
        if let Some(domain) = &self.email_domain {
            if normalize_domain(domain).len() < 2 {
                return Err(AuditError::Config("email_domain is empty".to_string()));
            }
        }
        Ok(())
    }

    /// The normalised email domain, if configured.
    pub fn email_domain(&self) -> Option<String> {
        self.email_domain.as_deref().map(normalize_domain)
    }

    pub fn overlap(&self) -> chrono::Duration {
        chrono::Duration::hours(self.delta_overlap_hours)
    }
}
