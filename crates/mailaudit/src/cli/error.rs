//! Helpful error types for CLI commands
//!
//! Every error includes:
//! - What went wrong
//! - Context about the situation
//! - Suggestions for how to fix it

use mailaudit::{AuditError, SnapshotPaths};
use std::fmt;
use std::path::Path;

/// An error with helpful context and suggestions
#[derive(Debug)]
pub struct HelpfulError {
    /// The main error message
    pub message: String,
    /// Additional context about what was happening
    pub context: Option<String>,
    /// Suggestions for how to fix the error
    pub suggestions: Vec<String>,
    /// Precondition or usage problem rather than a runtime failure
    pub usage: bool,
}

impl HelpfulError {
    /// Create a new helpful error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            suggestions: Vec::new(),
            usage: false,
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Add a suggestion for fixing the error
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Add multiple suggestions
    pub fn with_suggestions(
        mut self,
        suggestions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.suggestions
            .extend(suggestions.into_iter().map(|s| s.into()));
        self
    }

    /// Mark as a usage error (exit code 2)
    pub fn as_usage(mut self) -> Self {
        self.usage = true;
        self
    }

    // === Common error constructors ===

    pub fn missing_email_domain() -> Self {
        Self::new("No email domain configured")
            .with_context("The domain is needed to recognise grants of a mailbox to its own address")
            .with_suggestions([
                "TRY: Pass it on the command line: mailaudit scan --email-domain contoso.com",
                "TRY: Set email_domain in the config file: mailaudit config show",
            ])
            .as_usage()
    }

    pub fn missing_directory() -> Self {
        Self::new("No directory export configured")
            .with_context("Scans read mailboxes and identities from a JSON tenant export")
            .with_suggestions([
                "TRY: Pass it on the command line: mailaudit scan --directory tenant.json",
                "TRY: Set directory in the config file: mailaudit config show",
            ])
            .as_usage()
    }

    pub fn config_exists(path: &Path) -> Self {
        Self::new(format!("Config file already exists: {}", path.display()))
            .with_suggestions([
                "TRY: Overwrite it: mailaudit config init --force".to_string(),
                format!("TRY: Inspect it: cat {}", path.display()),
            ])
            .as_usage()
    }

    /// Translate a library error into guidance for the operator.
    pub fn from_audit(err: AuditError, paths: &SnapshotPaths) -> Self {
        let stem = paths.snapshot.with_extension("");
        let base = stem.display();
        match err {
            AuditError::MissingSnapshot(path) => {
                Self::new(format!("No snapshot at {}", path.display()))
                    .with_context("Incremental and resumed scans update an existing snapshot")
                    .with_suggestion(format!(
                        "TRY: Run a full scan first: mailaudit scan --output {}",
                        base
                    ))
                    .as_usage()
            }
            AuditError::Locked(path) => Self::new("Another scan is running on this snapshot")
                .with_context(format!("Lock held on {}", path.display()))
                .with_suggestions([
                    format!("TRY: See who holds it: mailaudit status --output {}", base),
                    "TRY: Wait for the other scan to finish".to_string(),
                ]),
            AuditError::Directory(msg) => Self::new(format!("Directory query failed: {}", msg))
                .with_context("Rows fetched so far were kept")
                .with_suggestion(format!(
                    "TRY: Continue where it stopped: mailaudit scan --resume --output {}",
                    base
                )),
            AuditError::Authentication(msg) => {
                Self::new(format!("Authentication failed: {}", msg)).with_suggestions([
                    "TRY: Check the credentials used to capture the export",
                    "TRY: Capture a fresh export and run again",
                ])
            }
            AuditError::InvalidState(msg) => Self::new(msg).with_suggestions([
                "TRY: Check that --output points at a permission snapshot".to_string(),
                format!("TRY: Inspect the files: mailaudit status --output {}", base),
            ]),
            AuditError::Config(msg) => Self::new(format!("Configuration error: {}", msg))
                .with_suggestion("TRY: Show the effective config: mailaudit config show")
                .as_usage(),
            other => Self::new(other.to_string()),
        }
    }
}

impl fmt::Display for HelpfulError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ERROR: {}", self.message)?;

        if let Some(ctx) = &self.context {
            writeln!(f, "CONTEXT: {}", ctx)?;
        }

        if !self.suggestions.is_empty() {
            writeln!(f)?;
            for suggestion in &self.suggestions {
                writeln!(f, "  {}", suggestion)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for HelpfulError {}

/// Exit code for a failed command: 2 for usage errors, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<HelpfulError>() {
        Some(helpful) if helpful.usage => 2,
        _ => 1,
    }
}

/// Print an error as a JSON object on stdout.
pub fn print_json_error(err: &anyhow::Error) {
    let payload = match err.downcast_ref::<HelpfulError>() {
        Some(helpful) => serde_json::json!({
            "error": helpful.message,
            "context": helpful.context,
            "suggestions": helpful.suggestions,
        }),
        None => serde_json::json!({ "error": format!("{:#}", err) }),
    };
    println!("{}", payload);
}
