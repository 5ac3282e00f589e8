//! Mailaudit - mailbox and folder permission auditing
//!
//! Enumerates mailbox-level and folder-level grants of a mail tenant and keeps
//! them in a CSV snapshot that later runs refresh incrementally.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Directory  │     │  Permission  │     │   Scanner   │     │  Snapshot   │
//! │ (mailboxes, │────▶│    Source    │────▶│ (plan, lock │────▶│ (CSV files, │
//! │ identities) │     │ (exclusions) │     │  stream)    │     │  reconcile) │
//! └─────────────┘     └──────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! # Core Concepts
//!
//! - **Snapshot**: `<base>.csv`, the canonical table of grants
//! - **Delta**: `<base>-NEW.csv`, rows of an incremental scan awaiting merge
//! - **Working file**: `<base>-TEMP.csv`, rows of a resumed scan awaiting merge
//! - **Reconcile**: mailbox-granular overwrite of snapshot rows by newer rows

pub mod config;
pub mod directory;
pub mod error;
pub mod identity;
pub mod lock;
pub mod planner;
pub mod reconcile;
pub mod record;
pub mod scan;
pub mod snapshot;
pub mod source;

// Re-exports for convenience
pub use config::AuditConfig;
pub use directory::MemoryDirectory;
pub use error::{AuditError, Result};
pub use identity::{IdentityDirectory, IdentityResolver};
pub use planner::{ScanIntent, ScanMode, ScanPlan};
pub use reconcile::MergeStats;
pub use record::PermissionRecord;
pub use scan::{RunSummary, Scanner};
pub use snapshot::{Artifact, SnapshotPaths};
pub use source::{ExclusionPolicy, MailboxDirectory, MailboxFilter, MailboxPermissionSource, ResultSize};
