//! Directory backend over a tenant export.
//!
//! The export is a JSON document captured from the tenant:
//!
//! ```json
//! {
//!   "mailboxes": [
//!     { "name": "M1", "whenChanged": "2024-03-01T12:00:00Z",
//!       "permissions": [ { "user": "carol@contoso.com", "accessRights": ["FullAccess"] } ],
//!       "folders": [ { "folderPath": "\\Calendar", "user": "Dave", "accessRights": ["Reviewer"] } ] }
//!   ],
//!   "directory": [
//!     { "name": "dave", "userPrincipalName": "dave@contoso.com", "displayName": "Dave" }
//!   ]
//! }
//! ```
//!
//! [`MemoryDirectory`] answers both mailbox and identity queries from it,
//! applying filters and result caps the way the server would.

use crate::error::{AuditError, Result};
use crate::identity::{DirectoryObject, IdentityDirectory};
use crate::source::{
    FolderGrant, MailboxDirectory, MailboxFilter, MailboxGrant, MailboxInfo, ResultSize,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::path::Path;
use tracing::info;

/// One mailbox with its grants, as exported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedMailbox {
    pub name: String,
    #[serde(rename = "whenChanged")]
    pub when_changed: DateTime<Utc>,
    #[serde(default)]
    pub permissions: Vec<MailboxGrant>,
    #[serde(default)]
    pub folders: Vec<FolderGrant>,
}

/// Top-level export document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantExport {
    #[serde(default)]
    pub mailboxes: Vec<ExportedMailbox>,
    #[serde(default)]
    pub directory: Vec<DirectoryObject>,
}

/// In-memory mailbox and identity directory with optional failure injection.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    export: TenantExport,
    fail_after: Option<usize>,
    grant_queries: Cell<usize>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_export(export: TenantExport) -> Self {
        Self {
            export,
            ..Self::default()
        }
    }

    /// Load a tenant export from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AuditError::Config(format!(
                "Cannot read directory export {}: {}",
                path.display(),
                e
            ))
        })?;
        let export: TenantExport = serde_json::from_str(&content).map_err(|e| {
            AuditError::Config(format!(
                "Malformed directory export {}: {}",
                path.display(),
                e
            ))
        })?;
        info!(
            path = %path.display(),
            mailboxes = export.mailboxes.len(),
            objects = export.directory.len(),
            "Loaded directory export"
        );
        Ok(Self::from_export(export))
    }

    pub fn add_mailbox(
        &mut self,
        name: &str,
        when_changed: DateTime<Utc>,
        permissions: Vec<MailboxGrant>,
        folders: Vec<FolderGrant>,
    ) {
        self.export.mailboxes.retain(|m| m.name != name);
        self.export.mailboxes.push(ExportedMailbox {
            name: name.to_string(),
            when_changed,
            permissions,
            folders,
        });
    }

    pub fn add_object(&mut self, object: DirectoryObject) {
        self.export.directory.push(object);
    }

    /// Make every grant query after the first `n` fail, simulating a dropped session.
    pub fn fail_after(&mut self, n: usize) {
        self.fail_after = Some(n);
        self.grant_queries.set(0);
    }

    /// Clear failure injection.
    pub fn recover(&mut self) {
        self.fail_after = None;
    }

    pub fn mailbox(&self, name: &str) -> Option<MailboxInfo> {
        self.find(name).map(|m| MailboxInfo {
            name: m.name.clone(),
            when_changed: m.when_changed,
        })
    }

    fn find(&self, name: &str) -> Option<&ExportedMailbox> {
        self.export.mailboxes.iter().find(|m| m.name == name)
    }

    fn check_session(&self) -> Result<()> {
        let count = self.grant_queries.get();
        if let Some(limit) = self.fail_after {
            if count >= limit {
                return Err(AuditError::Directory(format!(
                    "Session dropped after {} mailbox queries",
                    count
                )));
            }
        }
        self.grant_queries.set(count + 1);
        Ok(())
    }
}

impl MailboxDirectory for MemoryDirectory {
    fn list_mailboxes(&self, filter: &MailboxFilter, limit: ResultSize) -> Result<Vec<MailboxInfo>> {
        let mut mailboxes: Vec<MailboxInfo> = self
            .export
            .mailboxes
            .iter()
            .map(|m| MailboxInfo {
                name: m.name.clone(),
                when_changed: m.when_changed,
            })
            .filter(|m| filter.matches(m))
            .collect();
        mailboxes.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(cap) = limit.limit() {
            mailboxes.truncate(cap);
        }
        Ok(mailboxes)
    }

    fn mailbox_grants(&self, mailbox: &MailboxInfo) -> Result<Vec<MailboxGrant>> {
        self.check_session()?;
        let found = self
            .find(&mailbox.name)
            .ok_or_else(|| AuditError::Directory(format!("Mailbox not found: {}", mailbox.name)))?;
        Ok(found.permissions.clone())
    }

    fn folder_grants(&self, mailbox: &MailboxInfo) -> Result<Vec<FolderGrant>> {
        let found = self
            .find(&mailbox.name)
            .ok_or_else(|| AuditError::Directory(format!("Mailbox not found: {}", mailbox.name)))?;
        Ok(found.folders.clone())
    }
}

impl IdentityDirectory for MemoryDirectory {
    fn find_by_sid(&self, sid: &str) -> Result<Option<DirectoryObject>> {
        Ok(self
            .export
            .directory
            .iter()
            .find(|o| o.sid.as_deref().is_some_and(|s| s.eq_ignore_ascii_case(sid)))
            .cloned())
    }

    fn find_by_display_name(&self, display_name: &str) -> Result<Option<DirectoryObject>> {
        Ok(self
            .export
            .directory
            .iter()
            .find(|o| o.display_name.as_deref() == Some(display_name))
            .cloned())
    }
}
