//! Mailbox permission source
//!
//! Queries the remote mailbox directory and projects raw grants into
//! [`PermissionRecord`]s, dropping entries that are noise for an audit:
//! inherited and deny entries, grants to the built-in self principal, and
//! grants of a mailbox to its own address.
//!
//! Listing is a separate phase from permission lookup: callers materialise the
//! mailbox list first and then walk it, so nothing is captured on the side
//! while permissions stream out.

use crate::error::{AuditError, Result};
use crate::identity::{looks_like_sid, IdentityDirectory, IdentityResolver};
use crate::record::{join_rights, PermissionRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use tracing::trace;

/// The built-in principal that every mailbox grants to itself.
pub const SELF_PRINCIPAL: &str = "NT AUTHORITY\\SELF";

/// Folder rights value meaning "no access".
pub const NO_FOLDER_RIGHTS: &str = "None";

/// A mailbox as listed by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxInfo {
    pub name: String,
    #[serde(rename = "whenChanged")]
    pub when_changed: DateTime<Utc>,
}

/// A mailbox-level grant as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxGrant {
    pub user: String,
    #[serde(rename = "accessRights")]
    pub access_rights: Vec<String>,
    #[serde(default, rename = "isInherited")]
    pub is_inherited: bool,
    #[serde(default)]
    pub deny: bool,
}

/// A folder-level grant as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderGrant {
    #[serde(rename = "folderPath")]
    pub folder_path: String,
    pub user: String,
    #[serde(rename = "accessRights")]
    pub access_rights: Vec<String>,
}

/// Which mailboxes a listing should return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxFilter {
    /// Every mailbox (full scan).
    All,
    /// Mailboxes changed strictly after the timestamp (incremental scan).
    ChangedAfter(DateTime<Utc>),
    /// Mailboxes named strictly after `after` and changed after the timestamp
    /// (resume scan).
    Continuation {
        after: String,
        changed_after: DateTime<Utc>,
    },
}

impl MailboxFilter {
    pub fn matches(&self, mailbox: &MailboxInfo) -> bool {
        match self {
            MailboxFilter::All => true,
            MailboxFilter::ChangedAfter(ts) => mailbox.when_changed > *ts,
            MailboxFilter::Continuation {
                after,
                changed_after,
            } => mailbox.name.as_str() > after.as_str() && mailbox.when_changed > *changed_after,
        }
    }
}

impl fmt::Display for MailboxFilter {
    /// Server-side filter expression for the directory.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailboxFilter::All => write!(f, "*"),
            MailboxFilter::ChangedAfter(ts) => write!(f, "WhenChanged -gt '{}'", format_ts(ts)),
            MailboxFilter::Continuation {
                after,
                changed_after,
            } => write!(
                f,
                "Name -gt '{}' -and WhenChanged -gt '{}'",
                after.replace('\'', "''"),
                format_ts(changed_after)
            ),
        }
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Cap on the number of mailboxes a listing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResultSize {
    #[default]
    Unlimited,
    Limited(NonZeroUsize),
}

impl ResultSize {
    pub fn limit(&self) -> Option<usize> {
        match self {
            ResultSize::Unlimited => None,
            ResultSize::Limited(n) => Some(n.get()),
        }
    }
}

impl FromStr for ResultSize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(ResultSize::Unlimited);
        }
        let n: usize = s
            .parse()
            .map_err(|_| format!("Invalid result size '{}': expected a number or 'unlimited'", s))?;
        NonZeroUsize::new(n)
            .map(ResultSize::Limited)
            .ok_or_else(|| "Result size must be greater than zero".to_string())
    }
}

impl TryFrom<String> for ResultSize {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResultSize> for String {
    fn from(value: ResultSize) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ResultSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultSize::Unlimited => write!(f, "unlimited"),
            ResultSize::Limited(n) => write!(f, "{}", n),
        }
    }
}

/// Remote mailbox directory (external collaborator).
pub trait MailboxDirectory {
    /// List mailboxes matching `filter`, capped at `limit`.
    fn list_mailboxes(&self, filter: &MailboxFilter, limit: ResultSize) -> Result<Vec<MailboxInfo>>;
    fn mailbox_grants(&self, mailbox: &MailboxInfo) -> Result<Vec<MailboxGrant>>;
    fn folder_grants(&self, mailbox: &MailboxInfo) -> Result<Vec<FolderGrant>>;
}

impl<T: MailboxDirectory + ?Sized> MailboxDirectory for &T {
    fn list_mailboxes(&self, filter: &MailboxFilter, limit: ResultSize) -> Result<Vec<MailboxInfo>> {
        (**self).list_mailboxes(filter, limit)
    }

    fn mailbox_grants(&self, mailbox: &MailboxInfo) -> Result<Vec<MailboxGrant>> {
        (**self).mailbox_grants(mailbox)
    }

    fn folder_grants(&self, mailbox: &MailboxInfo) -> Result<Vec<FolderGrant>> {
        (**self).folder_grants(mailbox)
    }
}

/// Grants excluded from every snapshot.
#[derive(Debug, Clone, Default)]
pub struct ExclusionPolicy {
    /// Suffix appended to a mailbox name to form its own address, e.g. `@contoso.com`.
    pub email_domain: String,
    /// Extra principals treated like the self principal.
    pub ignored_grantees: Vec<String>,
}

impl ExclusionPolicy {
    pub fn new(email_domain: impl Into<String>) -> Self {
        Self {
            email_domain: normalize_domain(&email_domain.into()),
            ignored_grantees: Vec::new(),
        }
    }

    pub fn with_ignored(mut self, grantees: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ignored_grantees
            .extend(grantees.into_iter().map(|g| g.into()));
        self
    }

    fn is_noise_grantee(&self, mailbox: &str, grantee: &str) -> bool {
        if grantee.eq_ignore_ascii_case(SELF_PRINCIPAL) {
            return true;
        }
        if !self.email_domain.is_empty() {
            let own_address = format!("{}{}", mailbox, self.email_domain);
            if grantee.eq_ignore_ascii_case(&own_address) {
                return true;
            }
        }
        self.ignored_grantees
            .iter()
            .any(|g| g.eq_ignore_ascii_case(grantee))
    }

    pub fn excludes_mailbox_grant(&self, mailbox: &str, grant: &MailboxGrant) -> bool {
        grant.is_inherited || grant.deny || self.is_noise_grantee(mailbox, &grant.user)
    }

    pub fn excludes_folder_grant(&self, mailbox: &str, grant: &FolderGrant) -> bool {
        let no_rights = grant.access_rights.len() == 1
            && grant.access_rights[0].trim().eq_ignore_ascii_case(NO_FOLDER_RIGHTS);
        no_rights || self.is_noise_grantee(mailbox, &grant.user)
    }
}

/// Add the leading `@` to a bare domain.
pub fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim();
    if domain.is_empty() || domain.starts_with('@') {
        domain.to_string()
    } else {
        format!("@{}", domain)
    }
}

/// Permission source over a mailbox directory and an identity resolver.
pub struct MailboxPermissionSource<D, I> {
    directory: D,
    resolver: IdentityResolver<I>,
    policy: ExclusionPolicy,
}

impl<D: MailboxDirectory, I: IdentityDirectory> MailboxPermissionSource<D, I> {
    pub fn new(directory: D, resolver: IdentityResolver<I>, policy: ExclusionPolicy) -> Self {
        Self {
            directory,
            resolver,
            policy,
        }
    }

    /// List mailboxes for `filter`, sorted by name for lexicographic resume.
    pub fn list_mailboxes(
        &self,
        filter: &MailboxFilter,
        limit: ResultSize,
    ) -> Result<Vec<MailboxInfo>> {
        let mut mailboxes = self.directory.list_mailboxes(filter, limit)?;
        mailboxes.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(cap) = limit.limit() {
            mailboxes.truncate(cap);
        }
        Ok(mailboxes)
    }

    /// Mailbox-level records for one mailbox, exclusions applied.
    pub fn mailbox_permissions(&mut self, mailbox: &MailboxInfo) -> Result<Vec<PermissionRecord>> {
        let grants = self.directory.mailbox_grants(mailbox)?;
        let mut records = Vec::with_capacity(grants.len());
        for grant in grants {
            if self.policy.excludes_mailbox_grant(&mailbox.name, &grant) {
                trace!(mailbox = %mailbox.name, grantee = %grant.user, "Skipping mailbox grant");
                continue;
            }
            let grantee = if looks_like_sid(&grant.user) {
                self.resolver.resolve(&grant.user, true)
            } else {
                grant.user.clone()
            };
            records.push(PermissionRecord::mailbox_level(
                mailbox.name.clone(),
                grantee,
                join_rights(&grant.access_rights),
            ));
        }
        Ok(records)
    }

    /// Folder-level records for one mailbox, exclusions applied.
    pub fn folder_permissions(&mut self, mailbox: &MailboxInfo) -> Result<Vec<PermissionRecord>> {
        let grants = self.directory.folder_grants(mailbox)?;
        let mut records = Vec::with_capacity(grants.len());
        for grant in grants {
            if self.policy.excludes_folder_grant(&mailbox.name, &grant) {
                trace!(
                    mailbox = %mailbox.name,
                    folder = %grant.folder_path,
                    grantee = %grant.user,
                    "Skipping folder grant"
                );
                continue;
            }
            if grant.folder_path.is_empty() {
                return Err(AuditError::Directory(format!(
                    "Folder grant without a folder path on mailbox {}",
                    mailbox.name
                )));
            }
            let grantee = self
                .resolver
                .resolve(&grant.user, looks_like_sid(&grant.user));
            records.push(PermissionRecord::folder_level(
                mailbox.name.clone(),
                grant.folder_path.clone(),
                grantee,
                join_rights(&grant.access_rights),
            ));
        }
        Ok(records)
    }

    /// Batch form: the mailbox list and all of its mailbox-level records.
    pub fn fetch_mailbox_permissions(
        &mut self,
        filter: &MailboxFilter,
        limit: ResultSize,
    ) -> Result<(Vec<MailboxInfo>, Vec<PermissionRecord>)> {
        let mailboxes = self.list_mailboxes(filter, limit)?;
        let mut records = Vec::new();
        for mailbox in &mailboxes {
            records.extend(self.mailbox_permissions(mailbox)?);
        }
        Ok((mailboxes, records))
    }

    /// Batch form: folder-level records for every mailbox in `mailboxes`.
    pub fn fetch_folder_permissions(
        &mut self,
        mailboxes: &[MailboxInfo],
    ) -> Result<Vec<PermissionRecord>> {
        let mut records = Vec::new();
        for mailbox in mailboxes {
            records.extend(self.folder_permissions(mailbox)?);
        }
        Ok(records)
    }

    pub fn resolver(&self) -> &IdentityResolver<I> {
        &self.resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::identity::DirectoryObject;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
    }

    fn grant(user: &str, rights: &[&str]) -> MailboxGrant {
        MailboxGrant {
            user: user.to_string(),
            access_rights: rights.iter().map(|r| r.to_string()).collect(),
            is_inherited: false,
            deny: false,
        }
    }

    fn folder(path: &str, user: &str, rights: &[&str]) -> FolderGrant {
        FolderGrant {
            folder_path: path.to_string(),
            user: user.to_string(),
            access_rights: rights.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn noisy_directory() -> MemoryDirectory {
        let mut dir = MemoryDirectory::new();
        dir.add_mailbox(
            "M1",
            ts(1),
            vec![
                MailboxGrant {
                    is_inherited: true,
                    ..grant("CONTOSO\\Domain Admins", &["FullAccess"])
                },
                MailboxGrant {
                    deny: true,
                    ..grant("CONTOSO\\Auditors", &["FullAccess"])
                },
                grant("NT AUTHORITY\\SELF", &["FullAccess", "ReadPermission"]),
                grant("M1@contoso.com", &["FullAccess"]),
                grant("carol@contoso.com", &["FullAccess"]),
                grant("S-1-5-21-1-2-3-1105", &["SendAs"]),
            ],
            vec![
                folder("\\Calendar", "Default", &["None"]),
                folder("\\Calendar", "Dave Jones", &["Reviewer"]),
                folder("\\Inbox", "S-1-5-21-1-2-3-1105", &["ReadItems", "CreateItems"]),
                folder("\\Inbox", "nt authority\\self", &["Owner"]),
                folder("\\Inbox", "Unknown Person", &["Editor"]),
            ],
        );
        dir.add_object(DirectoryObject {
            name: "bob".to_string(),
            user_principal_name: Some("bob@contoso.com".to_string()),
            sid: Some("S-1-5-21-1-2-3-1105".to_string()),
            display_name: Some("Bob Brown".to_string()),
        });
        dir.add_object(DirectoryObject {
            name: "dave".to_string(),
            user_principal_name: Some("dave@contoso.com".to_string()),
            sid: None,
            display_name: Some("Dave Jones".to_string()),
        });
        dir
    }

    fn source(dir: &MemoryDirectory) -> MailboxPermissionSource<&MemoryDirectory, &MemoryDirectory> {
        MailboxPermissionSource::new(
            dir,
            IdentityResolver::new(dir),
            ExclusionPolicy::new("@contoso.com"),
        )
    }

    #[test]
    fn test_mailbox_exclusions() {
        let dir = noisy_directory();
        let mut source = source(&dir);
        let mailbox = dir.mailbox("M1").unwrap();

        let records = source.mailbox_permissions(&mailbox).unwrap();
        assert_eq!(
            records,
            vec![
                PermissionRecord::mailbox_level("M1", "carol@contoso.com", "FullAccess"),
                PermissionRecord::mailbox_level("M1", "bob@contoso.com", "SendAs"),
            ]
        );
    }

    #[test]
    fn test_folder_exclusions_and_resolution() {
        let dir = noisy_directory();
        let mut source = source(&dir);
        let mailbox = dir.mailbox("M1").unwrap();

        let records = source.folder_permissions(&mailbox).unwrap();
        assert_eq!(
            records,
            vec![
                PermissionRecord::folder_level("M1", "\\Calendar", "dave@contoso.com", "Reviewer"),
                PermissionRecord::folder_level(
                    "M1",
                    "\\Inbox",
                    "bob@contoso.com",
                    "ReadItems, CreateItems"
                ),
                PermissionRecord::folder_level("M1", "\\Inbox", "Unknown Person", "Editor"),
            ]
        );
    }

    #[test]
    fn test_mailbox_grantee_names_are_not_resolved() {
        let mut dir = MemoryDirectory::new();
        dir.add_mailbox("M1", ts(1), vec![grant("Dave Jones", &["FullAccess"])], vec![]);
        dir.add_object(DirectoryObject {
            name: "dave".to_string(),
            user_principal_name: Some("dave@contoso.com".to_string()),
            sid: None,
            display_name: Some("Dave Jones".to_string()),
        });
        let mut source = source(&dir);
        let mailbox = dir.mailbox("M1").unwrap();

        let records = source.mailbox_permissions(&mailbox).unwrap();
        assert_eq!(records[0].grantee, "Dave Jones");
    }

    #[test]
    fn test_self_grant_only_mailbox_yields_nothing() {
        let mut dir = MemoryDirectory::new();
        dir.add_mailbox("M1", ts(1), vec![grant("M1@contoso.com", &["FullAccess"])], vec![]);
        let mut source = source(&dir);

        let (mailboxes, records) = source
            .fetch_mailbox_permissions(&MailboxFilter::All, ResultSize::Unlimited)
            .unwrap();
        assert_eq!(mailboxes.len(), 1);
        assert!(records.is_empty());
    }

    #[test]
    fn test_ignored_grantees() {
        let mut dir = MemoryDirectory::new();
        dir.add_mailbox(
            "M1",
            ts(1),
            vec![
                grant("CONTOSO\\svc-journal", &["FullAccess"]),
                grant("erin@contoso.com", &["ReadPermission"]),
            ],
            vec![],
        );
        let policy = ExclusionPolicy::new("contoso.com").with_ignored(["contoso\\SVC-JOURNAL"]);
        let mut source = MailboxPermissionSource::new(&dir, IdentityResolver::new(&dir), policy);
        let mailbox = dir.mailbox("M1").unwrap();

        let records = source.mailbox_permissions(&mailbox).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].grantee, "erin@contoso.com");
    }

    #[test]
    fn test_list_is_sorted_and_capped() {
        let mut dir = MemoryDirectory::new();
        for name in ["Mbox3", "Mbox1", "Mbox2"] {
            dir.add_mailbox(name, ts(1), vec![], vec![]);
        }
        let source = source(&dir);
        let limit: ResultSize = "2".parse().unwrap();

        let names: Vec<String> = source
            .list_mailboxes(&MailboxFilter::All, limit)
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["Mbox1", "Mbox2"]);
    }

    #[test]
    fn test_fetch_folder_permissions_batch() {
        let dir = noisy_directory();
        let mut source = source(&dir);
        let (mailboxes, _) = source
            .fetch_mailbox_permissions(&MailboxFilter::All, ResultSize::Unlimited)
            .unwrap();
        let folders = source.fetch_folder_permissions(&mailboxes).unwrap();
        assert_eq!(folders.len(), 3);
        assert!(folders.iter().all(|r| r.is_folder_level()));
    }

    #[test]
    fn test_directory_errors_propagate() {
        let mut dir = noisy_directory();
        dir.fail_after(0);
        let mut source = source(&dir);
        let mailbox = MailboxInfo {
            name: "M1".to_string(),
            when_changed: ts(1),
        };
        let err = source.mailbox_permissions(&mailbox).unwrap_err();
        assert!(matches!(err, AuditError::Directory(_)));
    }

    #[test]
    fn test_filter_matches() {
        let mailbox = MailboxInfo {
            name: "Mbox101".to_string(),
            when_changed: ts(10),
        };
        assert!(MailboxFilter::All.matches(&mailbox));
        assert!(MailboxFilter::ChangedAfter(ts(9)).matches(&mailbox));
        assert!(!MailboxFilter::ChangedAfter(ts(10)).matches(&mailbox));
        assert!(MailboxFilter::Continuation {
            after: "Mbox100".to_string(),
            changed_after: ts(9),
        }
        .matches(&mailbox));
        assert!(!MailboxFilter::Continuation {
            after: "Mbox101".to_string(),
            changed_after: ts(9),
        }
        .matches(&mailbox));
    }

    #[test]
    fn test_filter_display() {
        let filter = MailboxFilter::Continuation {
            after: "O'Brien".to_string(),
            changed_after: ts(9),
        };
        assert_eq!(
            filter.to_string(),
            "Name -gt 'O''Brien' -and WhenChanged -gt '2024-03-09T12:00:00Z'"
        );
        assert_eq!(
            MailboxFilter::ChangedAfter(ts(9)).to_string(),
            "WhenChanged -gt '2024-03-09T12:00:00Z'"
        );
    }

    #[test]
    fn test_result_size_parse() {
        assert_eq!("Unlimited".parse::<ResultSize>().unwrap(), ResultSize::Unlimited);
        assert_eq!("250".parse::<ResultSize>().unwrap().limit(), Some(250));
        assert!("0".parse::<ResultSize>().is_err());
        assert!("lots".parse::<ResultSize>().is_err());
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("contoso.com"), "@contoso.com");
        assert_eq!(normalize_domain(" @contoso.com "), "@contoso.com");
        assert_eq!(normalize_domain(""), "");
    }
}
