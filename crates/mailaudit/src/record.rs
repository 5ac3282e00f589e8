//! The canonical row shape for one access-control entry.

use serde::{Deserialize, Serialize};

/// Column names of every snapshot file, in order.
pub const CSV_HEADERS: [&str; 4] = ["Mailbox", "FolderPath", "UserGivenAccess", "AccessRights"];

/// Separator used when joining right names into the `AccessRights` column.
pub const RIGHTS_SEPARATOR: &str = ", ";

/// One mailbox-level or folder-level permission entry.
///
/// An empty `folder_path` marks a grant on the whole mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionRecord {
    #[serde(rename = "Mailbox")]
    pub mailbox: String,
    #[serde(rename = "FolderPath", default)]
    pub folder_path: String,
    #[serde(rename = "UserGivenAccess")]
    pub grantee: String,
    #[serde(rename = "AccessRights")]
    pub access_rights: String,
}

impl PermissionRecord {
    pub fn mailbox_level(
        mailbox: impl Into<String>,
        grantee: impl Into<String>,
        access_rights: impl Into<String>,
    ) -> Self {
        Self {
            mailbox: mailbox.into(),
            folder_path: String::new(),
            grantee: grantee.into(),
            access_rights: access_rights.into(),
        }
    }

    pub fn folder_level(
        mailbox: impl Into<String>,
        folder_path: impl Into<String>,
        grantee: impl Into<String>,
        access_rights: impl Into<String>,
    ) -> Self {
        Self {
            mailbox: mailbox.into(),
            folder_path: folder_path.into(),
            grantee: grantee.into(),
            access_rights: access_rights.into(),
        }
    }

    pub fn is_folder_level(&self) -> bool {
        !self.folder_path.is_empty()
    }
}

/// Join right names the way they are stored in the `AccessRights` column.
pub fn join_rights<S: AsRef<str>>(rights: &[S]) -> String {
    rights
        .iter()
        .map(|r| r.as_ref().trim())
        .filter(|r| !r.is_empty())
        .collect::<Vec<_>>()
        .join(RIGHTS_SEPARATOR)
}

/// Stable sort by mailbox, mailbox-level entries ahead of folder entries.
///
/// Folder entries of the same mailbox keep their relative order.
pub fn sort_records(records: &mut [PermissionRecord]) {
    records.sort_by(|a, b| {
        a.mailbox
            .cmp(&b.mailbox)
            .then_with(|| a.is_folder_level().cmp(&b.is_folder_level()))
    });
}
