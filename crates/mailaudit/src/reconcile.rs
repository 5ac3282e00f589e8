//! Snapshot reconciliation
//!
//! Merging is mailbox-granular: every mailbox that appears in the new rows
//! loses all of its old rows, mailbox-level and folder-level alike. A mailbox
//! whose folder grants were all removed, but whose own change stamp did not
//! move, is therefore not re-detected by an incremental scan.

use crate::error::Result;
use crate::record::{sort_records, PermissionRecord};
use crate::snapshot::{self, Artifact, SnapshotPaths};
use std::collections::HashSet;
use tracing::info;

/// Counts from one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Distinct mailboxes present in the new rows.
    pub touched_mailboxes: usize,
    /// Rows taken from the new set.
    pub new_records: usize,
    /// Old rows kept because their mailbox was not touched.
    pub kept_records: usize,
    /// Old rows replaced because their mailbox was touched.
    pub replaced_records: usize,
    /// Rows in the result.
    pub total: usize,
}

/// Merge `new` over `old`, returning the result sorted by mailbox.
pub fn merge(new: Vec<PermissionRecord>, old: Vec<PermissionRecord>) -> Vec<PermissionRecord> {
    merge_with_stats(new, old).0
}

/// [`merge`] plus counts.
pub fn merge_with_stats(
    new: Vec<PermissionRecord>,
    old: Vec<PermissionRecord>,
) -> (Vec<PermissionRecord>, MergeStats) {
    merge_touching(new, old, std::iter::empty::<String>())
}

/// Like [`merge_with_stats`], with `emptied` mailboxes counted as touched even
/// though they have no rows in `new`.
pub fn merge_touching(
    new: Vec<PermissionRecord>,
    old: Vec<PermissionRecord>,
    emptied: impl IntoIterator<Item = impl Into<String>>,
) -> (Vec<PermissionRecord>, MergeStats) {
    let mut touched: HashSet<String> = new.iter().map(|r| r.mailbox.clone()).collect();
    touched.extend(emptied.into_iter().map(Into::into));
    let old_len = old.len();
    let new_len = new.len();

    let mut result = new;
    result.extend(old.into_iter().filter(|r| !touched.contains(&r.mailbox)));
    sort_records(&mut result);

    let kept = result.len() - new_len;
    let stats = MergeStats {
        touched_mailboxes: touched.len(),
        new_records: new_len,
        kept_records: kept,
        replaced_records: old_len - kept,
        total: result.len(),
    };
    (result, stats)
}

/// Fold transient `inputs` (newest first) into the canonical snapshot.
///
/// Inputs are merged over each other first, then over the snapshot, with
/// `emptied` mailboxes treated as touched. The snapshot is rewritten in one
/// step and the inputs are deleted only after the rewrite succeeded.
pub fn reconcile(
    paths: &SnapshotPaths,
    inputs: &[Artifact],
    emptied: &[String],
) -> Result<MergeStats> {
    let mut pending: Option<Vec<PermissionRecord>> = None;
    for artifact in inputs {
        let rows = snapshot::load(paths.path(*artifact))?;
        info!(artifact = artifact.label(), rows = rows.len(), "Loaded merge input");
        pending = Some(match pending {
            None => rows,
            Some(newer) => merge(newer, rows),
        });
    }
    let new = pending.unwrap_or_default();

    let old = snapshot::load(&paths.snapshot)?;
    let (result, stats) = merge_touching(new, old, emptied.iter().cloned());
    snapshot::write_full(&paths.snapshot, result)?;
    info!(
        touched = stats.touched_mailboxes,
        kept = stats.kept_records,
        replaced = stats.replaced_records,
        total = stats.total,
        "Snapshot reconciled"
    );

    // Inputs are newest first, so Temp goes before Delta: a Temp left
    // behind on its own always belongs to a full scan.
    for artifact in inputs {
        snapshot::delete(paths.path(*artifact))?;
    }
    Ok(stats)
}
