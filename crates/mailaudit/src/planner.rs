//! Scan planning
//!
//! The scan mode is chosen once per run from operator intent and a probe of
//! the files on disk. [`plan`] is a pure function of those two inputs.
//!
//! | intent       | Snapshot | Temp | Delta | mode                      | writes   | finalize           |
//! |--------------|----------|------|-------|---------------------------|----------|--------------------|
//! | (none)       |    no    |  -   |   -   | full scan                 | Snapshot | sort in place      |
//! | (none)       |   yes    |  -   |   -   | full scan                 | Temp     | replace snapshot   |
//! | `only_new`   |   yes    |  -   |   -   | incremental scan          | Delta    | merge Delta        |
//! | `resume`     |   yes    | yes  |  yes  | resume of a resumed scan  | Temp     | merge Temp, Delta  |
//! | `resume`     |   yes    |  no  |  yes  | resume of incremental     | Temp     | merge Temp, Delta  |
//! | `resume`     |   any    | yes  |  no   | resume of full scan       | Temp     | replace snapshot   |
//! | `resume`     |   yes    |  no  |  no   | resume of full scan       | Snapshot | sort in place      |
//!
//! Stale transient files are discarded by full and incremental scans before
//! they start. An existing snapshot is only ever replaced once a run has
//! completed, so a failed full scan leaves it as it was. A working file
//! without a delta beside it therefore always belongs to a full scan: merges
//! delete the working file before the delta.

use crate::error::{AuditError, Result};
use crate::snapshot::{Artifact, SnapshotPaths};
use crate::source::MailboxFilter;
use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Default look-back subtracted from the snapshot timestamp.
pub const DEFAULT_DELTA_OVERLAP_HOURS: i64 = 24;

/// Creation and modification times of the canonical snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotTimes {
    /// `None` where the filesystem does not record creation time.
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
}

/// Summary of one artifact file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactState {
    pub records: usize,
    pub last_mailbox: Option<String>,
    pub has_folder_rows: bool,
}

/// Which artifacts exist, probed once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactProbe {
    pub snapshot: Option<ArtifactState>,
    pub snapshot_times: Option<SnapshotTimes>,
    pub delta: Option<ArtifactState>,
    pub temp: Option<ArtifactState>,
}

impl ArtifactProbe {
    pub fn state(&self, artifact: Artifact) -> Option<&ArtifactState> {
        match artifact {
            Artifact::Snapshot => self.snapshot.as_ref(),
            Artifact::Delta => self.delta.as_ref(),
            Artifact::Temp => self.temp.as_ref(),
        }
    }
}

/// Operator intent from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanIntent {
    pub only_new: bool,
    pub resume: bool,
    pub include_folders: bool,
    pub use_modified_date: bool,
    pub overlap: Duration,
}

impl Default for ScanIntent {
    fn default() -> Self {
        Self {
            only_new: false,
            resume: false,
            include_folders: false,
            use_modified_date: false,
            overlap: Duration::hours(DEFAULT_DELTA_OVERLAP_HOURS),
        }
    }
}

/// What a resume run continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOf {
    /// A resume run that was itself interrupted.
    WorkingFile,
    /// An interrupted incremental scan.
    Incremental,
    /// An interrupted full scan.
    FullScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Full,
    Incremental,
    Resume(ResumeOf),
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Full => write!(f, "full scan"),
            ScanMode::Incremental => write!(f, "incremental scan"),
            ScanMode::Resume(ResumeOf::WorkingFile) => write!(f, "resume of a resumed scan"),
            ScanMode::Resume(ResumeOf::Incremental) => write!(f, "resume of an incremental scan"),
            ScanMode::Resume(ResumeOf::FullScan) => write!(f, "resume of a full scan"),
        }
    }
}

/// How a successful run is folded into the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalize {
    /// The snapshot was written directly; rewrite it sorted.
    SortSnapshot,
    /// Merge these transient artifacts (newest first) into the snapshot.
    Reconcile(Vec<Artifact>),
    /// Replace the snapshot with this artifact's rows, then delete it.
    Replace(Artifact),
}

/// The decided course of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPlan {
    pub mode: ScanMode,
    pub filter: MailboxFilter,
    /// Artifact rows are appended to while the scan streams.
    pub sink: Artifact,
    /// Artifacts removed before the scan starts.
    pub discard: Vec<Artifact>,
    pub finalize: Finalize,
    pub include_folders: bool,
    pub date_for_delta: Option<DateTime<Utc>>,
    pub continuation: Option<String>,
}

/// Cut-off for incremental filters: snapshot timestamp minus `overlap`.
///
/// Uses the creation time unless the file was modified after it was created,
/// `use_modified` is set, or creation time is unavailable.
pub fn date_for_delta(times: &SnapshotTimes, use_modified: bool, overlap: Duration) -> DateTime<Utc> {
    let base = match times.created {
        Some(created) if !use_modified && times.modified <= created => created,
        _ => times.modified,
    };
    base - overlap
}

/// Decide the scan for `intent` given the probed artifacts.
pub fn plan(intent: &ScanIntent, probe: &ArtifactProbe, paths: &SnapshotPaths) -> Result<ScanPlan> {
    if intent.resume {
        return plan_resume(intent, probe, paths);
    }

    if intent.only_new {
        let date = required_date(intent, probe, paths)?;
        return Ok(ScanPlan {
            mode: ScanMode::Incremental,
            filter: MailboxFilter::ChangedAfter(date),
            sink: Artifact::Delta,
            discard: vec![Artifact::Delta, Artifact::Temp],
            finalize: Finalize::Reconcile(vec![Artifact::Delta]),
            include_folders: intent.include_folders,
            date_for_delta: Some(date),
            continuation: None,
        });
    }

    let (sink, finalize) = if probe.snapshot.is_some() {
        (Artifact::Temp, Finalize::Replace(Artifact::Temp))
    } else {
        (Artifact::Snapshot, Finalize::SortSnapshot)
    };
    Ok(ScanPlan {
        mode: ScanMode::Full,
        filter: MailboxFilter::All,
        sink,
        discard: vec![Artifact::Delta, Artifact::Temp],
        finalize,
        include_folders: intent.include_folders,
        date_for_delta: None,
        continuation: None,
    })
}

fn plan_resume(intent: &ScanIntent, probe: &ArtifactProbe, paths: &SnapshotPaths) -> Result<ScanPlan> {
    let folders_in = |artifacts: &[Artifact]| {
        artifacts
            .iter()
            .filter_map(|a| probe.state(*a))
            .any(|s| s.has_folder_rows)
    };
    let key_from = |artifacts: &[Artifact]| {
        artifacts
            .iter()
            .filter_map(|a| probe.state(*a))
            .find_map(|s| s.last_mailbox.clone())
    };

    if probe.delta.is_some() {
        let date = required_date(intent, probe, paths)?;
        let (mode, chain) = if probe.temp.is_some() {
            (ResumeOf::WorkingFile, vec![Artifact::Temp, Artifact::Delta])
        } else {
            (ResumeOf::Incremental, vec![Artifact::Delta])
        };
        let continuation = key_from(&chain);
        let filter = match &continuation {
            Some(after) => MailboxFilter::Continuation {
                after: after.clone(),
                changed_after: date,
            },
            None => MailboxFilter::ChangedAfter(date),
        };
        return Ok(ScanPlan {
            mode: ScanMode::Resume(mode),
            filter,
            sink: Artifact::Temp,
            discard: Vec::new(),
            finalize: Finalize::Reconcile(vec![Artifact::Temp, Artifact::Delta]),
            include_folders: intent.include_folders || folders_in(&chain),
            date_for_delta: Some(date),
            continuation,
        });
    }

    // Full scan: replacing an existing snapshot through Temp, or the first
    // one written straight into the snapshot.
    let (sink, finalize) = if probe.temp.is_some() {
        (Artifact::Temp, Finalize::Replace(Artifact::Temp))
    } else if probe.snapshot.is_some() {
        (Artifact::Snapshot, Finalize::SortSnapshot)
    } else {
        return Err(AuditError::MissingSnapshot(paths.snapshot.clone()));
    };
    let continuation = key_from(&[sink]);
    // Nothing written yet: start over.
    let filter = match &continuation {
        Some(after) => MailboxFilter::Continuation {
            after: after.clone(),
            changed_after: DateTime::<Utc>::UNIX_EPOCH,
        },
        None => MailboxFilter::All,
    };
    Ok(ScanPlan {
        mode: ScanMode::Resume(ResumeOf::FullScan),
        filter,
        sink,
        discard: Vec::new(),
        finalize,
        include_folders: intent.include_folders || folders_in(&[sink]),
        date_for_delta: None,
        continuation,
    })
}

fn required_date(
    intent: &ScanIntent,
    probe: &ArtifactProbe,
    paths: &SnapshotPaths,
) -> Result<DateTime<Utc>> {
    let times = probe
        .snapshot_times
        .as_ref()
        .ok_or_else(|| AuditError::MissingSnapshot(paths.snapshot.clone()))?;
    Ok(date_for_delta(times, intent.use_modified_date, intent.overlap))
}
