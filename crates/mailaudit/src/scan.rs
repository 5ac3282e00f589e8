//! Scan runner
//!
//! A run takes the run lock, probes the artifacts once, plans, and then scans
//! in two phases: the mailbox list is materialised first, then each mailbox's
//! rows (mailbox-level, then folder-level) are appended and flushed to the
//! plan's sink before the next mailbox is queried. Files therefore stay in
//! mailbox-name order and the last row always names the last finished mailbox.
//!
//! A failed run leaves its files in place for `--resume`. An existing
//! snapshot is only rewritten after the scan has completed.

use crate::error::Result;
use crate::identity::{IdentityDirectory, ResolverStats};
use crate::lock;
use crate::planner::{self, Finalize, ScanIntent, ScanMode, ScanPlan};
use crate::reconcile::{self, MergeStats};
use crate::snapshot::{self, AppendWriter, SnapshotPaths};
use crate::source::{MailboxDirectory, MailboxPermissionSource, ResultSize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Mailboxes between progress lines in the log.
const PROGRESS_INTERVAL: usize = 100;

/// Outcome of one successful run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub mode: ScanMode,
    /// Server-side filter expression used for the listing.
    pub filter: String,
    pub mailboxes_listed: usize,
    /// Mailboxes that passed the mailbox stage, whether or not they produced rows.
    pub mailboxes_processed: usize,
    pub records_written: u64,
    pub include_folders: bool,
    /// Present for runs that reconcile into the snapshot.
    pub merge: Option<MergeStats>,
    /// Rows in the snapshot after the run.
    pub snapshot_records: usize,
    pub identity: ResolverStats,
    pub elapsed: Duration,
}

struct ScanOutcome {
    listed: usize,
    processed: usize,
    written: u64,
    /// Processed mailboxes without any surviving grant.
    emptied: Vec<String>,
}

/// Runs scans against one snapshot base.
pub struct Scanner<D, I> {
    source: MailboxPermissionSource<D, I>,
    paths: SnapshotPaths,
    result_size: ResultSize,
}

impl<D: MailboxDirectory, I: IdentityDirectory> Scanner<D, I> {
    pub fn new(
        source: MailboxPermissionSource<D, I>,
        paths: SnapshotPaths,
        result_size: ResultSize,
    ) -> Self {
        Self {
            source,
            paths,
            result_size,
        }
    }

    pub fn paths(&self) -> &SnapshotPaths {
        &self.paths
    }

    /// Plan and execute one run for `intent`.
    pub fn run(&mut self, intent: &ScanIntent) -> Result<RunSummary> {
        let start = Instant::now();
        self.paths.ensure_parent()?;
        let mut guard = lock::try_lock_run(&self.paths.lock, "planning")?;

        let probe = snapshot::probe(&self.paths)?;
        let plan = planner::plan(intent, &probe, &self.paths)?;
        guard.record_mode(&plan.mode.to_string());
        info!(
            mode = %plan.mode,
            filter = %plan.filter,
            include_folders = plan.include_folders,
            result_size = %self.result_size,
            "Starting run"
        );

        if plan.mode == ScanMode::Full && probe.snapshot.is_some() {
            info!(
                path = %self.paths.snapshot.display(),
                staging = %self.paths.path(plan.sink).display(),
                "Full scan will replace the existing snapshot once it completes"
            );
        }
        for artifact in &plan.discard {
            if probe.state(*artifact).is_some() {
                warn!(
                    artifact = artifact.label(),
                    path = %self.paths.path(*artifact).display(),
                    "Discarding file left by an interrupted run; use --resume to continue it instead"
                );
            }
            snapshot::delete(self.paths.path(*artifact))?;
        }

        let outcome = self.scan(&plan).map_err(|err| {
            error!(
                error = %err,
                sink = %self.paths.path(plan.sink).display(),
                "Scan interrupted; partial results kept for --resume"
            );
            err
        })?;

        let (merge, snapshot_records) = match &plan.finalize {
            Finalize::SortSnapshot => {
                let records = snapshot::load(&self.paths.snapshot)?;
                (None, snapshot::write_full(&self.paths.snapshot, records)?)
            }
            Finalize::Reconcile(inputs) => {
                let stats = reconcile::reconcile(&self.paths, inputs, &outcome.emptied)?;
                (Some(stats), stats.total)
            }
            Finalize::Replace(artifact) => {
                let path = self.paths.path(*artifact);
                let records = snapshot::load(path)?;
                let written = snapshot::write_full(&self.paths.snapshot, records)?;
                snapshot::delete(path)?;
                info!(records = written, "Snapshot replaced");
                (None, written)
            }
        };

        let summary = RunSummary {
            mode: plan.mode,
            filter: plan.filter.to_string(),
            mailboxes_listed: outcome.listed,
            mailboxes_processed: outcome.processed,
            records_written: outcome.written,
            include_folders: plan.include_folders,
            merge,
            snapshot_records,
            identity: self.source.resolver().stats(),
            elapsed: start.elapsed(),
        };
        info!(
            mode = %summary.mode,
            mailboxes = summary.mailboxes_processed,
            records = summary.records_written,
            snapshot_records = summary.snapshot_records,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Run complete"
        );
        Ok(summary)
    }

    /// Both scan phases.
    fn scan(&mut self, plan: &ScanPlan) -> Result<ScanOutcome> {
        let mut writer = AppendWriter::open(self.paths.path(plan.sink))?;

        let mailboxes = self.source.list_mailboxes(&plan.filter, self.result_size)?;
        info!(count = mailboxes.len(), "Listed mailboxes");

        let mut processed = 0;
        let mut emptied = Vec::new();
        for mailbox in &mailboxes {
            let mut records = self.source.mailbox_permissions(mailbox)?;
            if plan.include_folders {
                records.extend(self.source.folder_permissions(mailbox)?);
            }
            writer.append(&records)?;
            processed += 1;
            if records.is_empty() {
                emptied.push(mailbox.name.clone());
            }

            debug!(mailbox = %mailbox.name, rows = records.len(), "Mailbox done");
            if processed % PROGRESS_INTERVAL == 0 {
                info!(
                    processed,
                    total = mailboxes.len(),
                    "Scan progress"
                );
            }
        }

        debug!(path = %writer.path().display(), rows = writer.rows_written(), "Sink complete");
        Ok(ScanOutcome {
            listed: mailboxes.len(),
            processed,
            written: writer.rows_written(),
            emptied,
        })
    }
}
