//! `mailaudit status`: which snapshot files exist and what the next run would do

use super::error::HelpfulError;
use super::output::{format_number, format_timestamp, print_table};
use chrono::Duration;
use clap::Args;
use mailaudit::lock::{self, LockHolder};
use mailaudit::planner::{self, ArtifactProbe, ScanIntent, ScanPlan};
use mailaudit::snapshot;
use mailaudit::{AuditConfig, Artifact, SnapshotPaths};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Snapshot base path
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

const ARTIFACTS: [Artifact; 3] = [Artifact::Snapshot, Artifact::Delta, Artifact::Temp];

/// Files on disk and the runs they would lead to.
struct StatusReport {
    probe: ArtifactProbe,
    next_resume: Option<ScanPlan>,
    next_incremental: Option<ScanPlan>,
    holder: Option<LockHolder>,
}

fn collect(paths: &SnapshotPaths, overlap: Duration) -> mailaudit::Result<StatusReport> {
    let probe = snapshot::probe(paths)?;
    let intent = |only_new: bool, resume: bool| ScanIntent {
        only_new,
        resume,
        overlap,
        ..ScanIntent::default()
    };
    Ok(StatusReport {
        next_resume: planner::plan(&intent(false, true), &probe, paths).ok(),
        next_incremental: planner::plan(&intent(true, false), &probe, paths).ok(),
        holder: lock::current_holder(&paths.lock),
        probe,
    })
}

fn status_json(report: &StatusReport, paths: &SnapshotPaths) -> serde_json::Value {
    let probe = &report.probe;
    let files: Vec<serde_json::Value> = ARTIFACTS
        .iter()
        .map(|a| {
            let state = probe.state(*a);
            serde_json::json!({
                "artifact": a.label(),
                "path": paths.path(*a).display().to_string(),
                "exists": state.is_some(),
                "records": state.map(|s| s.records),
                "last_mailbox": state.and_then(|s| s.last_mailbox.clone()),
                "has_folder_rows": state.map(|s| s.has_folder_rows),
            })
        })
        .collect();
    serde_json::json!({
        "files": files,
        "snapshot_created": probe.snapshot_times.and_then(|t| t.created).map(|t| t.to_rfc3339()),
        "snapshot_modified": probe.snapshot_times.map(|t| t.modified.to_rfc3339()),
        "resume": report.next_resume.as_ref().map(|p| serde_json::json!({
            "mode": p.mode.to_string(),
            "filter": p.filter.to_string(),
            "include_folders": p.include_folders,
        })),
        "incremental_filter": report.next_incremental.as_ref().map(|p| p.filter.to_string()),
        "lock_holder": report.holder,
    })
}

pub fn run(args: StatusArgs, config: &AuditConfig) -> anyhow::Result<()> {
    let output = args.output.unwrap_or_else(|| config.output.clone());
    let paths = SnapshotPaths::new(&output);
    let report =
        collect(&paths, config.overlap()).map_err(|e| HelpfulError::from_audit(e, &paths))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status_json(&report, &paths))?);
        return Ok(());
    }

    let StatusReport {
        probe,
        next_resume,
        next_incremental,
        holder,
    } = report;
    print_files(&probe, &paths);
    println!();

    let mut rows = Vec::new();
    if let Some(times) = &probe.snapshot_times {
        rows.push(vec![
            "Snapshot created".to_string(),
            times
                .created
                .as_ref()
                .map(format_timestamp)
                .unwrap_or_else(|| "unknown".to_string()),
        ]);
        rows.push(vec![
            "Snapshot modified".to_string(),
            format_timestamp(&times.modified),
        ]);
    }
    rows.push(vec![
        "--only-new would list".to_string(),
        next_incremental
            .as_ref()
            .map(|p| p.filter.to_string())
            .unwrap_or_else(|| "(needs a snapshot)".to_string()),
    ]);
    rows.push(vec![
        "--resume would run".to_string(),
        next_resume
            .as_ref()
            .map(|p| format!("{} ({})", p.mode, p.filter))
            .unwrap_or_else(|| "(nothing to resume)".to_string()),
    ]);
    rows.push(vec![
        "Run lock".to_string(),
        match &holder {
            Some(h) => format!("held by pid {} ({}) since {}", h.pid, h.mode, h.timestamp),
            None => "free".to_string(),
        },
    ]);
    print_table(&["", ""], rows);
    Ok(())
}

fn print_files(probe: &ArtifactProbe, paths: &SnapshotPaths) {
    let rows = ARTIFACTS
        .iter()
        .map(|a| match probe.state(*a) {
            Some(state) => vec![
                a.label().to_string(),
                paths.path(*a).display().to_string(),
                format_number(state.records as u64),
                state.last_mailbox.clone().unwrap_or_default(),
                if state.has_folder_rows { "yes" } else { "no" }.to_string(),
            ],
            None => vec![
                a.label().to_string(),
                paths.path(*a).display().to_string(),
                "-".to_string(),
                String::new(),
                String::new(),
            ],
        })
        .collect();
    print_table(&["File", "Path", "Rows", "Last mailbox", "Folders"], rows);
}
