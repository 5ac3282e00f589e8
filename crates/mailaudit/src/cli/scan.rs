//! `mailaudit scan`

use super::error::HelpfulError;
use super::output::{format_duration, format_number, print_table};
use clap::Args;
use mailaudit::identity::IdentityResolver;
use mailaudit::{
    AuditConfig, ExclusionPolicy, MailboxPermissionSource, MemoryDirectory, ResultSize,
    RunSummary, ScanIntent, Scanner, SnapshotPaths,
};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Snapshot base path (`.csv`, `-NEW.csv` and `-TEMP.csv` are derived from it)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Tenant mail domain, e.g. contoso.com
    #[arg(long, env = "MAILAUDIT_EMAIL_DOMAIN")]
    pub email_domain: Option<String>,

    /// Maximum mailboxes to list (a number or "unlimited")
    #[arg(long)]
    pub result_size: Option<ResultSize>,

    /// Only mailboxes changed since the snapshot was taken
    #[arg(long)]
    pub only_new: bool,

    /// Continue an interrupted scan
    #[arg(long)]
    pub resume: bool,

    /// Include folder-level permissions
    #[arg(long)]
    pub include_folders: bool,

    /// Use the snapshot's modification time instead of its creation time
    #[arg(long)]
    pub use_modified_date: bool,

    /// Tenant export to read mailboxes and identities from
    #[arg(long)]
    pub directory: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: ScanArgs, config: &AuditConfig) -> anyhow::Result<()> {
    let output = args.output.clone().unwrap_or_else(|| config.output.clone());
    let paths = SnapshotPaths::new(&output);

    let email_domain = args
        .email_domain
        .as_deref()
        .map(mailaudit::source::normalize_domain)
        .or_else(|| config.email_domain())
        .filter(|d| d.len() > 1)
        .ok_or_else(HelpfulError::missing_email_domain)?;
    let directory_path = args
        .directory
        .clone()
        .or_else(|| config.directory.clone())
        .ok_or_else(HelpfulError::missing_directory)?;
    let result_size = args.result_size.unwrap_or(config.result_size);

    let directory = MemoryDirectory::load(&directory_path)
        .map_err(|e| HelpfulError::from_audit(e, &paths))?;

    let policy = ExclusionPolicy::new(email_domain).with_ignored(config.ignored_grantees.clone());
    let source =
        MailboxPermissionSource::new(&directory, IdentityResolver::new(&directory), policy);
    let mut scanner = Scanner::new(source, paths.clone(), result_size);

    let intent = ScanIntent {
        only_new: args.only_new,
        resume: args.resume,
        include_folders: args.include_folders || config.include_folders,
        use_modified_date: args.use_modified_date,
        overlap: config.overlap(),
    };
    let summary = scanner
        .run(&intent)
        .map_err(|e| HelpfulError::from_audit(e, &paths))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary_json(&summary, &paths))?);
    } else {
        print_summary(&summary, &paths);
    }
    Ok(())
}

fn summary_json(summary: &RunSummary, paths: &SnapshotPaths) -> serde_json::Value {
    serde_json::json!({
        "mode": summary.mode.to_string(),
        "filter": summary.filter,
        "snapshot": paths.snapshot.display().to_string(),
        "mailboxes_listed": summary.mailboxes_listed,
        "mailboxes_processed": summary.mailboxes_processed,
        "records_written": summary.records_written,
        "include_folders": summary.include_folders,
        "snapshot_records": summary.snapshot_records,
        "merge": summary.merge.map(|m| serde_json::json!({
            "touched_mailboxes": m.touched_mailboxes,
            "new_records": m.new_records,
            "kept_records": m.kept_records,
            "replaced_records": m.replaced_records,
        })),
        "identity_lookups": summary.identity.lookups,
        "identity_cache_hits": summary.identity.cache_hits,
        "identity_fallbacks": summary.identity.fallbacks,
        "elapsed_ms": summary.elapsed.as_millis() as u64,
    })
}

fn print_summary(summary: &RunSummary, paths: &SnapshotPaths) {
    println!("Scan complete: {}", summary.mode);
    println!();

    let mut rows = vec![
        vec!["Filter".to_string(), summary.filter.clone()],
        vec![
            "Mailboxes".to_string(),
            format!(
                "{} of {} listed",
                format_number(summary.mailboxes_processed as u64),
                format_number(summary.mailboxes_listed as u64)
            ),
        ],
        vec![
            "Rows written".to_string(),
            format_number(summary.records_written),
        ],
        vec![
            "Folder permissions".to_string(),
            if summary.include_folders { "yes" } else { "no" }.to_string(),
        ],
    ];
    if let Some(merge) = &summary.merge {
        rows.push(vec![
            "Merged".to_string(),
            format!(
                "{} mailboxes updated, {} rows replaced, {} kept",
                format_number(merge.touched_mailboxes as u64),
                format_number(merge.replaced_records as u64),
                format_number(merge.kept_records as u64)
            ),
        ]);
    }
    rows.push(vec![
        "Identity lookups".to_string(),
        format!(
            "{} ({} cached, {} unresolved)",
            summary.identity.lookups, summary.identity.cache_hits, summary.identity.fallbacks
        ),
    ]);
    rows.push(vec![
        "Snapshot".to_string(),
        format!(
            "{} ({} rows)",
            paths.snapshot.display(),
            format_number(summary.snapshot_records as u64)
        ),
    ]);
    rows.push(vec!["Elapsed".to_string(), format_duration(summary.elapsed)]);

    print_table(&["", ""], rows);
}
