//! End-to-end tests for mailaudit
//!
//! Runs full, incremental and resumed scans against an in-memory tenant and
//! checks the snapshot files they leave behind.

use chrono::{DateTime, Duration, TimeZone, Utc};
use filetime::{set_file_mtime, FileTime};
use mailaudit::identity::{DirectoryObject, IdentityResolver};
use mailaudit::planner::ResumeOf;
use mailaudit::snapshot;
use mailaudit::source::{FolderGrant, MailboxGrant};
use mailaudit::{
    AuditError, ExclusionPolicy, MailboxPermissionSource, MemoryDirectory, PermissionRecord,
    ResultSize, RunSummary, ScanIntent, ScanMode, Scanner, SnapshotPaths,
};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Create a test environment with a temp output directory
struct TestEnv {
    /// Temp directory (cleaned up on drop)
    _temp: TempDir,
    /// Snapshot base path
    pub base: PathBuf,
    /// The tenant being audited
    pub tenant: MemoryDirectory,
}

impl TestEnv {
    fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let base = temp.path().join("audit").join("MailboxPermissions");

        let mut tenant = MemoryDirectory::new();
        for (name, user) in [("M1", "alice"), ("M2", "bob"), ("M3", "carol")] {
            tenant.add_mailbox(name, long_ago(), vec![grant(user, "FullAccess")], Vec::new());
        }

        Self {
            _temp: temp,
            base,
            tenant,
        }
    }

    fn paths(&self) -> SnapshotPaths {
        SnapshotPaths::new(&self.base)
    }

    fn run(&self, intent: ScanIntent) -> mailaudit::Result<RunSummary> {
        let source = MailboxPermissionSource::new(
            &self.tenant,
            IdentityResolver::new(&self.tenant),
            ExclusionPolicy::new("contoso.com"),
        );
        Scanner::new(source, self.paths(), ResultSize::Unlimited).run(&intent)
    }

    fn snapshot(&self) -> Vec<PermissionRecord> {
        snapshot::load(&self.paths().snapshot).expect("Failed to load snapshot")
    }

    /// Replace a mailbox's grants and stamp it as changed now.
    fn change(&mut self, name: &str, user: &str) {
        self.tenant
            .add_mailbox(name, Utc::now(), vec![grant(user, "FullAccess")], Vec::new());
    }
}

fn long_ago() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
}

fn grant(user: &str, right: &str) -> MailboxGrant {
    MailboxGrant {
        user: user.to_string(),
        access_rights: vec![right.to_string()],
        is_inherited: false,
        deny: false,
    }
}

fn row(mailbox: &str, grantee: &str) -> PermissionRecord {
    PermissionRecord::mailbox_level(mailbox, grantee, "FullAccess")
}

fn full() -> ScanIntent {
    ScanIntent::default()
}

fn only_new() -> ScanIntent {
    ScanIntent {
        only_new: true,
        ..ScanIntent::default()
    }
}

fn resume() -> ScanIntent {
    ScanIntent {
        resume: true,
        ..ScanIntent::default()
    }
}

// ============================================================================
// Full and incremental scans
// ============================================================================

#[test]
fn test_full_then_incremental() {
    let mut env = TestEnv::new();
    env.run(full()).unwrap();
    assert_eq!(
        env.snapshot(),
        vec![row("M1", "alice"), row("M2", "bob"), row("M3", "carol")]
    );

    env.tenant.add_object(DirectoryObject {
        name: "erin".to_string(),
        user_principal_name: Some("erin@contoso.com".to_string()),
        sid: Some("S-1-5-21-1004336348-1177238915-682003330-1105".to_string()),
        display_name: Some("Erin".to_string()),
    });
    env.change("M2", "dave");
    env.change("M4", "S-1-5-21-1004336348-1177238915-682003330-1105");

    let summary = env.run(only_new()).unwrap();
    assert_eq!(summary.mode, ScanMode::Incremental);
    assert_eq!(summary.mailboxes_processed, 2);
    assert_eq!(summary.identity.lookups, 1);

    let merge = summary.merge.unwrap();
    assert_eq!(merge.touched_mailboxes, 2);
    assert_eq!(merge.kept_records, 2);

    assert_eq!(
        env.snapshot(),
        vec![
            row("M1", "alice"),
            row("M2", "dave"),
            row("M3", "carol"),
            row("M4", "erin@contoso.com"),
        ]
    );
    assert!(!env.paths().delta.exists());
    assert!(!env.paths().temp.exists());
}

#[test]
fn test_full_scan_replaces_existing_snapshot() {
    let mut env = TestEnv::new();
    env.run(full()).unwrap();

    env.tenant
        .add_mailbox("M1", long_ago(), Vec::new(), Vec::new());
    let summary = env.run(full()).unwrap();

    assert_eq!(summary.mailboxes_processed, 3);
    assert_eq!(env.snapshot(), vec![row("M2", "bob"), row("M3", "carol")]);
}

#[test]
fn test_self_grant_only_mailbox_drops_out() {
    let mut env = TestEnv::new();
    env.run(full()).unwrap();

    env.tenant.add_mailbox(
        "M1",
        Utc::now(),
        vec![grant("M1@contoso.com", "FullAccess")],
        Vec::new(),
    );
    let summary = env.run(only_new()).unwrap();

    assert_eq!(summary.mailboxes_processed, 1);
    assert_eq!(summary.records_written, 0);
    assert_eq!(env.snapshot(), vec![row("M2", "bob"), row("M3", "carol")]);
}

#[test]
fn test_use_modified_date_widens_window() {
    let mut env = TestEnv::new();
    env.run(full()).unwrap();

    let now = Utc::now();
    env.tenant.add_mailbox(
        "M2",
        now - Duration::days(5),
        vec![grant("dave", "FullAccess")],
        Vec::new(),
    );
    let ten_days_ago = now - Duration::days(10);
    set_file_mtime(
        &env.paths().snapshot,
        FileTime::from_unix_time(ten_days_ago.timestamp(), 0),
    )
    .unwrap();

    let summary = env
        .run(ScanIntent {
            use_modified_date: true,
            ..only_new()
        })
        .unwrap();
    assert_eq!(summary.mailboxes_processed, 1);
    assert!(env.snapshot().contains(&row("M2", "dave")));
}

#[test]
fn test_stale_delta_is_discarded() {
    let env = TestEnv::new();
    env.run(full()).unwrap();

    snapshot::append_stream(&env.paths().delta, &[row("M9", "mallory")]).unwrap();
    env.run(only_new()).unwrap();

    assert!(!env.snapshot().iter().any(|r| r.mailbox == "M9"));
    assert!(!env.paths().delta.exists());
}

#[test]
fn test_incremental_and_resume_need_a_snapshot() {
    let env = TestEnv::new();

    for intent in [only_new(), resume()] {
        let err = env.run(intent).unwrap_err();
        assert!(matches!(err, AuditError::MissingSnapshot(_)));
    }
    assert!(!env.paths().snapshot.exists());
}

// ============================================================================
// Interrupted runs
// ============================================================================

#[test]
fn test_interrupted_incremental_resumes() {
    let mut env = TestEnv::new();
    env.run(full()).unwrap();
    let before = env.snapshot();

    for (name, user) in [("M1", "a2"), ("M2", "b2"), ("M3", "c2"), ("M4", "d2")] {
        env.change(name, user);
    }
    env.tenant.fail_after(2);

    let err = env.run(only_new()).unwrap_err();
    assert!(err.is_resumable());
    assert_eq!(env.snapshot(), before);
    assert_eq!(
        snapshot::load(&env.paths().delta).unwrap(),
        vec![row("M1", "a2"), row("M2", "b2")]
    );

    env.tenant.recover();
    let summary = env.run(resume()).unwrap();
    assert_eq!(summary.mode, ScanMode::Resume(ResumeOf::Incremental));
    assert_eq!(summary.mailboxes_processed, 2);

    assert_eq!(
        env.snapshot(),
        vec![row("M1", "a2"), row("M2", "b2"), row("M3", "c2"), row("M4", "d2")]
    );
    assert!(!env.paths().delta.exists());
    assert!(!env.paths().temp.exists());
}

#[test]
fn test_interrupted_resume_resumes_again() {
    let mut env = TestEnv::new();
    env.run(full()).unwrap();

    for (name, user) in [
        ("M1", "a2"),
        ("M2", "b2"),
        ("M3", "c2"),
        ("M4", "d2"),
        ("M5", "e2"),
    ] {
        env.change(name, user);
    }

    env.tenant.fail_after(1);
    assert!(env.run(only_new()).is_err());

    env.tenant.fail_after(2);
    assert!(env.run(resume()).is_err());
    assert_eq!(
        snapshot::load(&env.paths().temp).unwrap(),
        vec![row("M2", "b2"), row("M3", "c2")]
    );

    env.tenant.recover();
    let summary = env.run(resume()).unwrap();
    assert_eq!(summary.mode, ScanMode::Resume(ResumeOf::WorkingFile));
    assert_eq!(summary.mailboxes_processed, 2);

    assert_eq!(
        env.snapshot(),
        vec![
            row("M1", "a2"),
            row("M2", "b2"),
            row("M3", "c2"),
            row("M4", "d2"),
            row("M5", "e2"),
        ]
    );
    assert!(!env.paths().delta.exists());
    assert!(!env.paths().temp.exists());
}

#[test]
fn test_interrupted_full_scan_resumes() {
    let mut env = TestEnv::new();
    env.tenant.fail_after(2);
    assert!(env.run(full()).is_err());
    assert_eq!(env.snapshot(), vec![row("M1", "alice"), row("M2", "bob")]);

    env.tenant.recover();
    let summary = env.run(resume()).unwrap();
    assert_eq!(summary.mode, ScanMode::Resume(ResumeOf::FullScan));
    assert_eq!(summary.mailboxes_processed, 1);
    assert_eq!(
        env.snapshot(),
        vec![row("M1", "alice"), row("M2", "bob"), row("M3", "carol")]
    );
}

#[test]
fn test_failed_full_scan_keeps_existing_snapshot() {
    let mut env = TestEnv::new();
    env.run(full()).unwrap();
    let before = env.snapshot();

    env.change("M1", "a2");
    env.change("M3", "c2");
    env.tenant.add_mailbox("M2", long_ago(), Vec::new(), Vec::new());
    env.tenant.fail_after(2);
    let err = env.run(full()).unwrap_err();
    assert!(err.is_resumable());
    assert_eq!(env.snapshot(), before);
    assert_eq!(
        snapshot::load(&env.paths().temp).unwrap(),
        vec![row("M1", "a2")]
    );

    env.tenant.recover();
    let summary = env.run(resume()).unwrap();
    assert_eq!(summary.mode, ScanMode::Resume(ResumeOf::FullScan));
    assert_eq!(summary.filter, "Name -gt 'M1' -and WhenChanged -gt '1970-01-01T00:00:00Z'");
    assert_eq!(summary.mailboxes_processed, 2);
    assert!(summary.merge.is_none());

    // M2 lost its grant during the interrupted run and must not come back.
    assert_eq!(env.snapshot(), vec![row("M1", "a2"), row("M3", "c2")]);
    assert!(!env.paths().temp.exists());
}

#[test]
fn test_full_scan_failing_before_first_row_restarts() {
    let mut env = TestEnv::new();
    env.run(full()).unwrap();
    let before = env.snapshot();

    env.tenant.fail_after(0);
    assert!(env.run(full()).is_err());
    assert_eq!(env.snapshot(), before);

    env.tenant.recover();
    env.change("M2", "b2");
    let summary = env.run(resume()).unwrap();
    assert_eq!(summary.mode, ScanMode::Resume(ResumeOf::FullScan));
    assert_eq!(summary.filter, "*");
    assert_eq!(summary.mailboxes_processed, 3);
    assert_eq!(
        env.snapshot(),
        vec![row("M1", "alice"), row("M2", "b2"), row("M3", "carol")]
    );
}

#[test]
fn test_first_full_scan_failing_before_first_row_restarts() {
    let mut env = TestEnv::new();
    env.tenant.fail_after(0);
    assert!(env.run(full()).is_err());
    assert!(env.snapshot().is_empty());

    env.tenant.recover();
    let summary = env.run(resume()).unwrap();
    assert_eq!(summary.mailboxes_processed, 3);
    assert_eq!(
        env.snapshot(),
        vec![row("M1", "alice"), row("M2", "bob"), row("M3", "carol")]
    );
}

#[test]
fn test_snapshot_without_final_newline_keeps_last_row() {
    let mut env = TestEnv::new();
    env.paths().ensure_parent().unwrap();
    fs::write(
        &env.paths().snapshot,
        "Mailbox,FolderPath,UserGivenAccess,AccessRights\nM1,,alice,FullAccess\nM2,,bob,FullAccess",
    )
    .unwrap();

    env.change("M3", "c2");
    env.run(only_new()).unwrap();
    assert_eq!(
        env.snapshot(),
        vec![row("M1", "alice"), row("M2", "bob"), row("M3", "c2")]
    );
}

#[test]
fn test_resume_keeps_folder_scope() {
    let mut env = TestEnv::new();
    for name in ["M1", "M2"] {
        env.tenant.add_mailbox(
            name,
            long_ago(),
            vec![grant("alice", "FullAccess")],
            vec![FolderGrant {
                folder_path: "\\Calendar".to_string(),
                user: "Dave".to_string(),
                access_rights: vec!["Reviewer".to_string()],
            }],
        );
    }
    env.tenant.fail_after(1);
    let err = env
        .run(ScanIntent {
            include_folders: true,
            ..full()
        })
        .unwrap_err();
    assert!(err.is_resumable());

    env.tenant.recover();
    let summary = env.run(resume()).unwrap();
    assert!(summary.include_folders);

    let folder_rows: Vec<String> = env
        .snapshot()
        .into_iter()
        .filter(|r| r.is_folder_level())
        .map(|r| r.mailbox)
        .collect();
    assert_eq!(folder_rows, vec!["M1", "M2"]);
}

#[test]
fn test_crash_mid_row_is_repaired_on_resume() {
    let mut env = TestEnv::new();
    env.run(full()).unwrap();
    for (name, user) in [("M1", "a2"), ("M2", "b2"), ("M3", "c2")] {
        env.change(name, user);
    }
    env.tenant.fail_after(1);
    assert!(env.run(only_new()).is_err());

    // simulate a kill while the next row was being written
    let delta = env.paths().delta;
    let mut text = fs::read_to_string(&delta).unwrap();
    text.push_str("M2,,b");
    fs::write(&delta, text).unwrap();

    env.tenant.recover();
    env.run(resume()).unwrap();
    assert_eq!(
        env.snapshot(),
        vec![row("M1", "a2"), row("M2", "b2"), row("M3", "c2")]
    );
}

#[test]
fn test_result_size_caps_listing() {
    let env = TestEnv::new();
    let source = MailboxPermissionSource::new(
        &env.tenant,
        IdentityResolver::new(&env.tenant),
        ExclusionPolicy::new("contoso.com"),
    );
    let mut scanner = Scanner::new(source, env.paths(), "2".parse().unwrap());

    let summary = scanner.run(&full()).unwrap();
    assert_eq!(summary.mailboxes_listed, 2);
    assert_eq!(scanner.paths().snapshot, env.paths().snapshot);
    assert_eq!(env.snapshot(), vec![row("M1", "alice"), row("M2", "bob")]);
}
