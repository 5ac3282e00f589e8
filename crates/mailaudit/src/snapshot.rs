//! On-disk CSV snapshots
//!
//! Three files share a base path:
//! - `<base>.csv`: the canonical snapshot,
//! - `<base>-NEW.csv`: delta of an incremental scan (transient),
//! - `<base>-TEMP.csv`: working file of a resumed scan (transient).
//!
//! Appends flush after every batch so a killed process leaves at most one
//! torn row behind: a final line with no newline and fewer than four columns.
//! Loads skip it and appends cut it off. Full rewrites go through a hidden temp file and an atomic rename,
//! so a failed rewrite never damages the existing snapshot.

use crate::error::{AuditError, Result};
use crate::planner::{ArtifactProbe, ArtifactState, SnapshotTimes};
use crate::record::{sort_records, PermissionRecord, CSV_HEADERS};
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DELTA_SUFFIX: &str = "-NEW";
const TEMP_SUFFIX: &str = "-TEMP";
const UTF8_BOM: &str = "\u{feff}";

/// The files a scan reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    Snapshot,
    Delta,
    Temp,
}

impl Artifact {
    pub fn label(&self) -> &'static str {
        match self {
            Artifact::Snapshot => "snapshot",
            Artifact::Delta => "delta",
            Artifact::Temp => "resume working file",
        }
    }
}

/// Paths derived from a snapshot base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    pub snapshot: PathBuf,
    pub delta: PathBuf,
    pub temp: PathBuf,
    pub lock: PathBuf,
}

impl SnapshotPaths {
    /// Derive paths from `base`; a trailing `.csv` is ignored.
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        let stem = match base.extension() {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => base.with_extension(""),
            _ => base.to_path_buf(),
        };
        let with_suffix = |suffix: &str| {
            let mut name = stem.as_os_str().to_os_string();
            name.push(suffix);
            name.push(".csv");
            PathBuf::from(name)
        };
        let snapshot = with_suffix("");
        let mut lock = snapshot.clone().into_os_string();
        lock.push(".lock");
        Self {
            delta: with_suffix(DELTA_SUFFIX),
            temp: with_suffix(TEMP_SUFFIX),
            lock: PathBuf::from(lock),
            snapshot,
        }
    }

    pub fn path(&self, artifact: Artifact) -> &Path {
        match artifact {
            Artifact::Snapshot => &self.snapshot,
            Artifact::Delta => &self.delta,
            Artifact::Temp => &self.temp,
        }
    }

    /// Ensure the parent directory of the snapshot exists.
    pub fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.snapshot.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Read all records from `path`. Missing or empty files yield no records.
pub fn load(path: &Path) -> Result<Vec<PermissionRecord>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let content = content.strip_prefix(UTF8_BOM).unwrap_or(&content);
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let content = match torn_tail(content.as_bytes()) {
        Some(0) => {
            warn!(path = %path.display(), "Snapshot holds only a partial header");
            return Ok(Vec::new());
        }
        Some(keep) => {
            warn!(path = %path.display(), "Dropping partial trailing row left by an interrupted run");
            &content[..keep]
        }
        None => content,
    };

    parse_records(path, content)
}

/// Last record of `path`, if any.
pub fn last_record(path: &Path) -> Result<Option<PermissionRecord>> {
    Ok(load(path)?.pop())
}

/// Overwrite `path` with exactly `records`, sorted by mailbox.
pub fn write_full(path: &Path, mut records: Vec<PermissionRecord>) -> Result<usize> {
    sort_records(&mut records);

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AuditError::InvalidState(format!("Bad snapshot path: {}", path.display())))?;
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name));

    debug!(path = %path.display(), temp = %temp_path.display(), rows = records.len(), "Rewriting snapshot");

    let written = write_records(&temp_path, &records).and_then(|_| {
        fs::rename(&temp_path, path)?;
        Ok(records.len())
    });
    if written.is_err() && temp_path.exists() {
        let _ = fs::remove_file(&temp_path);
        warn!(temp = %temp_path.display(), "Cleaned up temp file after failed rewrite");
    }
    written
}

/// Remove `path` if present.
pub fn delete(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "Deleted");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Append-mode writer used while a scan streams results.
pub struct AppendWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows_written: u64,
}

impl AppendWriter {
    /// Open `path` for appending, writing the header when the file is new.
    ///
    /// A partial trailing row from an interrupted run is cut off first.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len > 0 {
            repair_tail(path, &mut file)?;
        }

        let needs_header = file.metadata()?.len() == 0;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record(CSV_HEADERS)?;
            writer.flush()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows_written: 0,
        })
    }

    /// Append `records` and flush them to disk.
    pub fn append(&mut self, records: &[PermissionRecord]) -> Result<()> {
        for record in records {
            self.writer.serialize(record)?;
        }
        self.writer.flush()?;
        self.rows_written += records.len() as u64;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append `records` to `path` without touching earlier rows.
pub fn append_stream(path: &Path, records: &[PermissionRecord]) -> Result<()> {
    AppendWriter::open(path)?.append(records)
}

/// Probe which artifacts exist and summarise their content.
pub fn probe(paths: &SnapshotPaths) -> Result<ArtifactProbe> {
    let snapshot_times = if paths.snapshot.exists() {
        Some(snapshot_times(&paths.snapshot)?)
    } else {
        None
    };
    Ok(ArtifactProbe {
        snapshot: artifact_state(&paths.snapshot)?,
        snapshot_times,
        delta: artifact_state(&paths.delta)?,
        temp: artifact_state(&paths.temp)?,
    })
}

fn artifact_state(path: &Path) -> Result<Option<ArtifactState>> {
    if !path.exists() {
        return Ok(None);
    }
    let records = load(path)?;
    Ok(Some(ArtifactState {
        records: records.len(),
        last_mailbox: records.last().map(|r| r.mailbox.clone()),
        has_folder_rows: records.iter().any(|r| r.is_folder_level()),
    }))
}

/// Creation and modification time of the snapshot file.
pub fn snapshot_times(path: &Path) -> Result<SnapshotTimes> {
    let metadata = fs::metadata(path)?;
    let modified: DateTime<Utc> = metadata.modified()?.into();
    let created = metadata.created().ok().map(DateTime::<Utc>::from);
    Ok(SnapshotTimes { created, modified })
}

fn write_records(path: &Path, records: &[PermissionRecord]) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record(CSV_HEADERS)?;
    for record in records {
        writer.serialize(record)?;
    }
    let file = writer
        .into_inner()
        .map_err(|e| AuditError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

fn parse_records(path: &Path, content: &str) -> Result<Vec<PermissionRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(content.as_bytes());

    let headers = reader.headers()?.clone();
    let header_ok = headers.len() == CSV_HEADERS.len()
        && headers
            .iter()
            .zip(CSV_HEADERS)
            .all(|(found, expected)| found.eq_ignore_ascii_case(expected));
    if !header_ok {
        return Err(AuditError::InvalidState(format!(
            "{} does not look like a permission snapshot (header: {:?})",
            path.display(),
            headers.iter().collect::<Vec<_>>()
        )));
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        records.push(PermissionRecord {
            mailbox: row.get(0).unwrap_or_default().to_string(),
            folder_path: row.get(1).unwrap_or_default().to_string(),
            grantee: row.get(2).unwrap_or_default().to_string(),
            access_rights: row.get(3).unwrap_or_default().to_string(),
        });
    }
    Ok(records)
}

/// Byte offset where a torn final row starts, if there is one.
///
/// A row is torn when the content does not end in a newline and the last
/// row is short of the four columns. A complete final row without a newline
/// is kept.
fn torn_tail(content: &[u8]) -> Option<usize> {
    if content.is_empty() || content.ends_with(b"\n") {
        return None;
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content);
    let mut record = csv::ByteRecord::new();
    let mut last = None;
    while let Ok(true) = reader.read_byte_record(&mut record) {
        let start = record.position().map(|p| p.byte()).unwrap_or(0);
        last = Some((start, record.len()));
    }
    match last {
        Some((start, columns)) if columns < CSV_HEADERS.len() => Some(start as usize),
        _ => None,
    }
}

/// Make sure appends start on a fresh line after any interrupted run.
fn repair_tail(path: &Path, file: &mut File) -> Result<()> {
    let bytes = fs::read(path)?;
    if bytes.ends_with(b"\n") {
        return Ok(());
    }
    match torn_tail(&bytes) {
        Some(keep) => {
            warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() - keep,
                "Truncating partial trailing row before appending"
            );
            file.set_len(keep as u64)?;
        }
        None => {
            debug!(path = %path.display(), "Terminating last row before appending");
            file.write_all(b"\n")?;
        }
    }
    file.seek(SeekFrom::End(0))?;
    Ok(())
}
