//! Load-time validation of the record log.
//!
//! A crash mid-append leaves a torn trailing line; disk damage can leave a
//! garbled line anywhere. Either way the store must still open. Lines that do
//! not parse as a record are quarantined to `<log>.corrupt` (appended, never
//! overwritten) and the log is rewritten without them.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::StoreError;
use crate::store::record::ProcessingItem;

/// What loading the log found.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadReport {
    /// Valid record lines (snapshots, so one item may appear many times).
    pub lines_loaded: usize,
    /// Lines moved to the quarantine file.
    pub lines_quarantined: usize,
    /// Where quarantined lines went, if any were found.
    pub quarantine_path: Option<PathBuf>,
}

/// Sibling file that receives corrupted lines.
pub fn quarantine_path(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

/// Read every record snapshot from the log, quarantining lines that fail to parse.
///
/// Returns the snapshots in file order. A missing file yields no records.
pub fn load_log(path: &Path) -> Result<(Vec<ProcessingItem>, LoadReport), StoreError> {
    if !path.exists() {
        return Ok((Vec::new(), LoadReport::default()));
    }

    let content = fs::read(path)?;
    let mut records = Vec::new();
    let mut good_lines: Vec<&[u8]> = Vec::new();
    let mut bad_lines: Vec<&[u8]> = Vec::new();

    for (index, raw) in content.split(|&b| b == b'\n').enumerate() {
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<ProcessingItem>(raw) {
            Ok(item) => {
                records.push(item);
                good_lines.push(raw);
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Unreadable record line, quarantining"
                );
                bad_lines.push(raw);
            }
        }
    }

    let mut report = LoadReport {
        lines_loaded: records.len(),
        ..Default::default()
    };

    if bad_lines.is_empty() {
        return Ok((records, report));
    }

    let backup = quarantine_path(path);
    let mut quarantine = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&backup)?;
    for line in &bad_lines {
        quarantine.write_all(line)?;
        quarantine.write_all(b"\n")?;
    }
    quarantine.sync_all()?;

    rewrite_lines(path, &good_lines)?;

    warn!(
        path = %path.display(),
        quarantined = bad_lines.len(),
        kept = records.len(),
        backup = %backup.display(),
        "Record log repaired"
    );

    report.lines_quarantined = bad_lines.len();
    report.quarantine_path = Some(backup);
    Ok((records, report))
}

/// Atomically replace the log with the given lines (temp file, fsync, rename).
fn rewrite_lines(path: &Path, lines: &[&[u8]]) -> Result<(), StoreError> {
    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        for line in lines {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Scratch path used while rewriting the log.
pub fn temp_path(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
