//! Time-windowed cleanup of trace files.
//!
//! Each trace file carries its creation time in its name. Files older than the
//! retention window are deleted; anything whose name can't be read as a trace
//! file is left alone.

use crate::timestamp::{parse_trace_file_name, TraceNameError};
use chrono::{NaiveDateTime, TimeDelta};
use std::ffi::OsString;
use std::path::Path;

/// What happened to one directory entry.
#[derive(Debug)]
pub enum EntryOutcome {
    Deleted,
    Retained,
    /// Name is not a trace file name. Never deleted.
    Skipped(TraceNameError),
    /// Old enough, but removal failed.
    Failed(std::io::Error),
}

/// Counts from one sweep.
///
/// `deleted` and `remaining` come from listing the directory before and
/// after, so they reflect what is actually on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub remaining: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Decide and apply the fate of a single entry.
fn sweep_entry(
    dir: &Path,
    file_name: &str,
    extension: &str,
    retention: TimeDelta,
    now: NaiveDateTime,
) -> EntryOutcome {
    let trace = match parse_trace_file_name(file_name, extension) {
        Ok(t) => t,
        Err(e) => return EntryOutcome::Skipped(e),
    };

    let age = now - trace.timestamp;
    tracing::debug!(file = file_name, pid = trace.pid, age_secs = age.num_seconds(), "trace age");
    if age <= retention {
        return EntryOutcome::Retained;
    }

    match std::fs::remove_file(dir.join(file_name)) {
        Ok(()) => EntryOutcome::Deleted,
        Err(e) => EntryOutcome::Failed(e),
    }
}

/// Names of readable entries. Unreadable ones are logged and counted as failed.
fn entry_names(
    dir: &Path,
    entries: impl Iterator<Item = std::io::Result<OsString>>,
    report: &mut SweepReport,
) -> Vec<String> {
    let mut names = Vec::new();
    for entry in entries {
        match entry {
            Ok(name) => names.push(name.to_string_lossy().into_owned()),
            Err(e) => {
                report.failed += 1;
                tracing::warn!(dir = %dir.display(), error = %e, "unable to read directory entry");
            }
        }
    }
    names
}

fn count_entries(dir: &Path) -> std::io::Result<usize> {
    Ok(std::fs::read_dir(dir)?.count())
}

/// Delete trace files in `dir` whose embedded timestamp is more than
/// `retention` before `now`.
///
/// A file exactly `retention` old is kept. Unreadable names and failed
/// deletions are logged and counted but do not stop the sweep. Only a failure
/// to list the directory is returned as an error.
pub fn sweep(
    dir: &Path,
    extension: &str,
    retention: TimeDelta,
    now: NaiveDateTime,
) -> std::io::Result<SweepReport> {
    let mut report = SweepReport::default();
    let entries = std::fs::read_dir(dir)?.map(|entry| entry.map(|e| e.file_name()));
    let names = entry_names(dir, entries, &mut report);
    let before = names.len() + report.failed;

    for name in &names {
        match sweep_entry(dir, name, extension, retention, now) {
            EntryOutcome::Deleted => {
                tracing::info!(file = %name, "deleted old trace file");
            }
            EntryOutcome::Retained => {
                tracing::debug!(file = %name, "retaining trace file");
            }
            EntryOutcome::Skipped(reason) => {
                report.skipped += 1;
                tracing::info!(file = %name, reason = %reason, "skipping unrecognized file");
            }
            EntryOutcome::Failed(e) => {
                report.failed += 1;
                tracing::warn!(file = %name, error = %e, "unable to delete trace file");
            }
        }
    }

    report.remaining = count_entries(dir)?;
    report.deleted = before.saturating_sub(report.remaining);

    tracing::info!(
        dir = %dir.display(),
        deleted = report.deleted,
        remaining = report.remaining,
        skipped = report.skipped,
        failed = report.failed,
        "sweep complete"
    );
    Ok(report)
}
