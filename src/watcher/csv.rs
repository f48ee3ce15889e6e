//! CSV watcher - a file watcher that hands delimited rows to its callbacks

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use super::file::{ContentFormat, FileWatchOptions, FileWatcher, FsChange};
use super::{CallbackRegistry, EventWatcher};
use crate::error::{ErrorHolder, LabError};

pub const DEFAULT_DELIMITER: char = ';';

/// Split text into rows of trimmed cells.
///
/// Blank lines are skipped. Every row must have as many cells as the first
/// one; a mismatch is reported with its 1-based line number.
pub fn parse_rows(text: &str, delimiter: char) -> Result<Vec<Vec<String>>, String> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut width = None;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: Vec<String> = line.split(delimiter).map(|cell| cell.trim().to_string()).collect();
        match width {
            None => width = Some(row.len()),
            Some(expected) if expected != row.len() => {
                return Err(format!(
                    "line {} has {} fields, expected {}",
                    idx + 1,
                    row.len(),
                    expected
                ));
            }
            Some(_) => {}
        }
        rows.push(row);
    }

    Ok(rows)
}

/// File watcher whose payloads are parsed CSV rows
///
/// Start receives every row (header included); Measurement receives the same,
/// or only the last data row when `last_line_only` is set.
pub struct CsvWatcher {
    inner: FileWatcher,
    delimiter: char,
}

impl CsvWatcher {
    pub fn new(
        options: FileWatchOptions,
        delimiter: char,
        metadata: Value,
        errors: Option<Arc<ErrorHolder>>,
    ) -> Self {
        Self {
            inner: FileWatcher::with_format(options, ContentFormat::Csv { delimiter }, metadata, errors),
            delimiter,
        }
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub fn dispatch(&self, change: FsChange) -> Result<(), LabError> {
        self.inner.dispatch(change)
    }
}

impl EventWatcher for CsvWatcher {
    fn start(&self) -> Result<(), LabError> {
        self.inner.start()
    }

    fn stop(&self) {
        self.inner.stop()
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    fn callbacks(&self) -> &CallbackRegistry {
        self.inner.callbacks()
    }
}
