//! File watcher - OS file-system notifications for a single file
//!
//! - create: read the whole file, fire Start
//! - modify: debounced, read the content (or only its last line), fire Measurement
//! - delete: fire Stop with a timestamp
//!
//! A create suppresses the modify burst that usually follows it within the
//! debounce window.

use chrono::Utc;
use notify::event::{EventKind as FsEventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::{report, CallbackRegistry, EventKind, EventWatcher};
use crate::error::{ErrorHolder, LabError};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(750);

/// Change observed on the watched file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsChange {
    Created,
    Modified,
    Removed,
}

impl FsChange {
    fn from_event_kind(kind: &FsEventKind) -> Option<Self> {
        match kind {
            FsEventKind::Create(_) => Some(FsChange::Created),
            FsEventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(FsChange::Created),
            FsEventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(FsChange::Removed),
            FsEventKind::Modify(ModifyKind::Data(_)) | FsEventKind::Modify(ModifyKind::Any) => {
                Some(FsChange::Modified)
            }
            FsEventKind::Remove(_) => Some(FsChange::Removed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileWatchOptions {
    pub path: PathBuf,
    pub debounce: Duration,
    /// Only hand the last non-empty line to Measurement callbacks
    pub last_line_only: bool,
}

impl FileWatchOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            debounce: DEFAULT_DEBOUNCE,
            last_line_only: false,
        }
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn last_line_only(mut self, last_line_only: bool) -> Self {
        self.last_line_only = last_line_only;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ContentFormat {
    Text,
    Csv { delimiter: char },
}

#[derive(Debug, Default)]
struct Debounce {
    last_created: Option<Instant>,
    last_modified: Option<Instant>,
}

struct FileWatchCore {
    options: FileWatchOptions,
    format: ContentFormat,
    metadata: Value,
    callbacks: CallbackRegistry,
    errors: Option<Arc<ErrorHolder>>,
    debounce: Mutex<Debounce>,
}

impl FileWatchCore {
    fn dispatch(&self, change: FsChange) -> Result<(), LabError> {
        match self.handle(change) {
            Ok(()) => Ok(()),
            Err(e) => report(self.errors.as_ref(), e),
        }
    }

    fn handle(&self, change: FsChange) -> Result<(), LabError> {
        let now = Instant::now();
        match change {
            FsChange::Created => {
                self.debounce().last_created = Some(now);
                let content = self.read(false)?;
                self.callbacks.fire(EventKind::Start, &content);
            }
            FsChange::Modified => {
                {
                    let mut debounce = self.debounce();
                    let window = self.options.debounce;
                    let recent = |at: Option<Instant>| at.is_some_and(|t| now.duration_since(t) < window);
                    if recent(debounce.last_created) || recent(debounce.last_modified) {
                        debug!(path = %self.options.path.display(), "Modify suppressed by debounce");
                        return Ok(());
                    }
                    debounce.last_modified = Some(now);
                }
                let content = self.read(self.options.last_line_only)?;
                self.callbacks.fire(EventKind::Measurement, &content);
            }
            FsChange::Removed => {
                let payload = json!({ "timestamp": Utc::now().to_rfc3339() });
                self.callbacks.fire(EventKind::Stop, &payload);
            }
        }
        Ok(())
    }

    fn read(&self, last_line_only: bool) -> Result<Value, LabError> {
        let path = &self.options.path;
        let text = fs::read_to_string(path).map_err(|e| io_error(path, &e))?;

        match self.format {
            ContentFormat::Text => {
                if last_line_only {
                    Ok(Value::String(last_line(&text).to_string()))
                } else {
                    Ok(Value::String(text))
                }
            }
            ContentFormat::Csv { delimiter } => {
                let rows = super::csv::parse_rows(&text, delimiter)
                    .map_err(|e| LabError::input(format!("malformed CSV in {}: {}", path.display(), e)))?;
                let rows = if last_line_only {
                    // header only: nothing measured yet
                    if rows.len() < 2 {
                        Vec::new()
                    } else {
                        rows.last().cloned().into_iter().collect()
                    }
                } else {
                    rows
                };
                Ok(json!(rows))
            }
        }
    }

    fn debounce(&self) -> MutexGuard<'_, Debounce> {
        self.debounce.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
}

/// Map an IO failure to a distinct InputError message
pub(crate) fn io_error(path: &Path, e: &io::Error) -> LabError {
    let message = match e.kind() {
        io::ErrorKind::PermissionDenied => format!("permission denied reading {}", path.display()),
        io::ErrorKind::NotFound => format!("file not found: {}", path.display()),
        io::ErrorKind::InvalidData => format!("cannot decode {}: {}", path.display(), e),
        _ => format!("I/O error on {}: {}", path.display(), e),
    };
    LabError::input(message)
}

fn notify_error(path: &Path, e: &notify::Error) -> LabError {
    match &e.kind {
        notify::ErrorKind::MaxFilesWatch => {
            LabError::input(format!("watch limit exhausted while watching {}", path.display()))
        }
        notify::ErrorKind::PathNotFound => {
            LabError::input(format!("file not found: {}", path.display()))
        }
        notify::ErrorKind::Io(io) => io_error(path, io),
        _ => LabError::input(format!("file notification error on {}: {}", path.display(), e)),
    }
}

/// Watches one file through OS notifications.
///
/// The parent directory is watched non-recursively so the file can be
/// created and deleted while the watch is held.
pub struct FileWatcher {
    core: Arc<FileWatchCore>,
    notifier: Mutex<Option<RecommendedWatcher>>,
}

impl FileWatcher {
    pub fn new(options: FileWatchOptions, metadata: Value, errors: Option<Arc<ErrorHolder>>) -> Self {
        Self::with_format(options, ContentFormat::Text, metadata, errors)
    }

    pub(crate) fn with_format(
        options: FileWatchOptions,
        format: ContentFormat,
        metadata: Value,
        errors: Option<Arc<ErrorHolder>>,
    ) -> Self {
        Self {
            core: Arc::new(FileWatchCore {
                options,
                format,
                metadata,
                callbacks: CallbackRegistry::new(),
                errors,
                debounce: Mutex::new(Debounce::default()),
            }),
            notifier: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.core.options.path
    }

    /// Feed one change through the create/modify/delete handlers.
    ///
    /// This is what the OS notification callback calls; failures go to the
    /// error holder when one is attached, otherwise they are returned.
    pub fn dispatch(&self, change: FsChange) -> Result<(), LabError> {
        self.core.dispatch(change)
    }

    fn lock_notifier(&self) -> MutexGuard<'_, Option<RecommendedWatcher>> {
        self.notifier.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl EventWatcher for FileWatcher {
    fn start(&self) -> Result<(), LabError> {
        {
            let mut slot = self.lock_notifier();
            if slot.is_some() {
                return Ok(());
            }

            let core = Arc::clone(&self.core);
            let file_name = self.core.options.path.file_name().map(|n| n.to_os_string());
            let handler = move |result: notify::Result<notify::Event>| match result {
                Ok(event) => {
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if !ours {
                        return;
                    }
                    if let Some(change) = FsChange::from_event_kind(&event.kind) {
                        if let Err(e) = core.dispatch(change) {
                            error!(path = %core.options.path.display(), error = %e, "File event failed");
                        }
                    }
                }
                Err(e) => {
                    let err = notify_error(&core.options.path, &e);
                    if let Err(e) = report(core.errors.as_ref(), err) {
                        error!(path = %core.options.path.display(), error = %e, "File notification failed");
                    }
                }
            };

            let path = &self.core.options.path;
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };

            let mut watcher = match notify::recommended_watcher(handler) {
                Ok(watcher) => watcher,
                Err(e) => return report(self.core.errors.as_ref(), notify_error(path, &e)),
            };
            if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                return report(self.core.errors.as_ref(), notify_error(path, &e));
            }

            info!(path = %path.display(), "File watcher started");
            *slot = Some(watcher);
        }

        self.core.callbacks.fire(EventKind::Initialise, &self.core.metadata);
        Ok(())
    }

    fn stop(&self) {
        // dropping the notify watcher unregisters the OS watch
        if self.lock_notifier().take().is_some() {
            info!(path = %self.core.options.path.display(), "File watcher stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.lock_notifier().is_some()
    }

    fn callbacks(&self) -> &CallbackRegistry {
        &self.core.callbacks
    }
}
