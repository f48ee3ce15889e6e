//! Event watching subsystem - turns instrument signals into lifecycle events
//!
//! Every watcher, whatever its source, reduces to the same four event kinds
//! (`Initialise`, `Start`, `Measurement`, `Stop`) so processes never branch on
//! where the data came from.

pub mod csv;
pub mod file;
pub mod http;
pub mod polling;
pub mod subscription;

pub use self::csv::CsvWatcher;
pub use file::{FileWatchOptions, FileWatcher, FsChange};
pub use http::{ChangeCache, HttpFetcher, HttpTarget};
pub use polling::{Fetched, Fetcher, FixedPayload, PollingWatcher};
pub use subscription::{DataChangeHandler, SubscriptionClient, SubscriptionWatcher};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{ErrorHolder, LabError};

/// Lifecycle event category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Initialise,
    Start,
    Measurement,
    Stop,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Initialise,
        EventKind::Start,
        EventKind::Measurement,
        EventKind::Stop,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Initialise => "initialise",
            EventKind::Start => "start",
            EventKind::Measurement => "measurement",
            EventKind::Stop => "stop",
        };
        f.write_str(name)
    }
}

pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`CallbackRegistry::add`], used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Per-kind callback lists, kept in registration order
#[derive(Default)]
pub struct CallbackRegistry {
    entries: RwLock<HashMap<EventKind, Vec<(CallbackId, Callback)>>>,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: EventKind, callback: Callback) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(kind)
            .or_default()
            .push((id, callback));
        id
    }

    pub fn remove(&self, kind: EventKind, id: CallbackId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let Some(list) = entries.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        list.len() != before
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Invoke every callback for `kind` in registration order. Returns how many ran.
    ///
    /// The list is cloned first so callbacks may add or remove callbacks.
    pub fn fire(&self, kind: EventKind, payload: &Value) -> usize {
        let callbacks: Vec<Callback> = self
            .entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&kind)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        for callback in &callbacks {
            callback(payload);
        }
        callbacks.len()
    }
}

/// Common contract for every event source
pub trait EventWatcher: Send + Sync {
    /// Begin monitoring and synchronously fire the Initialise callbacks.
    fn start(&self) -> Result<(), LabError>;

    /// Halt monitoring. Idempotent; blocks until any worker has terminated.
    fn stop(&self);

    fn is_running(&self) -> bool;

    fn callbacks(&self) -> &CallbackRegistry;

    fn add_callback(&self, kind: EventKind, callback: Callback) -> CallbackId {
        self.callbacks().add(kind, callback)
    }

    fn remove_callback(&self, kind: EventKind, id: CallbackId) -> bool {
        self.callbacks().remove(kind, id)
    }
}

/// Route a watcher failure to the holder when one is attached, otherwise hand it back.
#[track_caller]
pub(crate) fn report(errors: Option<&Arc<ErrorHolder>>, error: LabError) -> Result<(), LabError> {
    match errors {
        Some(holder) => {
            holder.add_error(error);
            Ok(())
        }
        None => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let registry = CallbackRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.add(
                EventKind::Start,
                Arc::new(move |_| order.lock().unwrap().push(label)),
            );
        }

        assert_eq!(registry.fire(EventKind::Start, &json!({})), 3);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_fire_only_matching_kind() {
        let registry = CallbackRegistry::new();
        registry.add(EventKind::Stop, Arc::new(|_| {}));
        assert_eq!(registry.fire(EventKind::Start, &Value::Null), 0);
        assert_eq!(registry.fire(EventKind::Stop, &Value::Null), 1);
    }

    #[test]
    fn test_remove_callback() {
        let registry = CallbackRegistry::new();
        let id = registry.add(EventKind::Measurement, Arc::new(|_| {}));
        registry.add(EventKind::Measurement, Arc::new(|_| {}));

        assert!(registry.remove(EventKind::Measurement, id));
        assert!(!registry.remove(EventKind::Measurement, id));
        assert_eq!(registry.count(EventKind::Measurement), 1);
    }

    #[test]
    fn test_report_without_holder_returns_error() {
        let err = report(None, LabError::input("gone")).unwrap_err();
        assert_eq!(err.message(), "gone");

        let holder = Arc::new(ErrorHolder::new());
        assert!(report(Some(&holder), LabError::input("gone")).is_ok());
        assert_eq!(holder.len(), 1);
    }
}
