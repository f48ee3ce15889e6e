//! Polling watcher - a background worker that fetches on a fixed interval

use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

use super::{report, CallbackRegistry, EventKind, EventWatcher};
use crate::error::{ErrorHolder, LabError};
use crate::signal::StopSignal;

/// Up to three payloads produced by one fetch
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    pub measurement: Option<Value>,
    pub start: Option<Value>,
    pub stop: Option<Value>,
    /// Sources that failed while others in the same fetch succeeded
    pub failures: Vec<LabError>,
}

impl Fetched {
    pub fn measurement(value: Value) -> Self {
        Self {
            measurement: Some(value),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.measurement.is_none() && self.start.is_none() && self.stop.is_none()
    }
}

/// Source polled by a [`PollingWatcher`]
pub trait Fetcher: Send + 'static {
    fn fetch(&mut self) -> Result<Fetched, LabError>;
}

/// Fixed test payload: an optional start on the first fetch, then the same
/// measurement every time.
#[derive(Debug, Clone)]
pub struct FixedPayload {
    start: Option<Value>,
    measurement: Value,
}

impl FixedPayload {
    pub fn new(measurement: Value) -> Self {
        Self {
            start: None,
            measurement,
        }
    }

    pub fn with_start(mut self, start: Value) -> Self {
        self.start = Some(start);
        self
    }
}

impl Default for FixedPayload {
    fn default() -> Self {
        Self::new(json!({ "value": 42 }))
    }
}

impl Fetcher for FixedPayload {
    fn fetch(&mut self) -> Result<Fetched, LabError> {
        Ok(Fetched {
            start: self.start.take(),
            measurement: Some(self.measurement.clone()),
            stop: None,
            failures: Vec::new(),
        })
    }
}

/// Runs a [`Fetcher`] on its own thread every `interval`.
pub struct PollingWatcher<F: Fetcher> {
    name: String,
    interval: Duration,
    metadata: Value,
    callbacks: Arc<CallbackRegistry>,
    errors: Option<Arc<ErrorHolder>>,
    fetcher: Arc<Mutex<F>>,
    signal: Arc<StopSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<F: Fetcher> PollingWatcher<F> {
    pub fn new(
        name: impl Into<String>,
        fetcher: F,
        interval: Duration,
        metadata: Value,
        errors: Option<Arc<ErrorHolder>>,
    ) -> Self {
        Self {
            name: name.into(),
            interval,
            metadata,
            callbacks: Arc::new(CallbackRegistry::new()),
            errors,
            fetcher: Arc::new(Mutex::new(fetcher)),
            signal: Arc::new(StopSignal::new()),
            worker: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one fetch and dispatch whatever it produced (start, measurement, stop).
    pub fn poll_once(&self) {
        poll(&self.fetcher, &self.callbacks, self.errors.as_ref(), &self.name);
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn poll<F: Fetcher>(
    fetcher: &Mutex<F>,
    callbacks: &CallbackRegistry,
    errors: Option<&Arc<ErrorHolder>>,
    name: &str,
) {
    let fetched = fetcher.lock().unwrap_or_else(|p| p.into_inner()).fetch();
    match fetched {
        Ok(fetched) => {
            if let Some(start) = &fetched.start {
                callbacks.fire(EventKind::Start, start);
            }
            if let Some(measurement) = &fetched.measurement {
                callbacks.fire(EventKind::Measurement, measurement);
            }
            if let Some(stop) = &fetched.stop {
                callbacks.fire(EventKind::Stop, stop);
            }
            for failure in fetched.failures {
                if let Err(e) = report(errors, failure) {
                    error!(watcher = %name, error = %e, "Fetch partially failed");
                }
            }
        }
        Err(e) => {
            if let Err(e) = report(errors, e) {
                error!(watcher = %name, error = %e, "Fetch failed");
            }
        }
    }
}

impl<F: Fetcher> EventWatcher for PollingWatcher<F> {
    fn start(&self) -> Result<(), LabError> {
        let mut worker = self.lock_worker();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        self.callbacks.fire(EventKind::Initialise, &self.metadata);
        self.signal.reset();

        let fetcher = Arc::clone(&self.fetcher);
        let callbacks = Arc::clone(&self.callbacks);
        let errors = self.errors.clone();
        let signal = Arc::clone(&self.signal);
        let interval = self.interval;
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(format!("poll-{}", self.name))
            .spawn(move || {
                debug!(watcher = %name, "Polling worker running");
                loop {
                    poll(&fetcher, &callbacks, errors.as_ref(), &name);
                    if signal.wait_timeout(interval) {
                        break;
                    }
                }
                debug!(watcher = %name, "Polling worker exited");
            })
            .map_err(|e| LabError::internal(format!("cannot spawn polling worker: {}", e)))?;

        info!(watcher = %self.name, interval_ms = interval.as_millis() as u64, "Polling watcher started");
        *worker = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.signal.trigger();
        let handle = self.lock_worker().take();
        if let Some(handle) = handle {
            // a callback may stop its own watcher; joining ourselves would deadlock
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
            info!(watcher = %self.name, "Polling watcher stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.lock_worker()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }
}

impl<F: Fetcher> Drop for PollingWatcher<F> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing;

    impl Fetcher for Failing {
        fn fetch(&mut self) -> Result<Fetched, LabError> {
            Err(LabError::input("instrument offline"))
        }
    }

    #[test]
    fn test_fixed_payload_emits_start_once() {
        let mut fetcher = FixedPayload::default().with_start(json!({"run": 1}));
        let first = fetcher.fetch().unwrap();
        let second = fetcher.fetch().unwrap();

        assert_eq!(first.start, Some(json!({"run": 1})));
        assert!(second.start.is_none());
        assert_eq!(second.measurement, Some(json!({"value": 42})));
    }

    #[test]
    fn test_poll_once_dispatches_each_payload() {
        let watcher = PollingWatcher::new(
            "fixed",
            FixedPayload::default().with_start(json!({})),
            Duration::from_secs(60),
            Value::Null,
            None,
        );
        let order = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::Start, EventKind::Measurement] {
            let order = order.clone();
            watcher.add_callback(kind, Arc::new(move |_| order.lock().unwrap().push(kind)));
        }

        watcher.poll_once();
        assert_eq!(*order.lock().unwrap(), vec![EventKind::Start, EventKind::Measurement]);
    }

    #[test]
    fn test_worker_polls_until_stopped() {
        let watcher = PollingWatcher::new(
            "fixed",
            FixedPayload::default(),
            Duration::from_millis(10),
            json!({"equipment_id": "dummy"}),
            None,
        );
        let measurements = Arc::new(AtomicUsize::new(0));
        let initialised = Arc::new(AtomicUsize::new(0));
        {
            let measurements = measurements.clone();
            watcher.add_callback(
                EventKind::Measurement,
                Arc::new(move |_| {
                    measurements.fetch_add(1, Ordering::SeqCst);
                }),
            );
            let initialised = initialised.clone();
            watcher.add_callback(
                EventKind::Initialise,
                Arc::new(move |_| {
                    initialised.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        watcher.start().unwrap();
        assert!(watcher.is_running());
        assert_eq!(initialised.load(Ordering::SeqCst), 1);

        std::thread::sleep(Duration::from_millis(60));
        watcher.stop();
        assert!(!watcher.is_running());

        let seen = measurements.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several polls, saw {}", seen);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(measurements.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_fetch_errors_go_to_holder() {
        let holder = Arc::new(ErrorHolder::new());
        let watcher = PollingWatcher::new("broken", Failing, Duration::from_secs(60), Value::Null, Some(holder.clone()));

        watcher.poll_once();
        assert_eq!(holder.get_unseen_errors()[0].0.message(), "instrument offline");
    }

    struct HalfBroken;

    impl Fetcher for HalfBroken {
        fn fetch(&mut self) -> Result<Fetched, LabError> {
            Ok(Fetched {
                failures: vec![LabError::input("status endpoint offline")],
                ..Fetched::measurement(json!({"od": 0.4}))
            })
        }
    }

    #[test]
    fn test_partial_failure_dispatches_and_reports() {
        let holder = Arc::new(ErrorHolder::new());
        let watcher = PollingWatcher::new("half", HalfBroken, Duration::from_secs(60), Value::Null, Some(holder.clone()));
        let measurements = Arc::new(AtomicUsize::new(0));
        {
            let measurements = measurements.clone();
            watcher.add_callback(
                EventKind::Measurement,
                Arc::new(move |_| {
                    measurements.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        watcher.poll_once();
        assert_eq!(measurements.load(Ordering::SeqCst), 1);
        assert_eq!(holder.get_unseen_errors()[0].0.message(), "status endpoint offline");
    }

    #[test]
    fn test_restart_after_stop() {
        let watcher = PollingWatcher::new("fixed", FixedPayload::default(), Duration::from_millis(10), Value::Null, None);
        watcher.start().unwrap();
        watcher.stop();
        watcher.start().unwrap();
        assert!(watcher.is_running());
        watcher.stop();
        assert!(!watcher.is_running());
    }
}
