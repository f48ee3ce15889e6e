//! HTTP change detection - a [`Fetcher`] that only yields targets whose content changed

use reqwest::blocking::Client;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::polling::{Fetched, Fetcher};
use super::EventKind;
use crate::error::LabError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// One polled URL and the event kind its content feeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTarget {
    pub url: String,
    #[serde(default = "default_kind")]
    pub kind: EventKind,
}

fn default_kind() -> EventKind {
    EventKind::Measurement
}

impl HttpTarget {
    pub fn new(url: impl Into<String>, kind: EventKind) -> Self {
        Self { url: url.into(), kind }
    }
}

/// What one response looked like
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub value: Value,
}

/// Per-URL cache of validators and last value
#[derive(Debug, Default)]
pub struct ChangeCache {
    entries: Mutex<HashMap<String, Observation>>,
}

impl ChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare against the cached entry and store the observation if it changed.
    ///
    /// Validators win when both sides carry them (ETag first, then
    /// Last-Modified); otherwise values are compared. Decision and update
    /// happen under one lock.
    pub fn observe(&self, url: &str, observation: Observation) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());

        let changed = match entries.get(url) {
            None => true,
            Some(previous) => match (&previous.etag, &observation.etag) {
                (Some(old), Some(new)) => old != new,
                _ => match (&previous.last_modified, &observation.last_modified) {
                    (Some(old), Some(new)) => old != new,
                    _ => previous.value != observation.value,
                },
            },
        };

        if changed {
            entries.insert(url.to_string(), observation);
        }
        changed
    }

    /// Cached (ETag, Last-Modified) for a conditional request
    pub fn validators(&self, url: &str) -> (Option<String>, Option<String>) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(url)
            .map(|o| (o.etag.clone(), o.last_modified.clone()))
            .unwrap_or_default()
    }

    pub fn forget(&self, url: &str) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).remove(url);
    }
}

/// Polls a set of URLs with conditional GETs
///
/// At most one target per event kind; Initialise is not a valid target kind
/// since the watcher fires it itself on start.
pub struct HttpFetcher {
    client: Client,
    targets: Vec<HttpTarget>,
    cache: Arc<ChangeCache>,
}

impl HttpFetcher {
    pub fn new(targets: Vec<HttpTarget>) -> Result<Self, LabError> {
        Self::with_timeout(targets, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(targets: Vec<HttpTarget>, timeout: Duration) -> Result<Self, LabError> {
        if targets.is_empty() {
            return Err(LabError::adapter_build("http watcher needs at least one target"));
        }
        for (idx, target) in targets.iter().enumerate() {
            if target.kind == EventKind::Initialise {
                return Err(LabError::adapter_build(format!(
                    "{}: initialise is not a pollable event kind",
                    target.url
                )));
            }
            if targets[..idx].iter().any(|t| t.kind == target.kind) {
                return Err(LabError::adapter_build(format!(
                    "more than one http target for {} events",
                    target.kind
                )));
            }
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LabError::adapter_build(format!("cannot build http client: {}", e)))?;

        Ok(Self {
            client,
            targets,
            cache: Arc::new(ChangeCache::new()),
        })
    }

    pub fn cache(&self) -> &Arc<ChangeCache> {
        &self.cache
    }

    pub fn targets(&self) -> &[HttpTarget] {
        &self.targets
    }

    /// Fetch one URL; `None` when the server answered 304.
    fn get(&self, url: &str) -> Result<Option<Observation>, LabError> {
        let (etag, last_modified) = self.cache.validators(url);
        let mut request = self.client.get(url);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request
            .send()
            .map_err(|e| LabError::input(format!("GET {} failed: {}", url, e)))?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(LabError::input(format!("GET {} returned {}", url, response.status())));
        }

        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);

        let body = response
            .text()
            .map_err(|e| LabError::input(format!("cannot read body of {}: {}", url, e)))?;
        let value = serde_json::from_str(&body).unwrap_or(Value::String(body));

        Ok(Some(Observation {
            etag,
            last_modified,
            value,
        }))
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&mut self) -> Result<Fetched, LabError> {
        let mut fetched = Fetched::default();
        let mut failures = Vec::new();

        for target in &self.targets {
            let observation = match self.get(&target.url) {
                Ok(Some(observation)) => observation,
                Ok(None) => {
                    debug!(url = %target.url, "Not modified");
                    continue;
                }
                Err(e) => {
                    warn!(url = %target.url, error = %e, "Target fetch failed");
                    failures.push(e);
                    continue;
                }
            };
            let value = observation.value.clone();
            if !self.cache.observe(&target.url, observation) {
                continue;
            }

            match target.kind {
                EventKind::Start => fetched.start = Some(value),
                EventKind::Stop => fetched.stop = Some(value),
                EventKind::Measurement => fetched.measurement = Some(value),
                EventKind::Initialise => {}
            }
        }

        // 所有目标都失败才算整体失败，否则成功的目标照常分发
        if !failures.is_empty() && failures.len() == self.targets.len() {
            return Err(failures.remove(0));
        }
        fetched.failures = failures;
        Ok(fetched)
    }
}
