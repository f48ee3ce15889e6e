//! Subscription watcher - data-change notifications become Measurement events

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::{report, CallbackRegistry, EventKind, EventWatcher};
use crate::error::{ErrorHolder, LabError};

/// Receives `(node, value)` for every data change
pub type DataChangeHandler = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Client side of a subscription protocol (OPC-UA style)
pub trait SubscriptionClient: Send + Sync {
    fn endpoint(&self) -> &str;
    fn connect(&self) -> anyhow::Result<()>;
    fn disconnect(&self);
    /// Every data point the server exposes
    fn browse(&self) -> anyhow::Result<Vec<String>>;
    fn subscribe(&self, node: &str, handler: DataChangeHandler) -> anyhow::Result<()>;
}

pub struct SubscriptionWatcher {
    client: Arc<dyn SubscriptionClient>,
    nodes: Vec<String>,
    subscribed: Mutex<Vec<String>>,
    metadata: Value,
    callbacks: Arc<CallbackRegistry>,
    errors: Option<Arc<ErrorHolder>>,
    running: Arc<AtomicBool>,
}

impl SubscriptionWatcher {
    /// `nodes` empty means "whatever the server lists".
    pub fn new(
        client: Arc<dyn SubscriptionClient>,
        nodes: Vec<String>,
        metadata: Value,
        errors: Option<Arc<ErrorHolder>>,
    ) -> Self {
        Self {
            client,
            nodes,
            subscribed: Mutex::new(Vec::new()),
            metadata,
            callbacks: Arc::new(CallbackRegistry::new()),
            errors,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribed_nodes(&self) -> Vec<String> {
        self.subscribed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn handler(&self) -> DataChangeHandler {
        let callbacks = Arc::clone(&self.callbacks);
        let running = Arc::clone(&self.running);
        Arc::new(move |node: &str, value: Value| {
            // late notifications after stop are dropped
            if !running.load(Ordering::SeqCst) {
                return;
            }
            let payload = json!({
                "node": node,
                "value": value,
                "timestamp": Utc::now().to_rfc3339(),
            });
            callbacks.fire(EventKind::Measurement, &payload);
        })
    }

    fn fail(&self, error: LabError) -> Result<(), LabError> {
        self.client.disconnect();
        self.running.store(false, Ordering::SeqCst);
        report(self.errors.as_ref(), error)
    }
}

impl EventWatcher for SubscriptionWatcher {
    fn start(&self) -> Result<(), LabError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.client.connect() {
            return self.fail(LabError::input(format!(
                "cannot connect to {}: {:#}",
                self.client.endpoint(),
                e
            )));
        }

        let nodes = if self.nodes.is_empty() {
            match self.client.browse() {
                Ok(nodes) => nodes,
                Err(e) => {
                    return self.fail(LabError::input(format!(
                        "cannot browse {}: {:#}",
                        self.client.endpoint(),
                        e
                    )))
                }
            }
        } else {
            self.nodes.clone()
        };

        if nodes.is_empty() {
            warn!(endpoint = %self.client.endpoint(), "No data points to subscribe to");
        }

        let mut subscribed = Vec::with_capacity(nodes.len());
        for node in nodes {
            if let Err(e) = self.client.subscribe(&node, self.handler()) {
                return self.fail(LabError::input(format!("cannot subscribe to {}: {:#}", node, e)));
            }
            debug!(node = %node, "Subscribed");
            subscribed.push(node);
        }

        info!(
            endpoint = %self.client.endpoint(),
            nodes = subscribed.len(),
            "Subscription watcher started"
        );
        *self.subscribed.lock().unwrap_or_else(|p| p.into_inner()) = subscribed;

        self.callbacks.fire(EventKind::Initialise, &self.metadata);
        Ok(())
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.client.disconnect();
            self.subscribed.lock().unwrap_or_else(|p| p.into_inner()).clear();
            info!(endpoint = %self.client.endpoint(), "Subscription watcher stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    /// 测试用订阅客户端：记录订阅，并可手动推送变化
    #[derive(Default)]
    struct MockClient {
        fail_connect: bool,
        nodes: Vec<String>,
        handlers: Mutex<Vec<(String, DataChangeHandler)>>,
        browses: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl MockClient {
        fn push(&self, node: &str, value: Value) {
            let handlers = self.handlers.lock().unwrap().clone();
            for (subscribed, handler) in handlers {
                if subscribed == node {
                    handler(node, value.clone());
                }
            }
        }
    }

    impl SubscriptionClient for MockClient {
        fn endpoint(&self) -> &str {
            "opc.tcp://bioreactor:4840"
        }

        fn connect(&self) -> anyhow::Result<()> {
            if self.fail_connect {
                Err(anyhow!("connection refused"))
            } else {
                Ok(())
            }
        }

        fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn browse(&self) -> anyhow::Result<Vec<String>> {
            self.browses.fetch_add(1, Ordering::SeqCst);
            Ok(self.nodes.clone())
        }

        fn subscribe(&self, node: &str, handler: DataChangeHandler) -> anyhow::Result<()> {
            self.handlers.lock().unwrap().push((node.to_string(), handler));
            Ok(())
        }
    }

    fn capture(watcher: &SubscriptionWatcher) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        watcher.add_callback(
            EventKind::Measurement,
            Arc::new(move |p| sink.lock().unwrap().push(p.clone())),
        );
        seen
    }

    #[test]
    fn test_browses_when_no_nodes_configured() {
        let client = Arc::new(MockClient {
            nodes: vec!["ns=2;s=Temp".into(), "ns=2;s=pH".into()],
            ..MockClient::default()
        });
        let watcher = SubscriptionWatcher::new(client.clone(), vec![], Value::Null, None);

        watcher.start().unwrap();
        assert_eq!(client.browses.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.subscribed_nodes(), vec!["ns=2;s=Temp", "ns=2;s=pH"]);
    }

    #[test]
    fn test_configured_nodes_skip_browse() {
        let client = Arc::new(MockClient::default());
        let watcher = SubscriptionWatcher::new(client.clone(), vec!["ns=2;s=Temp".into()], Value::Null, None);

        watcher.start().unwrap();
        assert_eq!(client.browses.load(Ordering::SeqCst), 0);
        assert_eq!(watcher.subscribed_nodes().len(), 1);
    }

    #[test]
    fn test_change_maps_to_measurement() {
        let client = Arc::new(MockClient::default());
        let watcher = SubscriptionWatcher::new(client.clone(), vec!["ns=2;s=Temp".into()], Value::Null, None);
        let seen = capture(&watcher);

        watcher.start().unwrap();
        client.push("ns=2;s=Temp", json!(37.2));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["node"], "ns=2;s=Temp");
        assert_eq!(seen[0]["value"], 37.2);
        assert!(seen[0]["timestamp"].is_string());
    }

    #[test]
    fn test_changes_after_stop_are_dropped() {
        let client = Arc::new(MockClient::default());
        let watcher = SubscriptionWatcher::new(client.clone(), vec!["ns=2;s=Temp".into()], Value::Null, None);
        let seen = capture(&watcher);

        watcher.start().unwrap();
        watcher.stop();
        watcher.stop();
        client.push("ns=2;s=Temp", json!(1));

        assert!(seen.lock().unwrap().is_empty());
        assert!(!watcher.is_running());
        assert_eq!(client.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connect_failure_goes_to_holder() {
        let client = Arc::new(MockClient {
            fail_connect: true,
            ..MockClient::default()
        });
        let holder = Arc::new(ErrorHolder::new());
        let watcher = SubscriptionWatcher::new(client, vec![], Value::Null, Some(holder.clone()));

        watcher.start().unwrap();
        assert!(!watcher.is_running());

        let batch = holder.get_unseen_errors();
        assert_eq!(batch[0].0.kind(), ErrorKind::Input);
        assert!(batch[0].0.message().contains("connection refused"));
    }
}
