//! HTTP 输出端 - 将消息 POST 到采集网关

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::output::Sink;

/// 请求载荷
#[derive(Debug, Serialize)]
struct HttpEnvelope<'a> {
    topic: &'a str,
    payload: &'a Value,
    retain: bool,
}

/// HTTP 输出端
#[derive(Debug)]
pub struct HttpSink {
    name: String,
    endpoint: String,
    client: Client,
    connected: AtomicBool,
}

impl HttpSink {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Result<Self> {
        Self::with_timeout(name, endpoint, Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = endpoint.into();
        if endpoint.is_empty() {
            bail!("endpoint is required");
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            name: name.into(),
            endpoint,
            client,
            connected: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Sink for HttpSink {
    fn name(&self) -> &str {
        &self.name
    }

    /// 探测端点：能收到非 5xx 响应即视为已连接
    fn connect(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .with_context(|| format!("{} unreachable", self.endpoint))?;

        if response.status().is_server_error() {
            bail!("{} answered {}", self.endpoint, response.status());
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn transmit(&self, topic: &str, payload: &Value, retain: bool) -> Result<()> {
        let envelope = HttpEnvelope {
            topic,
            payload,
            retain,
        };

        let result = self
            .client
            .post(&self.endpoint)
            .json(&envelope)
            .send()
            .and_then(|r| r.error_for_status());

        match result {
            Ok(_) => {
                debug!(sink = %self.name, topic = %topic, "Message posted");
                Ok(())
            }
            Err(e) => {
                if e.is_connect() || e.is_timeout() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(anyhow::Error::new(e).context(format!("POST {} failed", self.endpoint)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_sink_requires_endpoint() {
        let result = HttpSink::new("http", "");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("endpoint"));
    }

    #[test]
    fn test_http_sink_starts_disconnected() {
        let sink = HttpSink::new("http", "http://127.0.0.1:9/ingest").unwrap();
        assert!(!sink.is_connected());
        assert_eq!(sink.endpoint(), "http://127.0.0.1:9/ingest");
    }

    #[test]
    fn test_envelope_shape() {
        let payload = serde_json::json!({"v": 1});
        let envelope = HttpEnvelope {
            topic: "lab/a",
            payload: &payload,
            retain: true,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["topic"], "lab/a");
        assert_eq!(json["payload"]["v"], 1);
        assert_eq!(json["retain"], true);
    }
}
