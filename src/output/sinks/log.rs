//! 日志输出端 - 通过 tracing 打印消息，调试时替代真实 broker

use anyhow::Result;
use serde_json::Value;
use tracing::info;

use crate::output::Sink;

pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Sink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<()> {
        Ok(())
    }

    fn disconnect(&self) {}

    fn is_connected(&self) -> bool {
        true
    }

    fn transmit(&self, topic: &str, payload: &Value, retain: bool) -> Result<()> {
        info!(sink = %self.name, topic = %topic, retain, payload = %payload, "Telemetry message");
        Ok(())
    }
}
