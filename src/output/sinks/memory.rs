//! 内存缓冲输出端 - 有界队列，用作存储转发的兜底

use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::output::{BufferedMessage, Sink};

/// 内存缓冲输出端
///
/// 队列满时丢弃最旧的消息。
pub struct MemorySink {
    name: String,
    capacity: usize,
    buffer: Mutex<VecDeque<BufferedMessage>>,
    connected: AtomicBool,
}

impl MemorySink {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            buffer: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(true),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 查看缓冲内容（不取出）
    pub fn snapshot(&self) -> Vec<BufferedMessage> {
        self.buffer().iter().cloned().collect()
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<BufferedMessage>> {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<()> {
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
        if !self.is_connected() {
            bail!("{} is disconnected", self.name);
        }

        let mut buffer = self.buffer();
        if buffer.len() >= self.capacity {
            if let Some(dropped) = buffer.pop_front() {
                warn!(sink = %self.name, topic = %dropped.topic, "Buffer full, dropping oldest message");
            }
        }
        buffer.push_back(BufferedMessage::new(topic, payload.clone(), retain));
        Ok(())
    }

    fn pop(&self) -> Option<BufferedMessage> {
        self.buffer().pop_front()
    }

    fn pop_all(&self) -> Vec<BufferedMessage> {
        self.buffer().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_buffers_in_order() {
        let sink = MemorySink::new("buffer", 10);
        sink.transmit("a", &json!(1), false).unwrap();
        sink.transmit("b", &json!(2), true).unwrap();

        let first = sink.pop().unwrap();
        assert_eq!(first.topic, "a");
        assert!(!first.retain);

        let rest = sink.pop_all();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].topic, "b");
        assert!(sink.is_empty());
    }

    #[test]
    fn test_full_buffer_drops_oldest() {
        let sink = MemorySink::new("buffer", 2);
        for i in 0..3 {
            sink.transmit(&format!("t{}", i), &json!(i), false).unwrap();
        }

        let topics: Vec<String> = sink.pop_all().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["t1", "t2"]);
    }

    #[test]
    fn test_disconnected_rejects_transmit() {
        let sink = MemorySink::new("buffer", 2);
        sink.disconnect();
        assert!(sink.transmit("a", &json!(1), false).is_err());
        sink.connect().unwrap();
        assert!(sink.transmit("a", &json!(1), false).is_ok());
    }

    #[test]
    fn test_flush_stores_retained_null() {
        let sink = MemorySink::new("buffer", 2);
        sink.flush("lab/running").unwrap();
        let msg = sink.pop().unwrap();
        assert_eq!(msg.payload, Value::Null);
        assert!(msg.retain);
    }
}
