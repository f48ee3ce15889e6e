//! 输出抽象层 - 统一管理所有输出端
//!
//! # 设计目标
//! 1. 统一接口：所有输出端实现 [`Sink`] trait，只负责自己的连接和发送
//! 2. 兜底链：[`OutputNode`] 包装一个 Sink，失败或未连接时委托给 fallback 节点
//! 3. 熔断：节点可被 `disable()`，期间所有调用直接走 fallback，冷却后由监督循环恢复
//! 4. 存储转发：缓冲型 Sink 支持 `pop` / `pop_all`，恢复后回放到主输出
//!
//! # 使用示例
//! ```ignore
//! use std::sync::Arc;
//! use lab_relay::output::{OutputNode, sinks::{HttpSink, MemorySink}};
//!
//! let buffer = Arc::new(OutputNode::new(MemorySink::new("buffer", 10_000)));
//! let primary = Arc::new(OutputNode::new(HttpSink::new("broker", "http://localhost:8086/ingest")?)
//!     .with_fallback(buffer));
//! primary.transmit("lab/eq/1/running", &serde_json::json!(true), true);
//! ```

pub mod backoff;
pub mod node;
pub mod sinks;

pub use backoff::ReconnectPolicy;
pub use node::OutputNode;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// 缓冲中的一条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub topic: String,
    pub payload: Value,
    pub retain: bool,
    pub ts: DateTime<Utc>,
}

impl BufferedMessage {
    pub fn new(topic: impl Into<String>, payload: Value, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            retain,
            ts: Utc::now(),
        }
    }
}

/// 输出端 trait
///
/// 实现方用内部锁保护自己的连接状态，所有方法都可能被多个线程并发调用。
pub trait Sink: Send + Sync {
    /// 输出端名称（用于日志和配置引用）
    fn name(&self) -> &str;

    fn connect(&self) -> Result<()>;

    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// 发送一条消息
    fn transmit(&self, topic: &str, payload: &Value, retain: bool) -> Result<()>;

    /// 清除 retained 值（默认发送一条 retained 的空消息）
    fn flush(&self, topic: &str) -> Result<()> {
        self.transmit(topic, &Value::Null, true)
    }

    fn subscribe(&self, _topic: &str) -> Result<()> {
        Ok(())
    }

    /// 取出一条缓冲消息（非缓冲型 Sink 返回 None）
    fn pop(&self) -> Option<BufferedMessage> {
        None
    }

    /// 取出全部缓冲消息
    fn pop_all(&self) -> Vec<BufferedMessage> {
        std::iter::from_fn(|| self.pop()).collect()
    }
}

impl<S: Sink + ?Sized> Sink for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn connect(&self) -> Result<()> {
        (**self).connect()
    }

    fn disconnect(&self) {
        (**self).disconnect()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn transmit(&self, topic: &str, payload: &Value, retain: bool) -> Result<()> {
        (**self).transmit(topic, payload, retain)
    }

    fn flush(&self, topic: &str) -> Result<()> {
        (**self).flush(topic)
    }

    fn subscribe(&self, topic: &str) -> Result<()> {
        (**self).subscribe(topic)
    }

    fn pop(&self) -> Option<BufferedMessage> {
        (**self).pop()
    }

    fn pop_all(&self) -> Vec<BufferedMessage> {
        (**self).pop_all()
    }
}
