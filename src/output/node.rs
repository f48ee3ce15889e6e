//! 输出节点 - 兜底委托 + 熔断
//!
//! 节点组成一条单向链表：`primary -> fallback -> fallback ...`。
//! 未连接或发送失败时先带退避重连，仍失败则上报 ClientUnreachable
//! （携带出错节点本身，供监督循环定点熔断和恢复），再委托给下一个节点。
//! 被熔断的节点直接委托，不碰自己的 sink。

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::backoff::ReconnectPolicy;
use super::{BufferedMessage, Sink};
use crate::error::{ErrorHolder, LabError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Disabled,
    Unreachable,
}

#[derive(Debug)]
struct BreakerState {
    enabled: bool,
    disabled_since: Option<Instant>,
}

/// 输出链上的一个节点
pub struct OutputNode {
    sink: Box<dyn Sink>,
    fallback: Option<Arc<OutputNode>>,
    breaker: Mutex<BreakerState>,
    errors: Mutex<Option<Arc<ErrorHolder>>>,
    reconnect: ReconnectPolicy,
}

impl std::fmt::Debug for OutputNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputNode")
            .field("name", &self.name())
            .field("enabled", &self.is_enabled())
            .field("fallback", &self.fallback.as_ref().map(|n| n.name().to_string()))
            .finish()
    }
}

impl OutputNode {
    pub fn new(sink: impl Sink + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            fallback: None,
            breaker: Mutex::new(BreakerState {
                enabled: true,
                disabled_since: None,
            }),
            errors: Mutex::new(None),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<OutputNode>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn name(&self) -> &str {
        self.sink.name()
    }

    pub fn fallback(&self) -> Option<&Arc<OutputNode>> {
        self.fallback.as_ref()
    }

    /// 设置错误收集器（整条链共用）
    pub fn set_error_holder(&self, holder: Arc<ErrorHolder>) {
        if let Some(fallback) = &self.fallback {
            fallback.set_error_holder(Arc::clone(&holder));
        }
        *self.errors.lock().unwrap_or_else(|p| p.into_inner()) = Some(holder);
    }

    /// 从自己开始的整条链
    pub fn chain(self: &Arc<Self>) -> Vec<Arc<OutputNode>> {
        let mut nodes = vec![Arc::clone(self)];
        let mut cursor = self.fallback.clone();
        while let Some(node) = cursor {
            cursor = node.fallback.clone();
            nodes.push(node);
        }
        nodes
    }

    /// 连接整条链，返回本节点是否连上
    ///
    /// 被熔断的节点不会尝试连接。
    pub fn connect(self: &Arc<Self>) -> bool {
        if let Some(fallback) = &self.fallback {
            fallback.connect();
        }
        self.connect_own()
    }

    /// 只连接本节点，不碰 fallback
    pub fn connect_own(self: &Arc<Self>) -> bool {
        if !self.is_enabled() {
            debug!(sink = %self.name(), "Sink disabled, skipping connect");
            return false;
        }

        match self.sink.connect() {
            Ok(()) => {
                info!(sink = %self.name(), "Sink connected");
                true
            }
            Err(e) => {
                self.report_unreachable(format!("{}: connect failed: {}", self.name(), e));
                false
            }
        }
    }

    /// 断开整条链
    pub fn disconnect(&self) {
        self.disconnect_own();
        if let Some(fallback) = &self.fallback {
            fallback.disconnect();
        }
    }

    pub fn disconnect_own(&self) {
        self.sink.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_connected()
    }

    /// 发送消息，失败时沿链委托
    pub fn transmit(self: &Arc<Self>, topic: &str, payload: &Value, retain: bool) -> bool {
        match self.attempt("transmit", topic, |sink| sink.transmit(topic, payload, retain)) {
            Outcome::Done => true,
            outcome => self.delegate("transmit", outcome, |fallback| fallback.transmit(topic, payload, retain)),
        }
    }

    /// 清除 retained 值，失败时沿链委托
    pub fn flush(self: &Arc<Self>, topic: &str) -> bool {
        match self.attempt("flush", topic, |sink| sink.flush(topic)) {
            Outcome::Done => true,
            outcome => self.delegate("flush", outcome, |fallback| fallback.flush(topic)),
        }
    }

    pub fn subscribe(self: &Arc<Self>, topic: &str) -> bool {
        match self.attempt("subscribe", topic, |sink| sink.subscribe(topic)) {
            Outcome::Done => true,
            outcome => self.delegate("subscribe", outcome, |fallback| fallback.subscribe(topic)),
        }
    }

    /// 从本节点或其 fallback 链中取出一条缓冲消息
    pub fn pop(&self) -> Option<BufferedMessage> {
        self.sink
            .pop()
            .or_else(|| self.fallback.as_ref().and_then(|f| f.pop()))
    }

    /// 取出本节点及整条 fallback 链上的全部缓冲消息
    pub fn pop_all_messages(&self) -> Vec<BufferedMessage> {
        let mut messages = self.sink.pop_all();
        if let Some(fallback) = &self.fallback {
            messages.extend(fallback.pop_all_messages());
        }
        messages
    }

    /// 熔断：之后所有调用直接走 fallback
    pub fn disable(&self) {
        let mut breaker = self.breaker();
        if breaker.enabled {
            warn!(sink = %self.name(), "Disabling sink");
            breaker.enabled = false;
            breaker.disabled_since = Some(Instant::now());
        }
    }

    pub fn enable(&self) {
        let mut breaker = self.breaker();
        if !breaker.enabled {
            info!(sink = %self.name(), "Re-enabling sink");
        }
        breaker.enabled = true;
        breaker.disabled_since = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.breaker().enabled
    }

    pub fn disabled_since(&self) -> Option<Instant> {
        self.breaker().disabled_since
    }

    /// 带退避的重连，次数用尽后上报 ClientUnreachable
    pub fn reconnect(self: &Arc<Self>) -> bool {
        for attempt in 0..self.reconnect.attempts {
            match self.sink.connect() {
                Ok(()) => {
                    info!(sink = %self.name(), attempt = attempt + 1, "Sink reconnected");
                    return true;
                }
                Err(e) => {
                    debug!(sink = %self.name(), attempt = attempt + 1, error = %e, "Reconnect attempt failed");
                    if attempt + 1 < self.reconnect.attempts {
                        std::thread::sleep(self.reconnect.delay(attempt));
                    }
                }
            }
        }

        self.report_unreachable(format!(
            "{}: gave up after {} reconnect attempts",
            self.name(),
            self.reconnect.attempts
        ));
        false
    }

    /// 只重启本节点的连接：断开、暂停、带退避重连
    pub fn bounce(self: &Arc<Self>, pause: Duration) -> bool {
        self.sink.disconnect();
        std::thread::sleep(pause);
        self.reconnect()
    }

    /// 熔断恢复检查
    ///
    /// 熔断时长超过 `cooldown` 时尝试重连；成功后把 fallback 链中缓冲的消息
    /// 全部回放到本节点，再重新启用。回放失败时重新计时。返回是否恢复。
    pub fn try_recover(self: &Arc<Self>, cooldown: Duration) -> bool {
        let Some(since) = self.disabled_since() else {
            return false;
        };
        if since.elapsed() < cooldown {
            return false;
        }

        if let Err(e) = self.sink.connect() {
            debug!(sink = %self.name(), error = %e, "Sink still unreachable, restarting cooldown");
            self.breaker().disabled_since = Some(Instant::now());
            return false;
        }

        let Some(replayed) = self.replay() else {
            self.breaker().disabled_since = Some(Instant::now());
            return false;
        };
        self.enable();

        // 回放期间仍被路由到 fallback 的消息
        let late = self.replay().unwrap_or_default();
        info!(sink = %self.name(), replayed, late, "Sink recovered");
        true
    }

    /// 把 fallback 链中缓冲的消息按顺序发到本节点
    ///
    /// 中途失败时剩余消息放回 fallback，返回 `None`。
    fn replay(self: &Arc<Self>) -> Option<usize> {
        let backlog = self
            .fallback
            .as_ref()
            .map(|f| f.pop_all_messages())
            .unwrap_or_default();
        let total = backlog.len();
        let mut pending = backlog.into_iter();

        while let Some(message) = pending.next() {
            if let Err(e) = self.sink.transmit(&message.topic, &message.payload, message.retain) {
                warn!(sink = %self.name(), error = %e, "Replay failed, returning backlog to fallback");
                self.requeue(message);
                for rest in pending {
                    self.requeue(rest);
                }
                return None;
            }
        }

        debug!(sink = %self.name(), replayed = total, "Backlog replayed");
        Some(total)
    }

    fn requeue(self: &Arc<Self>, message: BufferedMessage) {
        if let Some(fallback) = &self.fallback {
            fallback.transmit(&message.topic, &message.payload, message.retain);
        }
    }

    /// 在本节点上执行一次操作
    ///
    /// 启用中但未连接或操作失败时，先带退避重连再重试一次；仍失败则上报
    /// ClientUnreachable，交给监督循环熔断。
    fn attempt(self: &Arc<Self>, op: &str, topic: &str, call: impl Fn(&dyn Sink) -> anyhow::Result<()>) -> Outcome {
        if !self.is_enabled() {
            return Outcome::Disabled;
        }

        if self.sink.is_connected() {
            match call(self.sink.as_ref()) {
                Ok(()) => return Outcome::Done,
                Err(e) => warn!(sink = %self.name(), op = %op, topic = %topic, error = %e, "Sink operation failed"),
            }
        }

        if !self.reconnect() {
            return Outcome::Unreachable;
        }
        match call(self.sink.as_ref()) {
            Ok(()) => Outcome::Done,
            Err(e) => {
                self.report_unreachable(format!("{}: {} failed after reconnect: {}", self.name(), op, e));
                Outcome::Unreachable
            }
        }
    }

    fn delegate(self: &Arc<Self>, op: &str, outcome: Outcome, call: impl FnOnce(&Arc<OutputNode>) -> bool) -> bool {
        match &self.fallback {
            Some(fallback) => {
                debug!(sink = %self.name(), fallback = %fallback.name(), op = %op, "Delegating to fallback");
                call(fallback)
            }
            None => {
                // 不可达已由 attempt 上报
                if outcome == Outcome::Disabled {
                    self.report_unreachable(format!(
                        "{}: {} skipped, sink disabled and no fallback is configured",
                        self.name(),
                        op
                    ));
                }
                false
            }
        }
    }

    fn report_unreachable(self: &Arc<Self>, message: String) {
        let error = LabError::client_unreachable(message, self);
        let holder = self.errors.lock().unwrap_or_else(|p| p.into_inner()).clone();
        match holder {
            Some(holder) => holder.add_error(error),
            None => warn!(sink = %self.name(), error = %error, "Sink unreachable"),
        }
    }

    fn breaker(&self) -> MutexGuard<'_, BreakerState> {
        self.breaker.lock().unwrap_or_else(|p| p.into_inner())
    }
}
