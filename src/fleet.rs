//! 仪器集群监督 - 多个适配器共用一条输出链和一个 ErrorHolder
//!
//! 每个适配器跑在自己的线程上；集群循环以 1Hz 取出共用 holder 的错误：
//! - CRITICAL：整个集群停止
//! - ERROR：重连输出链，重启所有适配器
//! - WARNING ClientUnreachable：熔断出错的输出节点，冷却后恢复并回放缓冲
//!
//! 熔断恢复检查每轮都会执行，不管有没有新错误。

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::adapter::policy::{fleet_remedy, order_batch, FleetRemedy, RestartBudget, DEFAULT_RESTART_LIMIT, DEFAULT_RESTART_WINDOW};
use crate::adapter::{AdapterExit, EquipmentAdapter};
use crate::error::{ErrorHolder, Severity};
use crate::output::OutputNode;
use crate::signal::StopSignal;

pub const DEFAULT_DISABLE_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub loop_interval: Duration,
    /// 熔断后多久尝试恢复
    pub disable_cooldown: Duration,
    pub restart_limit: usize,
    pub restart_window: Duration,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            loop_interval: Duration::from_secs(1),
            disable_cooldown: DEFAULT_DISABLE_COOLDOWN,
            restart_limit: DEFAULT_RESTART_LIMIT,
            restart_window: DEFAULT_RESTART_WINDOW,
        }
    }
}

/// 集群共享的状态，显式传给监督器和各个适配器
#[derive(Clone)]
pub struct FleetContext {
    /// 默认输出链的头
    pub output: Arc<OutputNode>,
    /// 其他由集群负责连接和熔断恢复的输出（如单台仪器覆盖的输出链）
    pub outputs: Vec<Arc<OutputNode>>,
    pub errors: Arc<ErrorHolder>,
    pub settings: FleetSettings,
}

impl FleetContext {
    /// 创建上下文，并把共用 holder 挂到整条输出链上
    pub fn new(output: Arc<OutputNode>, errors: Arc<ErrorHolder>, settings: FleetSettings) -> Self {
        output.set_error_holder(Arc::clone(&errors));
        Self {
            output,
            outputs: Vec::new(),
            errors,
            settings,
        }
    }

    /// 追加由集群管理的输出节点
    pub fn with_outputs(mut self, nodes: impl IntoIterator<Item = Arc<OutputNode>>) -> Self {
        for node in nodes {
            node.set_error_holder(Arc::clone(&self.errors));
            self.outputs.push(node);
        }
        self
    }

    /// 所有受管输出链上的节点，每个只出现一次
    pub fn nodes(&self) -> Vec<Arc<OutputNode>> {
        let mut nodes: Vec<Arc<OutputNode>> = Vec::new();
        for root in std::iter::once(&self.output).chain(self.outputs.iter()) {
            for node in root.chain() {
                if !nodes.iter().any(|known| Arc::ptr_eq(known, &node)) {
                    nodes.push(node);
                }
            }
        }
        nodes
    }

    fn connect_all(&self) {
        for node in self.nodes() {
            node.connect_own();
        }
    }

    fn disconnect_all(&self) {
        for node in self.nodes() {
            node.disconnect_own();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetExit {
    Stopped,
    Critical,
    FrameworkFault,
}

struct Worker {
    adapter: String,
    handle: JoinHandle<AdapterExit>,
}

pub struct FleetSupervisor {
    ctx: FleetContext,
    adapters: Vec<Arc<EquipmentAdapter>>,
    workers: Mutex<Vec<Worker>>,
    budget: Mutex<RestartBudget>,
    signal: StopSignal,
}

impl FleetSupervisor {
    pub fn new(ctx: FleetContext, adapters: Vec<EquipmentAdapter>) -> Self {
        let budget = RestartBudget::new(ctx.settings.restart_limit, ctx.settings.restart_window);
        Self {
            ctx,
            adapters: adapters.into_iter().map(Arc::new).collect(),
            workers: Mutex::new(Vec::new()),
            budget: Mutex::new(budget),
            signal: StopSignal::new(),
        }
    }

    pub fn context(&self) -> &FleetContext {
        &self.ctx
    }

    pub fn adapters(&self) -> &[Arc<EquipmentAdapter>] {
        &self.adapters
    }

    /// 还在运行的适配器线程数
    pub fn active_workers(&self) -> usize {
        self.lock_workers().iter().filter(|w| !w.handle.is_finished()).count()
    }

    /// 连接输出链、启动所有适配器，然后在当前线程运行监督循环
    ///
    /// 在此之前已经调用过 `stop()` 时，不启动任何适配器，直接返回 `Stopped`。
    pub fn run(&self) -> FleetExit {
        info!(adapters = self.adapters.len(), "Fleet starting");

        self.ctx.connect_all();
        self.spawn_adapters();

        let exit = loop {
            if let Some(exit) = self.tick() {
                break exit;
            }
            if self.signal.wait_timeout(self.ctx.settings.loop_interval) {
                break FleetExit::Stopped;
            }
        };

        self.stop();
        info!(exit = ?exit, "Fleet stopped");
        exit
    }

    /// 监督循环的一轮
    pub fn tick(&self) -> Option<FleetExit> {
        self.reap_workers();
        self.ctx.errors.cleanup_old_errors();

        let mut batch = self.ctx.errors.get_unseen_errors();
        order_batch(&mut batch);

        let mut restarted = false;
        for (error, trace) in batch {
            match fleet_remedy(&error) {
                FleetRemedy::Shutdown => {
                    error!(error = %error, "Critical fleet error, shutting down");
                    return Some(FleetExit::Critical);
                }
                FleetRemedy::FrameworkFault => {
                    error!(error = %error, trace = %trace, "Unclassified fleet error, shutting down");
                    return Some(FleetExit::FrameworkFault);
                }
                FleetRemedy::ReconnectAndRestart => {
                    if restarted {
                        continue;
                    }
                    let allowed = self.budget.lock().unwrap_or_else(|p| p.into_inner()).allow();
                    if !allowed {
                        error!(error = %error, limit = self.ctx.settings.restart_limit, "Fleet restart budget exhausted");
                        return Some(FleetExit::Critical);
                    }
                    warn!(error = %error, "Reconnecting output and restarting adapters");
                    self.restart();
                    restarted = true;
                }
                FleetRemedy::DisableSink(node) => {
                    warn!(sink = %node.name(), error = %error, "Output unreachable, disabling");
                    node.disable();
                }
                FleetRemedy::LogOnly => match error.severity() {
                    Severity::Info => info!(error = %error, "Fleet reported"),
                    _ => warn!(kind = %error.kind(), error = %error, "Fleet reported"),
                },
            }
        }

        self.recover_disabled();
        None
    }

    /// 检查所有被熔断的节点，冷却期已过的尝试恢复
    pub fn recover_disabled(&self) -> usize {
        self.ctx
            .nodes()
            .iter()
            .filter(|node| !node.is_enabled())
            .filter(|node| node.try_recover(self.ctx.settings.disable_cooldown))
            .count()
    }

    /// 停止所有适配器并等待线程退出，然后断开输出链。幂等。
    pub fn stop(&self) {
        self.signal.trigger();
        self.stop_adapters();
        self.ctx.disconnect_all();
    }

    fn restart(&self) {
        self.stop_adapters();
        self.ctx.disconnect_all();
        self.ctx.connect_all();
        self.spawn_adapters();
    }

    /// 启动所有适配器线程
    ///
    /// 持有 workers 锁检查停止信号，和 `stop_adapters` 互斥，
    /// 停止之后不会再有新线程被启动。
    fn spawn_adapters(&self) {
        let mut workers = self.lock_workers();
        if self.signal.is_triggered() {
            debug!("Fleet stopping, not spawning adapters");
            return;
        }
        for adapter in &self.adapters {
            adapter.rearm();
            let runner = Arc::clone(adapter);
            let spawned = thread::Builder::new()
                .name(format!("adapter-{}", adapter.name()))
                .spawn(move || runner.start());
            match spawned {
                Ok(handle) => {
                    debug!(adapter = %adapter.name(), "Adapter worker spawned");
                    workers.push(Worker {
                        adapter: adapter.name().to_string(),
                        handle,
                    });
                }
                Err(e) => error!(adapter = %adapter.name(), error = %e, "Failed to spawn adapter worker"),
            }
        }
    }

    fn stop_adapters(&self) {
        let workers: Vec<Worker> = {
            let mut workers = self.lock_workers();
            for adapter in &self.adapters {
                adapter.stop();
            }
            workers.drain(..).collect()
        };
        for worker in workers {
            match worker.handle.join() {
                Ok(exit) => debug!(adapter = %worker.adapter, exit = ?exit, "Adapter worker joined"),
                Err(_) => error!(adapter = %worker.adapter, "Adapter worker panicked"),
            }
        }
    }

    /// 回收自己退出的适配器线程（CRITICAL 等）
    fn reap_workers(&self) {
        let mut workers = self.lock_workers();
        let (finished, running): (Vec<Worker>, Vec<Worker>) =
            workers.drain(..).partition(|w| w.handle.is_finished());
        *workers = running;
        drop(workers);

        for worker in finished {
            match worker.handle.join() {
                Ok(exit) => warn!(adapter = %worker.adapter, exit = ?exit, "Adapter exited on its own"),
                Err(_) => error!(adapter = %worker.adapter, "Adapter worker panicked"),
            }
        }
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<Worker>> {
        self.workers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LabError;
    use crate::output::sinks::MemorySink;
    use crate::output::{ReconnectPolicy, Sink};
    use anyhow::{bail, Result};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// 可以手动断开的输出端
    struct SwitchSink {
        up: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    impl SwitchSink {
        fn new(up: bool) -> Self {
            Self {
                up: AtomicBool::new(up),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl Sink for SwitchSink {
        fn name(&self) -> &str {
            "broker"
        }

        fn connect(&self) -> Result<()> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                bail!("connection refused")
            }
        }

        fn disconnect(&self) {}

        fn is_connected(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        fn transmit(&self, topic: &str, _payload: &Value, _retain: bool) -> Result<()> {
            if !self.up.load(Ordering::SeqCst) {
                bail!("connection refused");
            }
            self.sent.lock().unwrap().push(topic.to_string());
            Ok(())
        }
    }

    fn context(primary: Arc<SwitchSink>, buffer: Arc<MemorySink>, cooldown: Duration) -> FleetContext {
        let fallback = Arc::new(OutputNode::new(buffer));
        let output = Arc::new(
            OutputNode::new(primary)
                .with_fallback(fallback)
                .with_reconnect_policy(ReconnectPolicy::once()),
        );
        FleetContext::new(
            output,
            Arc::new(ErrorHolder::new()),
            FleetSettings {
                disable_cooldown: cooldown,
                ..FleetSettings::default()
            },
        )
    }

    #[test]
    fn test_critical_error_ends_fleet() {
        let ctx = context(
            Arc::new(SwitchSink::new(true)),
            Arc::new(MemorySink::new("buffer", 100)),
            Duration::from_secs(30),
        );
        let fleet = FleetSupervisor::new(ctx.clone(), vec![]);

        ctx.errors.add_error(LabError::adapter_build("bad chain"));
        assert_eq!(fleet.tick(), Some(FleetExit::Critical));
    }

    #[test]
    fn test_unreachable_warning_disables_sink() {
        let primary = Arc::new(SwitchSink::new(true));
        let buffer = Arc::new(MemorySink::new("buffer", 100));
        let ctx = context(primary, buffer, Duration::from_secs(30));
        let fleet = FleetSupervisor::new(ctx.clone(), vec![]);

        ctx.errors
            .add_error(LabError::client_unreachable("broker: transmit failed", &ctx.output));
        assert!(fleet.tick().is_none());
        assert!(!ctx.output.is_enabled());
    }

    #[test]
    fn test_disabled_sink_recovers_and_replays() {
        let primary = Arc::new(SwitchSink::new(false));
        let buffer = Arc::new(MemorySink::new("buffer", 100));
        let ctx = context(primary.clone(), buffer.clone(), Duration::from_millis(10));
        let fleet = FleetSupervisor::new(ctx.clone(), vec![]);

        ctx.output.disable();
        assert!(ctx.output.transmit("lab/a/1/running", &json!(true), true));
        assert_eq!(buffer.len(), 1);

        // 冷却期内不恢复
        primary.up.store(true, Ordering::SeqCst);
        ctx.output.enable();
        ctx.output.disable();
        assert_eq!(fleet.recover_disabled(), 0);

        std::thread::sleep(Duration::from_millis(20));
        assert!(fleet.tick().is_none());
        assert!(ctx.output.is_enabled());
        assert!(buffer.is_empty());
        assert_eq!(*primary.sent.lock().unwrap(), vec!["lab/a/1/running"]);
    }

    #[test]
    fn test_outage_is_detected_disabled_and_recovered() {
        // Given: a healthy primary with a memory buffer behind it
        let primary = Arc::new(SwitchSink::new(true));
        let buffer = Arc::new(MemorySink::new("buffer", 100));
        let ctx = context(primary.clone(), buffer.clone(), Duration::from_millis(10));
        let fleet = FleetSupervisor::new(ctx.clone(), vec![]);
        assert!(ctx.output.transmit("lab/a/1/measurement", &json!(1), false));

        // When: the broker goes away mid-run
        primary.up.store(false, Ordering::SeqCst);
        assert!(ctx.output.transmit("lab/a/1/measurement", &json!(2), false));

        // Then: the message is buffered and the next tick disables the primary
        assert_eq!(buffer.len(), 1);
        assert!(fleet.tick().is_none());
        assert!(!ctx.output.is_enabled());

        // When: the broker comes back after the cooldown
        primary.up.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert!(fleet.tick().is_none());

        // Then: the buffered message is replayed and the primary is used again
        assert!(ctx.output.is_enabled());
        assert!(buffer.is_empty());
        assert_eq!(primary.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_extra_outputs_are_recovered() {
        let ctx = context(
            Arc::new(SwitchSink::new(true)),
            Arc::new(MemorySink::new("buffer", 100)),
            Duration::ZERO,
        );
        let archive = Arc::new(OutputNode::new(MemorySink::new("archive", 100)));
        let primary_output = Arc::clone(&ctx.output);
        let ctx = ctx.with_outputs([Arc::clone(&archive), primary_output]);
        let fleet = FleetSupervisor::new(ctx.clone(), vec![]);

        // 同一节点只出现一次
        assert_eq!(ctx.nodes().len(), 3);

        archive.disable();
        assert_eq!(fleet.recover_disabled(), 1);
        assert!(archive.is_enabled());
    }

    #[test]
    fn test_stop_before_run_returns_without_looping() {
        let ctx = context(
            Arc::new(SwitchSink::new(true)),
            Arc::new(MemorySink::new("buffer", 100)),
            Duration::from_secs(30),
        );
        let fleet = Arc::new(FleetSupervisor::new(ctx, vec![]));
        fleet.stop();

        let runner = Arc::clone(&fleet);
        let worker = std::thread::spawn(move || runner.run());
        std::thread::sleep(Duration::from_millis(200));
        assert!(worker.is_finished());
        assert_eq!(worker.join().unwrap(), FleetExit::Stopped);
    }

    #[test]
    fn test_info_is_only_logged() {
        let ctx = context(
            Arc::new(SwitchSink::new(true)),
            Arc::new(MemorySink::new("buffer", 100)),
            Duration::from_secs(30),
        );
        let fleet = FleetSupervisor::new(ctx.clone(), vec![]);

        ctx.errors.add_error(LabError::interpreter("odd"));
        assert!(fleet.tick().is_none());
        assert!(ctx.output.is_enabled());
    }

    #[test]
    fn test_stop_without_run_is_harmless() {
        let ctx = context(
            Arc::new(SwitchSink::new(true)),
            Arc::new(MemorySink::new("buffer", 100)),
            Duration::from_secs(30),
        );
        let fleet = FleetSupervisor::new(ctx, vec![]);
        fleet.stop();
        fleet.stop();
        assert_eq!(fleet.active_workers(), 0);
    }
}
