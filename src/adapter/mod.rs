//! 设备适配器 - 单台仪器的监督循环
//!
//! 一个适配器组合：一个 Watcher、若干 Process、一个 Interpreter、
//! 一个 ErrorHolder 和一条输出链。`start()` 在当前线程上运行 1Hz 循环，
//! 每轮取出未处理的错误，发布到错误 topic，再按严重级别处理：
//!
//! | 级别 | 处理 |
//! |---|---|
//! | CRITICAL | 全部停止，适配器退出 |
//! | ERROR | stop + start（受重启预算限制，超出按 CRITICAL 处理） |
//! | WARNING | 按类型：重启 watcher / 重置 process / 重连输出 / 只记录 |
//! | INFO | 只记录 |

pub mod policy;

pub use policy::{adapter_remedy, order_batch, Remedy, RestartBudget};

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorHolder, LabError, Severity};
use crate::interpreter::Interpreter;
use crate::output::OutputNode;
use crate::process::topics::names;
use crate::process::{Phase, PhaseKind, Process, TopicContext, TopicRegistry, DEFAULT_BATCH_PAUSE, DEFAULT_MAXIMUM_MESSAGE_SIZE};
use crate::signal::StopSignal;
use crate::watcher::{EventKind, EventWatcher};

/// 适配器运行参数
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// 监督循环间隔
    pub loop_interval: Duration,
    /// 超过这么久没有测量数据就上报 HardwareStalled
    pub experiment_timeout: Option<Duration>,
    pub restart_limit: usize,
    pub restart_window: Duration,
    /// 重连输出端前的暂停
    pub bounce_pause: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            loop_interval: Duration::from_secs(1),
            experiment_timeout: None,
            restart_limit: policy::DEFAULT_RESTART_LIMIT,
            restart_window: policy::DEFAULT_RESTART_WINDOW,
            bounce_pause: Duration::from_secs(1),
        }
    }
}

/// Process 组合方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessLayout {
    /// 有实验边界：initialise / start / measure / stop
    #[default]
    Discrete,
    /// 常开测量流：measure 和 initialise 各一个连续 process
    Continuous,
}

/// `start()` 的退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterExit {
    /// 被 `stop()` 正常停止
    Stopped,
    /// CRITICAL 错误，或重启预算用尽
    Critical,
    /// 不在错误分类内的错误
    FrameworkFault,
    /// 缺少必需的仪器 metadata
    Misconfigured,
    /// 已经有一个 `start()` 在运行
    AlreadyRunning,
}

pub struct AdapterBuilder {
    name: String,
    watcher: Option<Arc<dyn EventWatcher>>,
    interpreter: Option<Arc<dyn Interpreter>>,
    output: Option<Arc<OutputNode>>,
    topics: Option<Arc<TopicRegistry>>,
    errors: Option<Arc<ErrorHolder>>,
    metadata: Value,
    required: Vec<String>,
    layout: ProcessLayout,
    settings: AdapterSettings,
    maximum_message_size: usize,
    batch_pause: Duration,
}

impl AdapterBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            watcher: None,
            interpreter: None,
            output: None,
            topics: None,
            errors: None,
            metadata: Value::Null,
            required: Vec::new(),
            layout: ProcessLayout::default(),
            settings: AdapterSettings::default(),
            maximum_message_size: DEFAULT_MAXIMUM_MESSAGE_SIZE,
            batch_pause: DEFAULT_BATCH_PAUSE,
        }
    }

    pub fn watcher(mut self, watcher: Arc<dyn EventWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn interpreter(mut self, interpreter: Arc<dyn Interpreter>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    pub fn output(mut self, output: Arc<OutputNode>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn topics(mut self, topics: Arc<TopicRegistry>) -> Self {
        self.topics = Some(topics);
        self
    }

    /// 不设置时新建一个
    pub fn errors(mut self, errors: Arc<ErrorHolder>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// 仪器 metadata 及其中必须存在的字段
    pub fn metadata(mut self, metadata: Value, required: Vec<String>) -> Self {
        self.metadata = metadata;
        self.required = required;
        self
    }

    pub fn layout(mut self, layout: ProcessLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn settings(mut self, settings: AdapterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn maximum_message_size(mut self, size: usize) -> Self {
        self.maximum_message_size = size;
        self
    }

    pub fn batch_pause(mut self, pause: Duration) -> Self {
        self.batch_pause = pause;
        self
    }

    pub fn build(self) -> Result<EquipmentAdapter, LabError> {
        let missing = |what: &str| LabError::adapter_build(format!("adapter '{}' has no {}", self.name, what));
        let watcher = self.watcher.clone().ok_or_else(|| missing("watcher"))?;
        let interpreter = self.interpreter.clone().ok_or_else(|| missing("interpreter"))?;
        let output = self.output.clone().ok_or_else(|| missing("output"))?;
        let topics = self.topics.clone().ok_or_else(|| missing("topic registry"))?;
        let errors = self.errors.clone().unwrap_or_default();

        let phase = |kind: PhaseKind| {
            Phase::new(kind, Arc::clone(&topics), Some(Arc::clone(&interpreter)))
                .with_maximum_message_size(self.maximum_message_size)
        };

        let processes = match self.layout {
            ProcessLayout::Discrete => vec![Process::discrete(
                vec![
                    phase(PhaseKind::Initialise),
                    phase(PhaseKind::Start),
                    phase(PhaseKind::Measure),
                    phase(PhaseKind::Stop),
                ],
                Arc::clone(&output),
                Arc::clone(&errors),
            )?],
            ProcessLayout::Continuous => vec![
                Process::continuous(vec![phase(PhaseKind::Measure)], Arc::clone(&output), Arc::clone(&errors))?,
                Process::continuous(vec![phase(PhaseKind::Initialise)], Arc::clone(&output), Arc::clone(&errors))?,
            ],
        };
        let processes: Arc<Vec<Process>> = Arc::new(
            processes
                .into_iter()
                .map(|p| p.with_batch_pause(self.batch_pause))
                .collect(),
        );

        for kind in EventKind::ALL {
            let processes = Arc::clone(&processes);
            watcher.add_callback(
                kind,
                Arc::new(move |payload: &Value| {
                    for process in processes.iter().filter(|p| p.handles(kind)) {
                        process.process_input(kind, payload);
                    }
                }),
            );
        }

        Ok(EquipmentAdapter {
            budget: Mutex::new(RestartBudget::new(self.settings.restart_limit, self.settings.restart_window)),
            name: self.name,
            watcher,
            interpreter,
            processes,
            output,
            topics,
            errors,
            metadata: self.metadata,
            required: self.required,
            settings: self.settings,
            signal: StopSignal::new(),
            looping: AtomicBool::new(false),
        })
    }
}

pub struct EquipmentAdapter {
    name: String,
    watcher: Arc<dyn EventWatcher>,
    interpreter: Arc<dyn Interpreter>,
    processes: Arc<Vec<Process>>,
    output: Arc<OutputNode>,
    topics: Arc<TopicRegistry>,
    errors: Arc<ErrorHolder>,
    metadata: Value,
    required: Vec<String>,
    settings: AdapterSettings,
    budget: Mutex<RestartBudget>,
    signal: StopSignal,
    looping: AtomicBool,
}

impl EquipmentAdapter {
    pub fn builder(name: impl Into<String>) -> AdapterBuilder {
        AdapterBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn errors(&self) -> &Arc<ErrorHolder> {
        &self.errors
    }

    pub fn interpreter(&self) -> &Arc<dyn Interpreter> {
        &self.interpreter
    }

    pub fn watcher(&self) -> &Arc<dyn EventWatcher> {
        &self.watcher
    }

    pub fn processes(&self) -> &[Process] {
        &self.processes
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    /// 监督循环是否在运行
    pub fn is_running(&self) -> bool {
        self.looping.load(Ordering::SeqCst)
    }

    /// 启动 watcher 并在当前线程运行监督循环，直到停止
    ///
    /// 在此之前已经调用过 `stop()` 时直接返回 `Stopped`；要再次启动先调用 [`rearm`](Self::rearm)。
    pub fn start(&self) -> AdapterExit {
        if self.looping.swap(true, Ordering::SeqCst) {
            warn!(adapter = %self.name, "Adapter already running");
            return AdapterExit::AlreadyRunning;
        }

        let exit = self.run();

        // stop() 可能与重启交错，确保 watcher 最终是停的
        if self.watcher.is_running() {
            self.watcher.stop();
        }
        self.looping.store(false, Ordering::SeqCst);
        info!(adapter = %self.name, exit = ?exit, "Adapter exited");
        exit
    }

    fn run(&self) -> AdapterExit {
        let missing = self.missing_metadata();
        if !missing.is_empty() {
            let err = LabError::adapter_logic(format!(
                "{}: missing instrument metadata: {}",
                self.name,
                missing.join(", ")
            ))
            .with_severity(Severity::Critical);
            error!(adapter = %self.name, error = %err, "Refusing to start");
            self.errors.add_error(err);
            for (error, trace) in self.errors.get_unseen_errors() {
                self.publish_error(&error, &trace);
            }
            self.stop();
            return AdapterExit::Misconfigured;
        }

        if self.signal.is_triggered() {
            debug!(adapter = %self.name, "Stop requested before start");
            return AdapterExit::Stopped;
        }
        info!(adapter = %self.name, "Adapter starting");
        self.start_watcher();

        loop {
            if let Some(exit) = self.tick() {
                return exit;
            }
            if self.signal.wait_timeout(self.settings.loop_interval) {
                return AdapterExit::Stopped;
            }
        }
    }

    /// 监督循环的一轮：检查数据是否停滞，取出错误并逐个处理
    ///
    /// 返回 `Some` 表示适配器应当退出。
    pub fn tick(&self) -> Option<AdapterExit> {
        self.check_staleness();
        self.errors.cleanup_old_errors();

        let mut batch = self.errors.get_unseen_errors();
        order_batch(&mut batch);

        let mut restarted = false;
        for (error, trace) in batch {
            self.publish_error(&error, &trace);

            match adapter_remedy(&error) {
                Remedy::Shutdown => {
                    error!(adapter = %self.name, error = %error, "Critical error, stopping adapter");
                    self.stop();
                    return Some(AdapterExit::Critical);
                }
                Remedy::FrameworkFault => {
                    error!(adapter = %self.name, error = %error, trace = %trace, "Unclassified error, stopping adapter");
                    self.stop();
                    return Some(AdapterExit::FrameworkFault);
                }
                Remedy::Restart => {
                    if restarted {
                        continue;
                    }
                    let allowed = self.budget.lock().unwrap_or_else(|p| p.into_inner()).allow();
                    if !allowed {
                        error!(
                            adapter = %self.name,
                            error = %error,
                            limit = self.settings.restart_limit,
                            "Restart budget exhausted, stopping adapter"
                        );
                        self.stop();
                        return Some(AdapterExit::Critical);
                    }
                    warn!(adapter = %self.name, error = %error, "Restarting adapter");
                    self.halt();
                    if self.signal.is_triggered() {
                        return Some(AdapterExit::Stopped);
                    }
                    self.start_watcher();
                    restarted = true;
                }
                Remedy::RestartWatcher => {
                    if restarted {
                        continue;
                    }
                    warn!(adapter = %self.name, error = %error, "Restarting watcher");
                    self.watcher.stop();
                    if self.signal.is_triggered() {
                        return Some(AdapterExit::Stopped);
                    }
                    self.start_watcher();
                    restarted = true;
                }
                Remedy::ResetProcesses => {
                    warn!(adapter = %self.name, error = %error, "Instrument stalled, resetting processes");
                    for process in self.processes.iter() {
                        process.stop();
                    }
                    self.interpreter.experiment_stop();
                    if restarted {
                        continue;
                    }
                    self.watcher.stop();
                    if self.signal.is_triggered() {
                        return Some(AdapterExit::Stopped);
                    }
                    self.start_watcher();
                    restarted = true;
                }
                Remedy::BounceSink(node) => {
                    warn!(adapter = %self.name, sink = %node.name(), error = %error, "Bouncing output");
                    node.bounce(self.settings.bounce_pause);
                }
                Remedy::LogOnly => match error.severity() {
                    Severity::Info => info!(adapter = %self.name, error = %error, "Adapter reported"),
                    _ => warn!(adapter = %self.name, kind = %error.kind(), error = %error, "Adapter reported"),
                },
            }
        }

        None
    }

    /// 停止：清空 retained topic、通知循环退出、停止 watcher
    ///
    /// 幂等，可以从任意线程调用，也可以在 `start()` 运行期间调用。
    pub fn stop(&self) {
        for process in self.processes.iter() {
            process.stop();
        }
        self.signal.trigger();
        if self.watcher.is_running() {
            self.watcher.stop();
        }
        debug!(adapter = %self.name, "Adapter stop requested");
    }

    /// 清除之前的停止请求，允许再次 `start()`
    ///
    /// 由发起启动的一方在把 `start()` 交给工作线程之前调用，
    /// 这样工作线程真正开始前到达的 `stop()` 不会被覆盖。
    pub fn rearm(&self) {
        self.signal.reset();
    }

    /// 重启用的停止：不触发停止信号
    fn halt(&self) {
        for process in self.processes.iter() {
            process.stop();
        }
        self.watcher.stop();
    }

    fn start_watcher(&self) {
        if let Err(e) = self.watcher.start() {
            self.errors.add_error(e);
        }
    }

    fn missing_metadata(&self) -> Vec<String> {
        self.required
            .iter()
            .filter(|field| match self.metadata.get(field.as_str()) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            })
            .cloned()
            .collect()
    }

    fn check_staleness(&self) {
        let Some(timeout) = self.settings.experiment_timeout else {
            return;
        };
        if self.interpreter.experiment_id().is_none() {
            return;
        }
        let Some(last) = self.interpreter.last_measurement_time() else {
            return;
        };

        let idle = (Utc::now() - last).to_std().unwrap_or_default();
        if idle > timeout {
            self.errors.add_error(LabError::hardware_stalled(format!(
                "{}: no measurement for {}s (timeout {}s)",
                self.name,
                idle.as_secs(),
                timeout.as_secs()
            )));
        }
    }

    fn publish_error(&self, error: &LabError, trace: &str) {
        let topic = match self.topics.resolve(names::ERROR, &TopicContext::default()) {
            Ok(topic) => topic,
            Err(e) => {
                warn!(adapter = %self.name, error = %e, "No error topic");
                return;
            }
        };
        let payload = json!({
            "kind": error.kind().as_str(),
            "severity": error.severity(),
            "message": error.message(),
            "trace": trace,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.output.transmit(&topic, &payload, false);
    }
}
