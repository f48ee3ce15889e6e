//! 错误收集器 - 按消息聚合、频率升级、去重投递
//!
//! ## 升级策略
//! 1. 以错误消息字符串为键，记录 `timeframe` 内的出现时间
//! 2. 窗口内出现次数达到 `threshold` 时，当前这条错误升一级（CRITICAL 封顶）
//! 3. 升级后清空该消息的窗口，重新计数
//!
//! `get_unseen_errors` 是唯一的消费入口：每条消息在下一次 `add_error` 之前只投递一次。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::panic::Location;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{LabError, Severity};

/// 单条错误记录
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// 错误本身（级别可能已被升级）
    pub error: LabError,
    /// 记录时间
    pub timestamp: DateTime<Utc>,
    /// 上报位置与线程
    pub trace: String,
    /// 是否已被消费
    pub seen: bool,
    recorded_at: Instant,
}

impl ErrorRecord {
    pub fn severity(&self) -> Severity {
        self.error.severity()
    }
}

#[derive(Default)]
struct HolderState {
    records: Vec<ErrorRecord>,
    /// 消息 -> 窗口内的出现时间
    frequency: HashMap<String, Vec<Instant>>,
}

/// 错误收集器
pub struct ErrorHolder {
    state: Mutex<HolderState>,
    threshold: usize,
    timeframe: Duration,
}

impl ErrorHolder {
    pub const DEFAULT_THRESHOLD: usize = 3;
    pub const DEFAULT_TIMEFRAME: Duration = Duration::from_secs(60);

    /// 默认 60 秒内出现 3 次升级
    pub fn new() -> Self {
        Self::with_limits(Self::DEFAULT_THRESHOLD, Self::DEFAULT_TIMEFRAME)
    }

    pub fn with_limits(threshold: usize, timeframe: Duration) -> Self {
        Self {
            state: Mutex::new(HolderState::default()),
            threshold: threshold.max(1),
            timeframe,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn timeframe(&self) -> Duration {
        self.timeframe
    }

    /// 记录一条错误
    ///
    /// 任意线程都可以调用。`trace` 取自调用位置。
    #[track_caller]
    pub fn add_error(&self, mut error: LabError) {
        let location = Location::caller();
        let thread = std::thread::current();
        let trace = format!(
            "{}:{} [{}]",
            location.file(),
            location.line(),
            thread.name().unwrap_or("unnamed")
        );

        let now = Instant::now();
        let mut state = self.lock();

        let window = state
            .frequency
            .entry(error.message().to_string())
            .or_default();
        window.retain(|t| now.duration_since(*t) < self.timeframe);
        window.push(now);

        if window.len() >= self.threshold {
            let escalated = error.severity().escalate();
            debug!(
                message = %error.message(),
                from = %error.severity(),
                to = %escalated,
                "Error repeated within timeframe, escalating"
            );
            error.set_severity(escalated);
            window.clear();
        }

        state.records.push(ErrorRecord {
            error,
            timestamp: Utc::now(),
            trace,
            seen: false,
            recorded_at: now,
        });
    }

    /// 记录一个分类之外的错误
    ///
    /// 内部是 [`LabError`] 的按原样记录，其余的归为 Internal（框架 bug）。
    #[track_caller]
    pub fn add_foreign(&self, error: &anyhow::Error) {
        match error.downcast_ref::<LabError>() {
            Some(lab) => self.add_error(lab.clone()),
            None => self.add_error(LabError::internal(format!("{:#}", error))),
        }
    }

    /// 取出未消费的错误：每个不同消息一条（取最新的那条），并全部标记为已消费
    pub fn get_unseen_errors(&self) -> Vec<(LabError, String)> {
        let mut state = self.lock();

        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, usize> = HashMap::new();

        for (idx, record) in state.records.iter_mut().enumerate() {
            if record.seen {
                continue;
            }
            record.seen = true;
            let key = record.error.message().to_string();
            if !latest.contains_key(&key) {
                order.push(key.clone());
            }
            latest.insert(key, idx);
        }

        order
            .into_iter()
            .filter_map(|key| latest.get(&key).copied())
            .map(|idx| {
                let record = &state.records[idx];
                (record.error.clone(), record.trace.clone())
            })
            .collect()
    }

    /// 清理超过 `timeframe` 的记录（不论是否已消费），返回清理条数
    pub fn cleanup_old_errors(&self) -> usize {
        let now = Instant::now();
        let timeframe = self.timeframe;
        let mut state = self.lock();

        let before = state.records.len();
        state
            .records
            .retain(|r| now.duration_since(r.recorded_at) < timeframe);
        state.frequency.retain(|_, window| {
            window.retain(|t| now.duration_since(*t) < timeframe);
            !window.is_empty()
        });

        before - state.records.len()
    }

    /// 当前保留的记录（测试与诊断用）
    pub fn records(&self) -> Vec<ErrorRecord> {
        self.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HolderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ErrorHolder {
    fn default() -> Self {
        Self::new()
    }
}
