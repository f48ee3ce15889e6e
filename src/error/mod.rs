//! 错误分类 - 运行期故障的统一表示
//!
//! 所有 watcher / interpreter / output 线程发现的问题都以 [`LabError`] 的形式
//! 汇入 [`ErrorHolder`]，由 adapter 或 fleet 的监督循环统一决定如何补救。
//!
//! | 类型 | 含义 | 默认级别 |
//! |------|------|----------|
//! | `Input` | 数据源不可达或损坏 | ERROR |
//! | `HardwareStalled` | 预期周期内没有数据 | WARNING |
//! | `ClientUnreachable` | 输出端不可达（携带出错节点） | WARNING |
//! | `AdapterBuild` | 构建期配置错误，不重试 | CRITICAL |
//! | `AdapterLogic` | 内部一致性错误（如先测量后开始） | WARNING |
//! | `Interpreter` | 领域解释器上报的软错误 | INFO |
//! | `Internal` | 不在分类内的错误，视为框架 bug | CRITICAL |

mod holder;

pub use holder::{ErrorHolder, ErrorRecord};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::output::OutputNode;

/// 严重级别（按从低到高排序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// 升一级，CRITICAL 封顶
    pub fn escalate(self) -> Self {
        match self {
            Severity::Info => Severity::Warning,
            Severity::Warning => Severity::Error,
            Severity::Error | Severity::Critical => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    HardwareStalled,
    ClientUnreachable,
    AdapterBuild,
    AdapterLogic,
    Interpreter,
    Internal,
}

impl ErrorKind {
    /// 该类型的默认严重级别
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::Input => Severity::Error,
            ErrorKind::HardwareStalled => Severity::Warning,
            ErrorKind::ClientUnreachable => Severity::Warning,
            ErrorKind::AdapterBuild => Severity::Critical,
            ErrorKind::AdapterLogic => Severity::Warning,
            ErrorKind::Interpreter => Severity::Info,
            ErrorKind::Internal => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Input => "InputError",
            ErrorKind::HardwareStalled => "HardwareStalledError",
            ErrorKind::ClientUnreachable => "ClientUnreachableError",
            ErrorKind::AdapterBuild => "AdapterBuildError",
            ErrorKind::AdapterLogic => "AdapterLogicError",
            ErrorKind::Interpreter => "InterpreterError",
            ErrorKind::Internal => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 出错输出节点的引用（用于定点恢复）
#[derive(Clone)]
pub struct SinkRef(Arc<OutputNode>);

impl SinkRef {
    pub fn node(&self) -> &Arc<OutputNode> {
        &self.0
    }
}

impl fmt::Debug for SinkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SinkRef").field(&self.0.name()).finish()
    }
}

/// 运行期错误
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LabError {
    kind: ErrorKind,
    severity: Severity,
    message: String,
    sink: Option<SinkRef>,
}

impl LabError {
    /// 按类型默认级别创建
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            sink: None,
        }
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Input, message)
    }

    pub fn hardware_stalled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HardwareStalled, message)
    }

    /// 输出端不可达，携带出错节点
    pub fn client_unreachable(message: impl Into<String>, node: &Arc<OutputNode>) -> Self {
        Self {
            sink: Some(SinkRef(Arc::clone(node))),
            ..Self::new(ErrorKind::ClientUnreachable, message)
        }
    }

    pub fn adapter_build(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AdapterBuild, message)
    }

    pub fn adapter_logic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AdapterLogic, message)
    }

    pub fn interpreter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Interpreter, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// 覆盖默认级别（例如调用方认为上下文更严重）
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// ClientUnreachable 错误对应的输出节点
    pub fn sink(&self) -> Option<&Arc<OutputNode>> {
        self.sink.as_ref().map(SinkRef::node)
    }

    pub(crate) fn set_severity(&mut self, severity: Severity) {
        self.severity = severity;
    }
}
