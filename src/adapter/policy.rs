//! Severity policy - what a supervisory loop does with each drained error

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ErrorKind, LabError, Severity};
use crate::output::OutputNode;

pub const DEFAULT_RESTART_LIMIT: usize = 5;
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(300);

/// Adapter-level action
#[derive(Debug, Clone)]
pub enum Remedy {
    /// CRITICAL: stop everything
    Shutdown,
    /// ERROR: full stop + start
    Restart,
    /// WARNING InputError
    RestartWatcher,
    /// WARNING HardwareStalledError
    ResetProcesses,
    /// WARNING ClientUnreachableError
    BounceSink(Arc<OutputNode>),
    LogOnly,
    /// Not part of the taxonomy: a bug in the framework itself
    FrameworkFault,
}

pub fn adapter_remedy(error: &LabError) -> Remedy {
    if error.kind() == ErrorKind::Internal {
        return Remedy::FrameworkFault;
    }
    match error.severity() {
        Severity::Critical => Remedy::Shutdown,
        Severity::Error => Remedy::Restart,
        Severity::Warning => match error.kind() {
            ErrorKind::Input => Remedy::RestartWatcher,
            ErrorKind::HardwareStalled => Remedy::ResetProcesses,
            ErrorKind::ClientUnreachable => match error.sink() {
                Some(node) => Remedy::BounceSink(Arc::clone(node)),
                None => Remedy::LogOnly,
            },
            _ => Remedy::LogOnly,
        },
        Severity::Info => Remedy::LogOnly,
    }
}

/// Fleet-level action
#[derive(Debug, Clone)]
pub enum FleetRemedy {
    Shutdown,
    /// ERROR: reconnect the shared chain, then restart every adapter
    ReconnectAndRestart,
    /// WARNING ClientUnreachableError: open the breaker on that sink
    DisableSink(Arc<OutputNode>),
    LogOnly,
    FrameworkFault,
}

pub fn fleet_remedy(error: &LabError) -> FleetRemedy {
    if error.kind() == ErrorKind::Internal {
        return FleetRemedy::FrameworkFault;
    }
    match error.severity() {
        Severity::Critical => FleetRemedy::Shutdown,
        Severity::Error => FleetRemedy::ReconnectAndRestart,
        Severity::Warning => match error.sink() {
            Some(node) if error.kind() == ErrorKind::ClientUnreachable => {
                FleetRemedy::DisableSink(Arc::clone(node))
            }
            _ => FleetRemedy::LogOnly,
        },
        Severity::Info => FleetRemedy::LogOnly,
    }
}

/// Most severe first; ties keep recording order.
pub fn order_batch(batch: &mut [(LabError, String)]) {
    batch.sort_by(|a, b| b.0.severity().cmp(&a.0.severity()));
}

/// Sliding-window cap on ERROR-triggered restarts
#[derive(Debug, Clone)]
pub struct RestartBudget {
    limit: usize,
    window: Duration,
    history: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            history: VecDeque::new(),
        }
    }

    /// Record a restart if the window still has room.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        while self
            .history
            .front()
            .is_some_and(|at| now.duration_since(*at) >= self.window)
        {
            self.history.pop_front();
        }

        if self.history.len() >= self.limit {
            return false;
        }
        self.history.push_back(now);
        true
    }

    pub fn used(&self) -> usize {
        self.history.len()
    }
}

impl Default for RestartBudget {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_LIMIT, DEFAULT_RESTART_WINDOW)
    }
}
