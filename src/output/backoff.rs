//! 重连退避策略
//!
//! 第 `n` 次重试前等待 `first × factor^n`，上限 `max`，最多尝试 `attempts` 次。

use std::time::Duration;

/// 输出端重连策略
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// 最多尝试次数
    pub attempts: u32,
    /// 第一次失败后的等待
    pub first: Duration,
    /// 等待上限
    pub max: Duration,
    /// 倍增因子
    pub factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// 单次尝试，不等待
    pub fn once() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// 第 `attempt` 次（从 0 开始）失败后的等待时长
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = ReconnectPolicy {
            attempts: 5,
            first: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = ReconnectPolicy {
            attempts: 20,
            first: Duration::from_millis(100),
            max: Duration::from_millis(500),
            factor: 2.0,
        };
        assert_eq!(policy.delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_once_has_single_attempt() {
        assert_eq!(ReconnectPolicy::once().attempts, 1);
    }
}
