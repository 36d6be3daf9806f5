use std::time::Duration;

use rand::Rng;

/// 重试退避策略
#[derive(Clone, Debug)]
pub enum Backoff {
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    /// 第 `attempt` 次失败后的基础等待时间（从 1 开始计数）
    pub fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base, max } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                std::cmp::min(base.saturating_mul(factor), *max)
            }
        }
    }

    /// 加入 0..=50% 的随机抖动，避免大量任务同时重试
    pub fn jittered_delay_at(&self, attempt: u32) -> Duration {
        let delay = self.delay_at(attempt);
        let jitter_ms = (delay.as_millis() / 2) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}
