//! 重试策略（RetryPolicy）
//!
//! 以有界次数与退避时长包装任意可失败的异步操作（发布、绑定队列等）：
//! - 仅瞬时错误消耗重试预算；
//! - 永久错误立即失败，不消耗重试；
//! - 预算耗尽时返回 `RetryError::Exhausted`，携带最后一次瞬时错误。
//!
//! 默认策略：重试 3 次，指数退避 100ms 起步、倍率 2、上限 5s（即 100ms / 200ms / 400ms）。
//! 退避只依赖尝试序号，便于测试复现。
//!
use crate::error::RetryError;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// 错误分类：瞬时（可重试）或永久
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// 退避函数：对尝试序号单调不减且确定
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// 立即重试
    None,
    /// 固定间隔
    Fixed {
        #[serde(rename = "delay_ms", with = "millis")]
        delay: Duration,
    },
    /// 指数退避：`initial * multiplier^(attempt-1)`，不超过 `max`
    Exponential {
        #[serde(rename = "initial_ms", with = "millis")]
        initial: Duration,
        multiplier: u32,
        #[serde(rename = "max_ms", with = "millis")]
        max: Duration,
    },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// 第 `attempt` 次失败（从 1 开始）之后的等待时长
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exp = attempt.saturating_sub(1);
                let factor = multiplier.max(1).checked_pow(exp).unwrap_or(u32::MAX);
                initial.checked_mul(factor).unwrap_or(max).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2,
            max: Duration::from_secs(5),
        }
    }
}

/// 有界重试策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 首次尝试之外的最大重试次数
    pub retry_count: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(retry_count: u32, backoff: Backoff) -> Self {
        Self {
            retry_count,
            backoff,
        }
    }

    /// 不重试
    pub fn none() -> Self {
        Self::new(0, Backoff::None)
    }

    /// 执行操作；`op` 接收当前尝试序号（从 1 开始）
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => {
                    debug!(attempt, error = %err, "permanent failure, not retrying");
                    return Err(RetryError::Permanent(err));
                }
                Err(err) if attempt > self.retry_count => {
                    warn!(attempts = attempt, error = %err, "retry budget exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(err) => {
                    let delay = self.backoff.delay(attempt);
                    debug!(attempt, ?delay, error = %err, "transient failure, retrying");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
