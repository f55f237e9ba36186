//! 统一错误定义
//!
//! 按边界拆分：传输（`TransportError`）、编解码（`CodecError`）、
//! 重试（`RetryError`）、发布（`PublishError`）、订阅（`SubscribeError`）、
//! 处理器解析（`HandlerResolutionError`）与单条消息分发（`DispatchError`）。
//!
use crate::retry::Retryable;
use thiserror::Error;

/// 传输层错误：区分可重试（瞬时）与不可重试（永久）
#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// 连接断开、通道关闭、broker 超时等
    #[error("transient broker failure: {reason}")]
    Transient { reason: String },
    /// broker 拒绝、路由不存在等
    #[error("permanent broker failure: {reason}")]
    Permanent { reason: String },
}

impl TransportError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }
}

impl Retryable for TransportError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// 编解码错误（永久错误，不参与重试）
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: type={event_type}, reason={reason}")]
    Encode {
        event_type: &'static str,
        reason: String,
    },
    #[error("decode failed: type={event_type}, reason={reason}")]
    Decode {
        event_type: &'static str,
        reason: String,
    },
}

/// 重试包装后的错误
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// 永久错误：未消耗任何重试次数
    #[error("permanent failure: {0}")]
    Permanent(E),
    /// 瞬时错误耗尽重试预算，携带最后一次错误
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent(e) => e,
            Self::Exhausted { last, .. } => last,
        }
    }
}

/// 发布失败：以结果值返回，调用方决定上抛、记录或升级
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("type constraint violation: event={event_type} is not a subtype of {base}")]
    TypeConstraintViolation {
        event_type: &'static str,
        base: &'static str,
    },
    #[error("serialization failed: {0}")]
    SerializationFailed(#[from] CodecError),
    #[error("broker unavailable after {attempts} attempts: {last}")]
    BrokerUnavailable { attempts: u32, last: TransportError },
    #[error("publish rejected: {0}")]
    Rejected(TransportError),
}

impl From<RetryError<TransportError>> for PublishError {
    fn from(err: RetryError<TransportError>) -> Self {
        match err {
            RetryError::Permanent(e) => PublishError::Rejected(e),
            RetryError::Exhausted { attempts, last } => {
                PublishError::BrokerUnavailable { attempts, last }
            }
        }
    }
}

/// 处理器解析失败（配置错误）
#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum HandlerResolutionError {
    #[error("no handler registered: event={event_type}")]
    NotRegistered { event_type: &'static str },
    #[error("ambiguous handlers: event={event_type}, candidates={candidates:?}")]
    Ambiguous {
        event_type: &'static str,
        candidates: Vec<&'static str>,
    },
    #[error("handler mismatch: event={event_type}, expected={expected}, found={found}")]
    Mismatch {
        event_type: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}

/// 订阅失败：同步返回，订阅不会启动
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("already bound: queue={queue}, routing_key={routing_key}")]
    AlreadyBound { queue: String, routing_key: String },
    #[error("handler not resolvable: {0}")]
    HandlerNotResolvable(#[from] HandlerResolutionError),
    #[error("type constraint violation: event={event_type} is not a subtype of {base}")]
    TypeConstraintViolation {
        event_type: &'static str,
        base: &'static str,
    },
    #[error("bind failed: {0}")]
    Bind(TransportError),
    #[error("event bus is shut down")]
    Closed,
}

/// 单条消息的分发错误，最终由 FailureHandler 转换为确认动作
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("decode failed: {0}")]
    Decode(#[from] CodecError),
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),
    #[error("invalid pipeline usage: stage={stage} invoked its continuation more than once")]
    InvalidPipelineUsage { stage: &'static str },
    #[error("handler resolution failed: {0}")]
    Resolution(#[from] HandlerResolutionError),
}

/// 发布结果类型别名
pub type PublishResult<T = ()> = Result<T, PublishError>;
