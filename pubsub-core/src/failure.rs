//! 失败路由（FailureHandler）
//!
//! 处理器或管道失败后决定确认动作；与 broker 无关，
//! 具体的 ack/nack 语义由传输层的确认句柄翻译。
//!
use crate::error::DispatchError;
use crate::handler::MessageContext;
use crate::transport::AckAction;

/// `(错误, 上下文) -> 确认动作`
pub trait FailureHandler: Send + Sync {
    fn decide(&self, error: &DispatchError, ctx: &MessageContext) -> AckAction;
}

impl<F> FailureHandler for F
where
    F: Fn(&DispatchError, &MessageContext) -> AckAction + Send + Sync,
{
    fn decide(&self, error: &DispatchError, ctx: &MessageContext) -> AckAction {
        self(error, ctx)
    }
}

/// 默认策略：拒绝且不重新入队
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectPolicy;

impl FailureHandler for RejectPolicy {
    fn decide(&self, _error: &DispatchError, _ctx: &MessageContext) -> AckAction {
        AckAction::Reject { requeue: false }
    }
}

/// 首次投递失败时重新入队；重投仍失败则拒绝（交由 broker 死信）
///
/// 配置错误（管道误用、处理器解析失败）不会因重投而恢复，直接拒绝。
#[derive(Debug, Clone, Copy, Default)]
pub struct RequeuePolicy;

impl FailureHandler for RequeuePolicy {
    fn decide(&self, error: &DispatchError, ctx: &MessageContext) -> AckAction {
        match error {
            DispatchError::Handler(_) if !ctx.redelivered() => AckAction::Reject { requeue: true },
            _ => AckAction::Reject { requeue: false },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_error() -> DispatchError {
        DispatchError::Handler(anyhow::anyhow!("boom"))
    }

    #[test]
    fn reject_policy_never_requeues() {
        let ctx = MessageContext::for_test("m", false);
        assert_eq!(
            RejectPolicy.decide(&handler_error(), &ctx),
            AckAction::Reject { requeue: false }
        );
    }

    #[test]
    fn requeue_policy_requeues_first_delivery_only() {
        let first = MessageContext::for_test("m", false);
        let again = MessageContext::for_test("m", true);

        assert_eq!(
            RequeuePolicy.decide(&handler_error(), &first),
            AckAction::Reject { requeue: true }
        );
        assert_eq!(
            RequeuePolicy.decide(&handler_error(), &again),
            AckAction::Reject { requeue: false }
        );
        assert_eq!(
            RequeuePolicy.decide(
                &DispatchError::InvalidPipelineUsage { stage: "x" },
                &first
            ),
            AckAction::Reject { requeue: false }
        );
    }

    #[test]
    fn closures_are_failure_handlers() {
        let ack_everything = |_: &DispatchError, _: &MessageContext| AckAction::Ack;
        let ctx = MessageContext::for_test("m", false);
        assert_eq!(ack_everything.decide(&handler_error(), &ctx), AckAction::Ack);
    }
}
