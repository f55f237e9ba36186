//! 单条投递的分发：解码 → 管道 → 处理器 → 确认动作
//!
//! 每条投递恰好决定一次确认动作，并通过投递自带的确认句柄应用一次；
//! 不在内部重试处理器。
//!
use crate::codec::Codec;
use crate::error::DispatchError;
use crate::event::Event;
use crate::failure::FailureHandler;
use crate::handler::{EventHandler, HandlerRegistry, MessageContext};
use crate::pipeline::{Endpoint, InboundMessage, Pipeline, PipelineOutcome};
use crate::transport::{AckAction, Delivery};
use anyhow::anyhow;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 订阅级分发器：事件类型 `E`、处理器类型 `H` 与编解码器 `C` 在订阅时固定
pub(crate) struct Dispatcher<E, H, C> {
    queue: String,
    codec: C,
    pipeline: Pipeline,
    registry: HandlerRegistry,
    failure_handler: Arc<dyn FailureHandler>,
    _marker: PhantomData<fn() -> (E, H)>,
}

impl<E, H, C> Dispatcher<E, H, C>
where
    E: Event,
    H: EventHandler<E> + 'static,
    C: Codec,
{
    pub(crate) fn new(
        queue: String,
        codec: C,
        pipeline: Pipeline,
        registry: HandlerRegistry,
        failure_handler: Arc<dyn FailureHandler>,
    ) -> Self {
        Self {
            queue,
            codec,
            pipeline,
            registry,
            failure_handler,
            _marker: PhantomData,
        }
    }

    /// 处理一条投递并确认；`abandon` 触发时放弃处理并重新入队
    pub(crate) async fn process(&self, delivery: Delivery, abandon: CancellationToken) {
        let ctx = MessageContext::from_delivery(&delivery, &self.queue, E::EVENT_TYPE);
        let delivery_tag = ctx.delivery_tag();

        let action = tokio::select! {
            action = self.decide(&delivery, ctx) => action,
            _ = abandon.cancelled() => {
                warn!(
                    queue = %self.queue,
                    event_type = E::EVENT_TYPE,
                    delivery_tag,
                    "in-flight delivery abandoned, requeueing"
                );
                AckAction::Reject { requeue: true }
            }
        };

        if let Err(err) = delivery.settle(action).await {
            error!(
                queue = %self.queue,
                event_type = E::EVENT_TYPE,
                delivery_tag,
                ?action,
                error = %err,
                "failed to settle delivery"
            );
        }
    }

    async fn decide(&self, delivery: &Delivery, ctx: MessageContext) -> AckAction {
        let event = match self.codec.decode::<E>(delivery.envelope().payload()) {
            Ok(event) => event,
            Err(err) => {
                // 失败策略可以观察解码错误，但结果固定为不重新入队：重投同样的字节不会成功
                let err = DispatchError::Decode(err);
                let proposed = self.failure_handler.decide(&err, &ctx);
                warn!(
                    queue = %self.queue,
                    routing_key = ctx.routing_key(),
                    event_type = E::EVENT_TYPE,
                    delivery_tag = ctx.delivery_tag(),
                    ?proposed,
                    error = %err,
                    "decode failed, rejecting without requeue"
                );
                return AckAction::Reject { requeue: false };
            }
        };

        let msg = InboundMessage::new(ctx, event);
        let endpoint = HandlerEndpoint::<E, H> {
            registry: &self.registry,
            _marker: PhantomData,
        };

        match self.pipeline.run(&msg, &endpoint).await {
            Ok(PipelineOutcome::Completed) => AckAction::Ack,
            Ok(PipelineOutcome::ShortCircuited { stage }) => {
                debug!(
                    queue = %self.queue,
                    delivery_tag = msg.context().delivery_tag(),
                    stage,
                    "pipeline short-circuited"
                );
                AckAction::Ack
            }
            Err(err) => {
                let action = self.failure_handler.decide(&err, msg.context());
                warn!(
                    queue = %self.queue,
                    routing_key = msg.context().routing_key(),
                    event_type = E::EVENT_TYPE,
                    delivery_tag = msg.context().delivery_tag(),
                    redelivered = msg.context().redelivered(),
                    ?action,
                    error = %err,
                    "delivery failed"
                );
                action
            }
        }
    }
}

/// 管道终点：按投递解析处理器实例并调用
struct HandlerEndpoint<'a, E, H> {
    registry: &'a HandlerRegistry,
    _marker: PhantomData<fn() -> (E, H)>,
}

#[async_trait]
impl<E, H> Endpoint for HandlerEndpoint<'_, E, H>
where
    E: Event,
    H: EventHandler<E> + 'static,
{
    async fn call(&self, msg: &InboundMessage) -> anyhow::Result<()> {
        let factory = self
            .registry
            .resolve::<E, H>()
            .map_err(DispatchError::from)?;
        let event = msg
            .downcast_ref::<E>()
            .ok_or_else(|| anyhow!("message body is not a {}", E::EVENT_TYPE))?;

        let handler = factory();
        handler.handle(msg.context(), event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::error::TransportError;
    use crate::failure::{RejectPolicy, RequeuePolicy};
    use crate::pipeline::{Middleware, Next};
    use crate::transport::{Acknowledger, Envelope};
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct Shipped {
        order_id: u64,
    }

    impl Event for Shipped {
        const EVENT_TYPE: &'static str = "order.shipped";
    }

    #[derive(Default)]
    struct Spy {
        handled: AtomicUsize,
        fail: bool,
        delay: Option<Duration>,
    }

    struct SpyHandler(Arc<Spy>);

    #[async_trait]
    impl EventHandler<Shipped> for SpyHandler {
        async fn handle(&self, _ctx: &MessageContext, event: &Shipped) -> anyhow::Result<()> {
            if let Some(d) = self.0.delay {
                tokio::time::sleep(d).await;
            }
            self.0.handled.fetch_add(1, Ordering::SeqCst);
            if self.0.fail {
                anyhow::bail!("cannot ship order {}", event.order_id);
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Settled(Arc<Mutex<Vec<AckAction>>>);

    impl Settled {
        fn all(&self) -> Vec<AckAction> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Acknowledger for Settled {
        async fn ack(&self) -> Result<(), TransportError> {
            self.0.lock().unwrap().push(AckAction::Ack);
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
            self.0.lock().unwrap().push(AckAction::Reject { requeue });
            Ok(())
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Middleware for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle(&self, _msg: &InboundMessage, next: Next<'_>) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.run().await
        }
    }

    fn delivery(payload: &[u8], redelivered: bool, settled: &Settled) -> Delivery {
        let envelope = Envelope::builder()
            .exchange("events")
            .routing_key("orders")
            .event_type(Shipped::EVENT_TYPE)
            .content_type("application/json")
            .payload(payload.to_vec())
            .build();
        Delivery::new(envelope, 1, redelivered, Box::new(settled.clone()))
    }

    fn dispatcher(
        spy: Arc<Spy>,
        pipeline: Pipeline,
        failure_handler: Arc<dyn FailureHandler>,
    ) -> Dispatcher<Shipped, SpyHandler, JsonCodec> {
        let registry = HandlerRegistry::new();
        registry.register::<Shipped, SpyHandler, _>(move || SpyHandler(spy.clone()));
        Dispatcher::new(
            "shipping".into(),
            JsonCodec,
            pipeline,
            registry,
            failure_handler,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_delivery_is_acked_once() {
        let spy = Arc::new(Spy::default());
        let settled = Settled::default();
        let d = dispatcher(spy.clone(), Pipeline::new(), Arc::new(RejectPolicy));

        d.process(delivery(br#"{"order_id":1}"#, false, &settled), CancellationToken::new())
            .await;

        assert_eq!(spy.handled.load(Ordering::SeqCst), 1);
        assert_eq!(settled.all(), vec![AckAction::Ack]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn decode_failure_skips_pipeline_and_overrides_policy() {
        let spy = Arc::new(Spy::default());
        let stage_calls = Arc::new(AtomicUsize::new(0));
        let decode_errors = Arc::new(AtomicUsize::new(0));
        let settled = Settled::default();

        let observed = decode_errors.clone();
        let d = dispatcher(
            spy.clone(),
            Pipeline::new().with(Counting(stage_calls.clone())),
            Arc::new(move |err: &DispatchError, _: &MessageContext| {
                if matches!(err, DispatchError::Decode(_)) {
                    observed.fetch_add(1, Ordering::SeqCst);
                }
                // 策略要求重新入队，但解码失败不允许
                AckAction::Reject { requeue: true }
            }),
        );

        d.process(delivery(b"garbage", false, &settled), CancellationToken::new())
            .await;

        assert_eq!(decode_errors.load(Ordering::SeqCst), 1);
        assert_eq!(stage_calls.load(Ordering::SeqCst), 0);
        assert_eq!(spy.handled.load(Ordering::SeqCst), 0);
        assert_eq!(settled.all(), vec![AckAction::Reject { requeue: false }]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_failure_goes_through_failure_handler() {
        let spy = Arc::new(Spy {
            fail: true,
            ..Default::default()
        });
        let settled = Settled::default();
        let d = dispatcher(spy.clone(), Pipeline::new(), Arc::new(RequeuePolicy));

        d.process(delivery(br#"{"order_id":7}"#, false, &settled), CancellationToken::new())
            .await;
        d.process(delivery(br#"{"order_id":7}"#, true, &settled), CancellationToken::new())
            .await;

        assert_eq!(
            settled.all(),
            vec![
                AckAction::Reject { requeue: true },
                AckAction::Reject { requeue: false }
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overridden_handler_type_fails_resolution_per_delivery() {
        struct Replacement;

        #[async_trait]
        impl EventHandler<Shipped> for Replacement {
            async fn handle(&self, _ctx: &MessageContext, _event: &Shipped) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let spy = Arc::new(Spy::default());
        let settled = Settled::default();
        let registry = HandlerRegistry::new();
        let s = spy.clone();
        registry.register::<Shipped, SpyHandler, _>(move || SpyHandler(s.clone()));

        let seen = Arc::new(Mutex::new(None));
        let seen_in_policy = seen.clone();
        let d = Dispatcher::<Shipped, SpyHandler, JsonCodec>::new(
            "shipping".into(),
            JsonCodec,
            Pipeline::new(),
            registry.clone(),
            Arc::new(move |err: &DispatchError, _: &MessageContext| {
                *seen_in_policy.lock().unwrap() =
                    Some(matches!(err, DispatchError::Resolution(_)));
                AckAction::Reject { requeue: false }
            }),
        );

        // 订阅之后被替换为其他处理器类型
        registry.override_handler::<Shipped, Replacement, _>(|| Replacement);

        d.process(delivery(br#"{"order_id":1}"#, false, &settled), CancellationToken::new())
            .await;

        assert_eq!(*seen.lock().unwrap(), Some(true));
        assert_eq!(spy.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abandoned_delivery_is_requeued() {
        let spy = Arc::new(Spy {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let settled = Settled::default();
        let d = dispatcher(spy.clone(), Pipeline::new(), Arc::new(RejectPolicy));
        let abandon = CancellationToken::new();
        abandon.cancel();

        d.process(delivery(br#"{"order_id":1}"#, false, &settled), abandon)
            .await;

        assert_eq!(spy.handled.load(Ordering::SeqCst), 0);
        assert_eq!(settled.all(), vec![AckAction::Reject { requeue: true }]);
    }
}
