//! 事件总线（EventBus）
//!
//! 面向应用的门面：
//! - `publish`：类型约束校验 → 编码 → 在重试策略下调用传输层发布；
//! - `subscribe`：校验处理器 → 预占绑定 → 绑定队列 → 启动消费循环；
//! - `unsubscribe` / `shutdown`：停止消费，在宽限期内等待在途投递，释放绑定。
//!
//! 发布失败以结果值返回；订阅的配置错误同步返回，失败的订阅没有任何副作用。
//!
mod consumer;
mod dispatch;
mod options;

pub use options::{
    BusOptions, BusSettings, ConnectionOptions, ConnectionSettings, DEFAULT_EXCHANGE,
    DEFAULT_PREFETCH, DEFAULT_SHUTDOWN_GRACE,
};

use crate::codec::Codec;
use crate::error::{PublishError, PublishResult, SubscribeError};
use crate::event::Event;
use crate::handler::{EventHandler, HandlerManifest, HandlerRegistry};
use crate::pipeline::Pipeline;
use crate::transport::{Binding, Envelope, Transport};
use bon::Builder;
use consumer::ConsumeLoop;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dispatch::Dispatcher;
use std::any::type_name;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// 导入由 bon::Builder 生成的 typestate 模块与状态转换别名
use self::event_bus_builder::{IsUnset, SetRegistry, State as BuilderState};

/// 订阅句柄：标识一个活跃订阅，只读
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    binding: Binding,
    event_type: &'static str,
    handler_type: &'static str,
}

impl SubscriptionHandle {
    pub fn exchange(&self) -> &str {
        &self.binding.exchange
    }

    pub fn queue(&self) -> &str {
        &self.binding.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.binding.routing_key
    }

    pub fn event_type(&self) -> &'static str {
        self.event_type
    }

    pub fn handler_type(&self) -> &'static str {
        self.handler_type
    }
}

/// 活跃订阅的运行期状态
struct Subscription {
    handle: SubscriptionHandle,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    // 传输层结束投递流后消费循环自行退出
    fn has_ended(&self) -> bool {
        self.task.is_finished()
    }
}

/// 事件总线
/// - `B`：基础事件类型，所有发布与订阅的事件必须是它或它的子类型
/// - `C`：编解码器
#[derive(Builder)]
pub struct EventBus<B: Event, C: Codec> {
    transport: Arc<dyn Transport>,
    registry: HandlerRegistry,
    #[builder(default)]
    codec: C,
    #[builder(default)]
    pipeline: Pipeline,
    #[builder(default)]
    options: BusOptions,
    // None 表示绑定已预占、订阅仍在建立中
    #[builder(skip)]
    subscriptions: DashMap<Binding, Option<Subscription>>,
    #[builder(skip)]
    shutdown: CancellationToken,
    #[builder(skip)]
    _base: PhantomData<fn() -> B>,
}

// 自定义 Builder 方法：接收处理器清单，内部转换为 HandlerRegistry。
// 受 typestate 限制，`handlers(...)` 与 `registry(...)` 只能二选一。
impl<B: Event, C: Codec, S: BuilderState> EventBusBuilder<B, C, S> {
    pub fn handlers(self, manifest: HandlerManifest) -> EventBusBuilder<B, C, SetRegistry<S>>
    where
        <S as BuilderState>::Registry: IsUnset,
    {
        self.registry(HandlerRegistry::from_manifest(manifest))
    }
}

impl<B: Event, C: Codec> EventBus<B, C> {
    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// 发布事件；`exchange` 为 None 时使用配置的默认交换
    pub async fn publish<E: Event>(
        &self,
        event: &E,
        routing_key: &str,
        exchange: Option<&str>,
    ) -> PublishResult {
        if !E::is_subtype_of::<B>() {
            warn!(
                event_type = E::EVENT_TYPE,
                base = B::EVENT_TYPE,
                routing_key,
                "publish rejected: type constraint violation"
            );
            return Err(PublishError::TypeConstraintViolation {
                event_type: E::EVENT_TYPE,
                base: B::EVENT_TYPE,
            });
        }

        let payload = self.codec.encode(event)?;
        let envelope = Envelope::builder()
            .exchange(exchange.unwrap_or(self.options.default_exchange()))
            .routing_key(routing_key)
            .event_type(E::EVENT_TYPE)
            .content_type(self.codec.content_type())
            .payload(payload)
            .build();

        let transport = &self.transport;
        let env = &envelope;
        let result = self
            .options
            .retry()
            .run(move |attempt| {
                debug!(
                    attempt,
                    message_id = env.message_id(),
                    routing_key = env.routing_key(),
                    "publishing"
                );
                transport.publish(env)
            })
            .await;

        match result {
            Ok(()) => {
                debug!(
                    event_type = E::EVENT_TYPE,
                    exchange = envelope.exchange(),
                    routing_key,
                    message_id = envelope.message_id(),
                    "published"
                );
                Ok(())
            }
            Err(err) => {
                let err = PublishError::from(err);
                error!(
                    event_type = E::EVENT_TYPE,
                    exchange = envelope.exchange(),
                    routing_key,
                    message_id = envelope.message_id(),
                    error = %err,
                    "publish failed"
                );
                Err(err)
            }
        }
    }

    /// 顺序发布一批事件，遇到第一个错误即停止
    pub async fn publish_all<'a, E, I>(
        &self,
        events: I,
        routing_key: &str,
        exchange: Option<&str>,
    ) -> PublishResult
    where
        E: Event,
        I: IntoIterator<Item = &'a E>,
    {
        for event in events {
            self.publish(event, routing_key, exchange).await?;
        }
        Ok(())
    }

    /// 订阅：`H` 必须是注册表中 `E` 的唯一处理器
    pub async fn subscribe<E, H>(
        &self,
        queue: &str,
        routing_key: &str,
    ) -> Result<SubscriptionHandle, SubscribeError>
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(SubscribeError::Closed);
        }
        if !E::is_subtype_of::<B>() {
            return Err(SubscribeError::TypeConstraintViolation {
                event_type: E::EVENT_TYPE,
                base: B::EVENT_TYPE,
            });
        }
        self.registry.resolve::<E, H>()?;

        let binding = Binding {
            exchange: self.options.default_exchange().to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if let Some(stale) = self.reserve(&binding)? {
            if let Err(err) = self.transport.unbind(&binding).await {
                warn!(%binding, error = %err, "unbind of ended subscription failed");
            }
            debug!(%binding, event_type = stale.handle.event_type, "replaced ended subscription");
        }

        let transport = &self.transport;
        let b = &binding;
        let stream = match self.options.retry().run(move |_| transport.bind(b)).await {
            Ok(stream) => stream,
            Err(err) => {
                self.subscriptions.remove(&binding);
                let err = err.into_inner();
                error!(%binding, error = %err, "bind failed");
                return Err(SubscribeError::Bind(err));
            }
        };

        let dispatcher = Dispatcher::<E, H, C>::new(
            queue.to_string(),
            self.codec.clone(),
            self.pipeline.clone(),
            self.registry.clone(),
            self.options.failure_handler().clone(),
        );
        let consume = ConsumeLoop {
            dispatcher: Arc::new(dispatcher),
            stream,
            prefetch: self.options.prefetch(),
            shutdown_grace: self.options.shutdown_grace(),
        };
        let token = self.shutdown.child_token();
        let task = tokio::spawn(consume.run(token.clone()));

        let handle = SubscriptionHandle {
            binding: binding.clone(),
            event_type: E::EVENT_TYPE,
            handler_type: type_name::<H>(),
        };
        self.subscriptions.insert(
            binding.clone(),
            Some(Subscription {
                handle: handle.clone(),
                token,
                task,
            }),
        );

        // 与 shutdown 并发时，shutdown 可能已经跳过了仍处于预占状态的条目
        if self.shutdown.is_cancelled() {
            if let Some((binding, Some(sub))) =
                self.subscriptions.remove_if(&binding, |_, sub| sub.is_some())
            {
                self.stop(binding, sub).await;
            }
            return Err(SubscribeError::Closed);
        }

        info!(
            %binding,
            event_type = E::EVENT_TYPE,
            handler = handle.handler_type,
            "subscribed"
        );
        Ok(handle)
    }

    /// 取消订阅；幂等
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let removed = self
            .subscriptions
            .remove_if(&handle.binding, |_, sub| sub.is_some());
        if let Some((binding, Some(sub))) = removed {
            self.stop(binding, sub).await;
        }
    }

    /// 停止所有订阅；之后的 `subscribe` 返回 `SubscribeError::Closed`
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let bindings: Vec<Binding> = self
            .subscriptions
            .iter()
            .filter(|e| e.value().is_some())
            .map(|e| e.key().clone())
            .collect();

        for binding in bindings {
            if let Some((binding, Some(sub))) =
                self.subscriptions.remove_if(&binding, |_, sub| sub.is_some())
            {
                self.stop(binding, sub).await;
            }
        }
        info!("event bus shut down");
    }

    /// 当前活跃订阅
    pub fn subscriptions(&self) -> Vec<SubscriptionHandle> {
        self.subscriptions
            .iter()
            .filter_map(|e| {
                e.value()
                    .as_ref()
                    .filter(|s| !s.has_ended())
                    .map(|s| s.handle.clone())
            })
            .collect()
    }

    /// 预占绑定；若原订阅的消费循环已结束则接管该绑定并返回旧订阅
    fn reserve(&self, binding: &Binding) -> Result<Option<Subscription>, SubscribeError> {
        match self.subscriptions.entry(binding.clone()) {
            Entry::Occupied(mut slot)
                if slot.get().as_ref().is_some_and(Subscription::has_ended) =>
            {
                Ok(slot.insert(None))
            }
            Entry::Occupied(_) => {
                warn!(%binding, "subscribe rejected: binding already taken");
                Err(SubscribeError::AlreadyBound {
                    queue: binding.queue.clone(),
                    routing_key: binding.routing_key.clone(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(None);
                Ok(None)
            }
        }
    }

    async fn stop(&self, binding: Binding, sub: Subscription) {
        sub.token.cancel();
        if let Err(err) = sub.task.await {
            error!(%binding, error = %err, "consume loop terminated abnormally");
        }
        if let Err(err) = self.transport.unbind(&binding).await {
            warn!(%binding, error = %err, "unbind failed");
        }
        info!(%binding, event_type = sub.handle.event_type, "unsubscribed");
    }
}

impl<B: Event, C: Codec> Drop for EventBus<B, C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<B: Event, C: Codec> std::fmt::Debug for EventBus<B, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("base", &B::EVENT_TYPE)
            .field("options", &self.options)
            .field("pipeline", &self.pipeline)
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}
