//! 传输层（Transport）协议
//!
//! 具体 broker（AMQP/MQTT/Kafka 等）位于核心之外，只通过这里的窄接口交互：
//! - `publish`：将信封投递到 exchange/routing key；
//! - `bind`：绑定 queue/routing key，返回 `'static` 生命周期的投递流，
//!   便于在 `tokio::spawn` 中消费；
//! - 每条 `Delivery` 携带确认句柄，核心对其只做一次 `settle`。
//!
#[cfg(feature = "inmemory")]
mod inmemory;

#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryTransport;

use crate::error::TransportError;
use async_trait::async_trait;
use bon::Builder;
use futures_core::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;

/// 投递流：由传输层产出，直到绑定被释放
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// 传输协议
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<(), TransportError>;

    async fn bind(&self, binding: &Binding) -> Result<DeliveryStream, TransportError>;

    /// 释放绑定；重复释放不应报错
    async fn unbind(&self, binding: &Binding) -> Result<(), TransportError>;
}

/// 线上传输单元
#[derive(Debug, Clone, Builder)]
pub struct Envelope {
    #[builder(into)]
    exchange: String,
    #[builder(into)]
    routing_key: String,
    #[builder(into)]
    event_type: String,
    #[builder(into)]
    content_type: String,
    #[builder(default = uuid::Uuid::new_v4().to_string())]
    message_id: String,
    #[builder(default)]
    headers: BTreeMap<String, String>,
    payload: Vec<u8>,
}

impl Envelope {
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// 队列绑定
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}<-{}", self.exchange, self.queue, self.routing_key)
    }
}

/// 确认动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Ack,
    Reject { requeue: bool },
}

/// broker 侧确认原语（由具体传输实现）
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;

    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// 单次投递：信封 + broker 分配的投递标签 + 确认句柄
pub struct Delivery {
    envelope: Envelope,
    delivery_tag: u64,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        envelope: Envelope,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            envelope,
            delivery_tag,
            redelivered,
            acker,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// 将确认动作翻译为 broker 原语；消费 `self`，保证每条投递只确认一次
    pub async fn settle(self, action: AckAction) -> Result<(), TransportError> {
        match action {
            AckAction::Ack => self.acker.ack().await,
            AckAction::Reject { requeue } => self.acker.reject(requeue).await,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}
