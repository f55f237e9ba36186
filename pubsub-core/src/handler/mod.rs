//! 事件处理器（EventHandler）
//!
//! 定义对某一事件类型的消费逻辑，以及每条消息的只读上下文（`MessageContext`）。
//! 处理器实例按投递从注册表的工厂获取，投递结束即释放。
//!
mod registry;

pub use registry::{HandlerDescriptor, HandlerFactory, HandlerManifest, HandlerRegistry};

use crate::event::Event;
use crate::transport::Delivery;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 事件处理器：处理某一类型的事件
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, ctx: &MessageContext, event: &E) -> anyhow::Result<()>;
}

/// 单条投递的上下文，仅在该投递处理期间存在
#[derive(Debug, Clone)]
pub struct MessageContext {
    message_id: String,
    event_type: &'static str,
    exchange: String,
    queue: String,
    routing_key: String,
    delivery_tag: u64,
    redelivered: bool,
    received_at: DateTime<Utc>,
}

impl MessageContext {
    pub(crate) fn from_delivery(delivery: &Delivery, queue: &str, event_type: &'static str) -> Self {
        let envelope = delivery.envelope();
        Self {
            message_id: envelope.message_id().to_string(),
            event_type,
            exchange: envelope.exchange().to_string(),
            queue: queue.to_string(),
            routing_key: envelope.routing_key().to_string(),
            delivery_tag: delivery.delivery_tag(),
            redelivered: delivery.redelivered(),
            received_at: Utc::now(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// 订阅声明的事件类型名
    pub fn event_type(&self) -> &'static str {
        self.event_type
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

#[cfg(test)]
impl MessageContext {
    pub(crate) fn for_test(message_id: &str, redelivered: bool) -> Self {
        Self {
            message_id: message_id.to_string(),
            event_type: "test",
            exchange: "events".into(),
            queue: "q".into(),
            routing_key: "k".into(),
            delivery_tag: 1,
            redelivered,
            received_at: Utc::now(),
        }
    }
}
