//! 内存版传输（InMemoryTransport）
//!
//! 基于 `tokio::sync::mpsc` 的进程内 broker，满足 `Transport` 协议：
//! - 直连交换：`(exchange, routing_key)` 完全匹配的绑定才会收到消息；
//! - 每个绑定拥有独立的投递通道；
//! - `reject(requeue = true)` 会把消息以 redelivered 标记重新入队；
//! - 无匹配绑定时消息被丢弃（与非 mandatory 发布一致）。
//!
//! 典型用途：测试环境、示例与本地开发。

use crate::error::TransportError;
use crate::transport::{Acknowledger, Binding, Delivery, DeliveryStream, Envelope, Transport};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

struct Pending {
    envelope: Envelope,
    redelivered: bool,
}

#[derive(Default)]
struct Counters {
    acked: AtomicUsize,
    rejected: AtomicUsize,
    requeued: AtomicUsize,
}

#[derive(Default)]
struct Inner {
    bindings: DashMap<Binding, mpsc::UnboundedSender<Pending>>,
    published: Mutex<Vec<Envelope>>,
    fail_next: AtomicUsize,
    next_tag: AtomicU64,
    counters: Counters,
}

/// 简单的内存 broker 实现
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 `n` 次发布以瞬时错误失败（用于演示与测试重试）
    pub fn fail_next_publishes(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// 已成功发布的信封快照
    pub fn published(&self) -> Vec<Envelope> {
        match self.inner.published.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn acked(&self) -> usize {
        self.inner.counters.acked.load(Ordering::SeqCst)
    }

    /// 不重新入队的拒绝次数
    pub fn rejected(&self) -> usize {
        self.inner.counters.rejected.load(Ordering::SeqCst)
    }

    pub fn requeued(&self) -> usize {
        self.inner.counters.requeued.load(Ordering::SeqCst)
    }

    /// 当前活跃绑定数
    pub fn binding_count(&self) -> usize {
        self.inner.bindings.len()
    }

    fn take_injected_failure(&self) -> bool {
        self.inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.take_injected_failure() {
            return Err(TransportError::transient("injected publish failure"));
        }

        for entry in self.inner.bindings.iter() {
            let binding = entry.key();
            if binding.exchange == envelope.exchange() && binding.routing_key == envelope.routing_key()
            {
                // 接收端已关闭视为绑定正在释放，忽略
                let _ = entry.value().send(Pending {
                    envelope: envelope.clone(),
                    redelivered: false,
                });
            }
        }

        if let Ok(mut g) = self.inner.published.lock() {
            g.push(envelope.clone());
        }
        Ok(())
    }

    async fn bind(&self, binding: &Binding) -> Result<DeliveryStream, TransportError> {
        if self.inner.bindings.contains_key(binding) {
            return Err(TransportError::permanent(format!(
                "binding {binding} already has a consumer"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.bindings.insert(binding.clone(), tx.clone());

        let inner = self.inner.clone();
        let stream = UnboundedReceiverStream::new(rx).map(move |pending: Pending| {
            let tag = inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let acker = InMemoryAcker {
                inner: inner.clone(),
                requeue_to: tx.clone(),
                envelope: pending.envelope.clone(),
                settled: AtomicBool::new(false),
            };
            Ok::<_, TransportError>(Delivery::new(
                pending.envelope,
                tag,
                pending.redelivered,
                Box::new(acker),
            ))
        });

        Ok(Box::pin(stream))
    }

    async fn unbind(&self, binding: &Binding) -> Result<(), TransportError> {
        self.inner.bindings.remove(binding);
        Ok(())
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    requeue_to: mpsc::UnboundedSender<Pending>,
    envelope: Envelope,
    settled: AtomicBool,
}

impl InMemoryAcker {
    fn mark_settled(&self) -> Result<(), TransportError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(TransportError::permanent("delivery already settled"));
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.mark_settled()?;
        self.inner.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.mark_settled()?;
        if requeue {
            self.inner.counters.requeued.fetch_add(1, Ordering::SeqCst);
            self.requeue_to
                .send(Pending {
                    envelope: self.envelope.clone(),
                    redelivered: true,
                })
                .map_err(|_| TransportError::transient("queue closed before requeue"))?;
        } else {
            self.inner.counters.rejected.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::AckAction;
    use std::time::Duration;

    fn envelope(key: &str) -> Envelope {
        Envelope::builder()
            .exchange("events")
            .routing_key(key)
            .event_type("test")
            .content_type("application/json")
            .payload(b"{}".to_vec())
            .build()
    }

    fn binding(queue: &str, key: &str) -> Binding {
        Binding {
            exchange: "events".into(),
            queue: queue.into(),
            routing_key: key.into(),
        }
    }

    #[tokio::test]
    async fn routes_by_exact_routing_key() {
        let transport = InMemoryTransport::new();
        let mut orders = transport.bind(&binding("q1", "orders")).await.unwrap();
        let mut users = transport.bind(&binding("q2", "users")).await.unwrap();

        transport.publish(&envelope("orders")).await.unwrap();

        let d = tokio::time::timeout(Duration::from_secs(1), orders.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(d.envelope().routing_key(), "orders");
        assert!(!d.redelivered());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), users.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn requeue_redelivers_with_flag() {
        let transport = InMemoryTransport::new();
        let mut stream = transport.bind(&binding("q", "k")).await.unwrap();
        transport.publish(&envelope("k")).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        first
            .settle(AckAction::Reject { requeue: true })
            .await
            .unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered());
        second.settle(AckAction::Ack).await.unwrap();

        assert_eq!(transport.requeued(), 1);
        assert_eq!(transport.acked(), 1);
        assert_eq!(transport.rejected(), 0);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_counted_down() {
        let transport = InMemoryTransport::new();
        transport.fail_next_publishes(2);
        assert!(transport.publish(&envelope("k")).await.is_err());
        assert!(transport.publish(&envelope("k")).await.is_err());
        assert!(transport.publish(&envelope("k")).await.is_ok());
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_bind_is_rejected_until_unbound() {
        let transport = InMemoryTransport::new();
        let b = binding("q", "k");
        let _stream = transport.bind(&b).await.unwrap();
        assert!(transport.bind(&b).await.is_err());

        transport.unbind(&b).await.unwrap();
        transport.unbind(&b).await.unwrap();
        assert_eq!(transport.binding_count(), 0);
        assert!(transport.bind(&b).await.is_ok());
    }
}
