//! 订阅消费循环
//!
//! 每个订阅一个长驻任务：
//! - 从投递流取消息，受 `prefetch` 限制的并发处理；
//! - 取消后不再取新消息，在宽限期内等待在途投递完成；
//! - 宽限期到仍未完成的投递被放弃并重新入队。
//!
use crate::bus::dispatch::Dispatcher;
use crate::codec::Codec;
use crate::event::Event;
use crate::handler::EventHandler;
use crate::transport::DeliveryStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

pub(crate) struct ConsumeLoop<E, H, C> {
    pub(crate) dispatcher: Arc<Dispatcher<E, H, C>>,
    pub(crate) stream: DeliveryStream,
    pub(crate) prefetch: usize,
    pub(crate) shutdown_grace: Duration,
}

impl<E, H, C> ConsumeLoop<E, H, C>
where
    E: Event,
    H: EventHandler<E> + 'static,
    C: Codec,
{
    pub(crate) async fn run(self, token: CancellationToken) {
        let Self {
            dispatcher,
            mut stream,
            prefetch,
            shutdown_grace,
        } = self;

        let tracker = TaskTracker::new();
        let abandon = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(prefetch.max(1)));

        loop {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                maybe = stream.next() => match maybe {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => {
                        warn!(error = %err, event_type = E::EVENT_TYPE, "delivery stream error");
                        continue;
                    }
                    None => {
                        // 传输层主动结束了消费者；总线在下次订阅或列举时清理该条目
                        warn!(event_type = E::EVENT_TYPE, "delivery stream ended by transport");
                        break;
                    }
                },
            };

            let dispatcher = dispatcher.clone();
            let abandon = abandon.clone();
            tracker.spawn(async move {
                let _permit = permit;
                dispatcher.process(delivery, abandon).await;
            });
        }

        tracker.close();
        if tokio::time::timeout(shutdown_grace, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = tracker.len(),
                grace = ?shutdown_grace,
                event_type = E::EVENT_TYPE,
                "shutdown grace elapsed, abandoning in-flight deliveries"
            );
            abandon.cancel();
            tracker.wait().await;
        }
    }
}
