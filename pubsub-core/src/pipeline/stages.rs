//! 内置管道阶段
//!
//! - `Filter`：谓词不成立时短路；
//! - `Deduplicate`：时间窗口内按 message id 去重；
//! - `LogErrors`：记录下游错误，可选择吞掉；
//! - `Timeout`：限制下游执行时长。
//!
use crate::pipeline::{InboundMessage, Middleware, Next};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

type Predicate = dyn Fn(&InboundMessage) -> bool + Send + Sync;

/// 谓词过滤：返回 false 的消息被短路（仍会被确认）
pub struct Filter {
    name: &'static str,
    predicate: Box<Predicate>,
}

impl Filter {
    pub fn new<F>(name: &'static str, predicate: F) -> Self
    where
        F: Fn(&InboundMessage) -> bool + Send + Sync + 'static,
    {
        Self {
            name,
            predicate: Box::new(predicate),
        }
    }
}

#[async_trait]
impl Middleware for Filter {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(&self, msg: &InboundMessage, next: Next<'_>) -> anyhow::Result<()> {
        if (self.predicate)(msg) {
            return next.run().await;
        }
        debug!(
            stage = self.name,
            message_id = msg.context().message_id(),
            "message filtered out"
        );
        Ok(())
    }
}

/// 时间窗口去重
///
/// 以 message id 为键记录首次进入时间；窗口内重复的消息被短路。
/// 下游失败时撤销记录，使 broker 的重投仍能到达处理器。
/// 过期条目每 `cleanup_interval` 次调用清理一次。
pub struct Deduplicate {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    ops_since_cleanup: AtomicU32,
    cleanup_interval: u32,
}

impl Deduplicate {
    pub fn new(ttl: Duration) -> Self {
        Self::with_cleanup_interval(ttl, 1000)
    }

    pub fn with_cleanup_interval(ttl: Duration, cleanup_interval: u32) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
            ops_since_cleanup: AtomicU32::new(0),
            cleanup_interval: cleanup_interval.max(1),
        }
    }

    /// 首次出现（或已过期）返回 true 并记录
    fn check(&self, id: &str) -> bool {
        let now = Instant::now();

        let ops = self.ops_since_cleanup.fetch_add(1, Ordering::Relaxed);
        if ops >= self.cleanup_interval {
            self.ops_since_cleanup.store(0, Ordering::Relaxed);
            self.with_seen(|seen| seen.retain(|_, at| now.duration_since(*at) < self.ttl));
        }

        self.with_seen(|seen| {
            if let Some(at) = seen.get(id)
                && now.duration_since(*at) < self.ttl
            {
                return false;
            }
            seen.insert(id.to_string(), now);
            true
        })
    }

    fn forget(&self, id: &str) {
        self.with_seen(|seen| {
            seen.remove(id);
        });
    }

    /// 当前跟踪的 id 数量（快照）
    pub fn len(&self) -> usize {
        self.with_seen(|seen| seen.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_seen<R>(&self, f: impl FnOnce(&mut HashMap<String, Instant>) -> R) -> R {
        match self.seen.lock() {
            Ok(mut g) => f(&mut *g),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl Middleware for Deduplicate {
    fn name(&self) -> &'static str {
        "deduplicate"
    }

    async fn handle(&self, msg: &InboundMessage, next: Next<'_>) -> anyhow::Result<()> {
        let id = msg.context().message_id();
        if !self.check(id) {
            debug!(message_id = id, "duplicate message dropped");
            return Ok(());
        }

        let res = next.run().await;
        if res.is_err() {
            self.forget(id);
        }
        res
    }
}

/// 错误边界：记录下游错误；`suppress` 为 true 时吞掉错误（消息将被确认）
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrors {
    suppress: bool,
}

impl LogErrors {
    /// 只记录，继续向上传播
    pub fn propagate() -> Self {
        Self { suppress: false }
    }

    pub fn suppress() -> Self {
        Self { suppress: true }
    }
}

#[async_trait]
impl Middleware for LogErrors {
    fn name(&self) -> &'static str {
        "log_errors"
    }

    async fn handle(&self, msg: &InboundMessage, next: Next<'_>) -> anyhow::Result<()> {
        let ctx = msg.context();
        match next.run().await {
            Ok(()) => Ok(()),
            Err(err) if self.suppress => {
                error!(
                    queue = ctx.queue(),
                    routing_key = ctx.routing_key(),
                    event_type = ctx.event_type(),
                    delivery_tag = ctx.delivery_tag(),
                    error = %format!("{err:#}"),
                    "handler failed, error suppressed"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    queue = ctx.queue(),
                    routing_key = ctx.routing_key(),
                    event_type = ctx.event_type(),
                    delivery_tag = ctx.delivery_tag(),
                    error = %format!("{err:#}"),
                    "handler failed"
                );
                Err(err)
            }
        }
    }
}

/// 限制下游（后续阶段 + 处理器）的执行时长
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    limit: Duration,
}

impl Timeout {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }
}

#[async_trait]
impl Middleware for Timeout {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn handle(&self, msg: &InboundMessage, next: Next<'_>) -> anyhow::Result<()> {
        match tokio::time::timeout(self.limit, next.run()).await {
            Ok(res) => res,
            Err(_) => {
                warn!(
                    message_id = msg.context().message_id(),
                    limit = ?self.limit,
                    "downstream timed out"
                );
                anyhow::bail!("timed out after {:?}", self.limit)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::handler::MessageContext;
    use crate::pipeline::{Endpoint, Pipeline, PipelineOutcome};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Endpoint for Counting {
        async fn call(&self, _msg: &InboundMessage) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    fn message(id: &str, value: u32) -> InboundMessage {
        InboundMessage::new(MessageContext::for_test(id, false), value)
    }

    #[tokio::test]
    async fn filter_short_circuits_rejected_messages() {
        let pipeline = Pipeline::new().with(Filter::new("even_only", |m| {
            m.downcast_ref::<u32>().is_some_and(|v| v % 2 == 0)
        }));
        let endpoint = Counting::default();

        assert_eq!(
            pipeline.run(&message("a", 1), &endpoint).await.unwrap(),
            PipelineOutcome::ShortCircuited { stage: "even_only" }
        );
        assert_eq!(
            pipeline.run(&message("b", 2), &endpoint).await.unwrap(),
            PipelineOutcome::Completed
        );
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deduplicate_drops_repeats_within_window() {
        let dedup = Arc::new(Deduplicate::new(Duration::from_secs(60)));
        let pipeline = Pipeline::new().with_shared(dedup.clone());
        let endpoint = Counting::default();

        pipeline.run(&message("same", 1), &endpoint).await.unwrap();
        let second = pipeline.run(&message("same", 1), &endpoint).await.unwrap();
        pipeline.run(&message("other", 1), &endpoint).await.unwrap();

        assert_eq!(second, PipelineOutcome::ShortCircuited { stage: "deduplicate" });
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
        assert_eq!(dedup.len(), 2);
    }

    #[tokio::test]
    async fn deduplicate_forgets_failed_messages() {
        let dedup = Arc::new(Deduplicate::new(Duration::from_secs(60)));
        let pipeline = Pipeline::new().with_shared(dedup.clone());
        let endpoint = Counting {
            fail: true,
            ..Default::default()
        };

        assert!(pipeline.run(&message("m", 1), &endpoint).await.is_err());
        assert!(pipeline.run(&message("m", 1), &endpoint).await.is_err());
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn deduplicate_expires_entries() {
        let dedup = Deduplicate::with_cleanup_interval(Duration::from_millis(10), 1);
        assert!(dedup.check("x"));
        assert!(!dedup.check("x"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dedup.check("x"));
    }

    #[tokio::test]
    async fn log_errors_suppress_turns_failure_into_success() {
        let endpoint = Counting {
            fail: true,
            ..Default::default()
        };

        let suppressed = Pipeline::new().with(LogErrors::suppress());
        assert_eq!(
            suppressed.run(&message("m", 1), &endpoint).await.unwrap(),
            PipelineOutcome::Completed
        );

        let propagated = Pipeline::new().with(LogErrors::propagate());
        assert!(matches!(
            propagated.run(&message("m", 1), &endpoint).await,
            Err(DispatchError::Handler(_))
        ));
    }

    #[tokio::test]
    async fn timeout_fails_slow_downstream() {
        let pipeline = Pipeline::new().with(Timeout::new(Duration::from_millis(20)));
        let endpoint = Counting {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        };

        let err = pipeline.run(&message("m", 1), &endpoint).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
