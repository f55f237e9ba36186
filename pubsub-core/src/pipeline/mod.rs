//! 接收管道（Pipeline）
//!
//! 解码后、处理器之前的有序中间件链（洋葱模型）：
//! - 阶段按注册顺序执行，所有订阅共享同一条链；
//! - 每个阶段拿到消息与续延 `Next`，调用 `next.run()` 0 次或 1 次；
//!   0 次即短路（消息视为已消费，处理器不执行）；
//! - 第二次调用立即返回错误，并在链状态中记录违规，
//!   即使阶段吞掉该错误，本次投递仍以 `InvalidPipelineUsage` 失败；
//! - 实现为阶段切片 + 索引游标，而非嵌套闭包。
//!
mod stages;

pub use stages::{Deduplicate, Filter, LogErrors, Timeout};

use crate::error::DispatchError;
use crate::handler::MessageContext;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// 已解码的入站消息：上下文 + 类型擦除后的事件值
pub struct InboundMessage {
    context: MessageContext,
    event: Box<dyn Any + Send + Sync>,
}

impl InboundMessage {
    pub fn new<E: Any + Send + Sync>(context: MessageContext, event: E) -> Self {
        Self {
            context,
            event: Box::new(event),
        }
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    /// 按具体事件类型读取消息体
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.event.downcast_ref::<E>()
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// 管道阶段
#[async_trait]
pub trait Middleware: Send + Sync {
    /// 阶段名（日志与违规报告使用）
    fn name(&self) -> &'static str;

    async fn handle(&self, msg: &InboundMessage, next: Next<'_>) -> anyhow::Result<()>;
}

/// 链的终点（通常是处理器调用）
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, msg: &InboundMessage) -> anyhow::Result<()>;
}

/// 单次执行的链状态
struct Chain<'a> {
    stages: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
    // 已进入的最深位置；等于 stages.len() 表示到达终点
    deepest: AtomicUsize,
    violation: OnceLock<&'static str>,
}

impl<'a> Chain<'a> {
    fn dispatch(&'a self, index: usize, msg: &'a InboundMessage) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.deepest.fetch_max(index, Ordering::SeqCst);
            match self.stages.get(index) {
                Some(stage) => {
                    let next = Next {
                        chain: self,
                        msg,
                        index: index + 1,
                        caller: stage.name(),
                        invoked: AtomicBool::new(false),
                    };
                    stage.handle(msg, next).await
                }
                None => self.endpoint.call(msg).await,
            }
        })
    }
}

/// 续延：驱动链中的下一个阶段（或终点）
pub struct Next<'a> {
    chain: &'a Chain<'a>,
    msg: &'a InboundMessage,
    index: usize,
    caller: &'static str,
    invoked: AtomicBool,
}

impl Next<'_> {
    pub async fn run(&self) -> anyhow::Result<()> {
        if self.invoked.swap(true, Ordering::SeqCst) {
            let _ = self.chain.violation.set(self.caller);
            return Err(DispatchError::InvalidPipelineUsage { stage: self.caller }.into());
        }
        self.chain.dispatch(self.index, self.msg).await
    }
}

/// 管道执行结果（不含错误）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// 终点已被调用
    Completed,
    /// 某阶段未调用 `next`
    ShortCircuited { stage: &'static str },
}

/// 阶段列表；构建后顺序固定，克隆开销为一次 Arc 复制
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn Middleware>]>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个阶段，返回新管道
    pub fn with<M: Middleware + 'static>(self, stage: M) -> Self {
        self.with_shared(Arc::new(stage))
    }

    pub fn with_shared(self, stage: Arc<dyn Middleware>) -> Self {
        let mut stages: Vec<_> = self.stages.iter().cloned().collect();
        stages.push(stage);
        Self {
            stages: stages.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// 注册顺序的阶段名
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// 执行整条链
    ///
    /// 链内违规优先于阶段的返回值；以 `DispatchError` 抛出的错误保持原类型，
    /// 其余错误归为 `DispatchError::Handler`。
    pub async fn run(
        &self,
        msg: &InboundMessage,
        endpoint: &dyn Endpoint,
    ) -> Result<PipelineOutcome, DispatchError> {
        let chain = Chain {
            stages: &self.stages,
            endpoint,
            deepest: AtomicUsize::new(0),
            violation: OnceLock::new(),
        };

        let result = chain.dispatch(0, msg).await;

        if let Some(&stage) = chain.violation.get() {
            return Err(DispatchError::InvalidPipelineUsage { stage });
        }

        match result {
            Ok(()) => {
                let deepest = chain.deepest.load(Ordering::SeqCst);
                match self.stages.get(deepest) {
                    Some(stage) => Ok(PipelineOutcome::ShortCircuited {
                        stage: stage.name(),
                    }),
                    None => Ok(PipelineOutcome::Completed),
                }
            }
            Err(err) => Err(match err.downcast::<DispatchError>() {
                Ok(dispatch) => dispatch,
                Err(err) => DispatchError::Handler(err),
            }),
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}
