//! 发布/订阅投递核心（pubsub-core）
//!
//! 与具体 broker 解耦的发布/订阅抽象：应用发布强类型事件并注册强类型处理器，
//! 本 crate 负责消息投递、瞬时故障重试与处理器前的中间件管道：
//! - 事件与编解码（`event`、`codec`）
//! - 传输协议与内存实现（`transport`）
//! - 有界重试（`retry`）
//! - 接收管道与内置阶段（`pipeline`）
//! - 处理器与注册表（`handler`）
//! - 失败路由（`failure`）
//! - 事件总线门面（`bus`）
//!
//! 交付语义为至少一次（at-least-once）；发布重试仅在内存中进行，次数有界。
//!
//! 典型用法：
//! 1. 以 `#[event(...)]` 定义基础事件及其子类型；
//! 2. 实现 `EventHandler<E>`，并通过 `HandlerManifest` 在启动期声明；
//! 3. 选择一个 `Transport` 实现，使用 `EventBus::builder()` 组装总线；
//! 4. `subscribe::<E, H>(queue, routing_key)` 开始消费，`publish` 发布事件。
//!
pub mod bus;
pub mod codec;
pub mod error;
pub mod event;
pub mod failure;
pub mod handler;
pub mod pipeline;
pub mod retry;
pub mod transport;

pub use bus::{BusOptions, EventBus, SubscriptionHandle};
pub use error::{
    CodecError, DispatchError, HandlerResolutionError, PublishError, PublishResult, RetryError,
    SubscribeError, TransportError,
};
pub use event::Event;
pub use handler::{EventHandler, HandlerManifest, HandlerRegistry, MessageContext};

// 允许在本 crate 内部通过 ::pubsub_core 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::pubsub_core 路径。
extern crate self as pubsub_core;
