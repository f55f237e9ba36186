//! 事件（Event）
//!
//! 应用层事件需要实现的最小接口：稳定的事件类型名与继承谱系（lineage）。
//! 总线以某个基础事件类型 `B` 实例化，发布的事件必须是 `B` 本身或其“子类型”，
//! 即 `B::EVENT_TYPE` 出现在事件自身的谱系中。
//!
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// 事件载荷需要满足的通用能力边界
pub trait Event: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 事件类型名（跨进程稳定，用于路由头与日志）
    const EVENT_TYPE: &'static str;

    /// 祖先事件类型名，自近及远；根事件返回空列表
    fn lineage() -> Vec<&'static str> {
        Vec::new()
    }

    /// 是否为 `B` 本身或其子类型
    fn is_subtype_of<B: Event>() -> bool {
        Self::EVENT_TYPE == B::EVENT_TYPE || Self::lineage().contains(&B::EVENT_TYPE)
    }
}
