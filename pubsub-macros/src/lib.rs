use proc_macro::TokenStream;

mod event;
mod utils;

/// 事件宏：为结构体或枚举实现 `::pubsub_core::event::Event`
///
/// 支持键值形式：
/// - `#[event(event_type = "order.created")]` 指定事件类型名（默认使用类型名）
/// - `#[event(extends = BaseEvent)]` 声明父事件类型，谱系自动展开为父类型及其祖先
///
/// 同时补齐派生：`Debug, Clone, serde::Serialize, serde::Deserialize`（已存在的不会重复）。
#[proc_macro_attribute]
pub fn event(attr: TokenStream, item: TokenStream) -> TokenStream {
    event::expand(attr, item)
}
