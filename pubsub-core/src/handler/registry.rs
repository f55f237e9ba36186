use crate::error::HandlerResolutionError;
use crate::event::Event;
use crate::handler::EventHandler;
use dashmap::DashMap;
use std::any::{Any, TypeId, type_name};
use std::sync::Arc;

/// 处理器工厂：每次投递调用一次，返回本次投递使用的处理器实例
pub type HandlerFactory<E> = Arc<dyn Fn() -> Arc<dyn EventHandler<E>> + Send + Sync>;

/// 声明式处理器条目：事件类型 + 处理器类型 + 类型擦除后的工厂
#[derive(Clone)]
pub struct HandlerDescriptor {
    event_id: TypeId,
    event_type: &'static str,
    handler_id: TypeId,
    handler_type: &'static str,
    // 实际类型为 HandlerFactory<E>
    factory: Arc<dyn Any + Send + Sync>,
}

impl HandlerDescriptor {
    /// 每次投递通过 `factory` 构造一个新实例
    pub fn new<E, H, F>(factory: F) -> Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let f: HandlerFactory<E> = Arc::new(move || Arc::new(factory()) as Arc<dyn EventHandler<E>>);
        Self::erase::<E, H>(f)
    }

    /// 所有投递共享同一个实例
    pub fn shared<E, H>(handler: Arc<H>) -> Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        let f: HandlerFactory<E> = Arc::new(move || handler.clone() as Arc<dyn EventHandler<E>>);
        Self::erase::<E, H>(f)
    }

    fn erase<E: Event, H: 'static>(factory: HandlerFactory<E>) -> Self {
        Self {
            event_id: TypeId::of::<E>(),
            event_type: E::EVENT_TYPE,
            handler_id: TypeId::of::<H>(),
            handler_type: type_name::<H>(),
            factory: Arc::new(factory),
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.event_type
    }

    pub fn handler_type(&self) -> &'static str {
        self.handler_type
    }
}

/// 启动期由宿主组装的处理器清单
#[derive(Clone, Default)]
pub struct HandlerManifest {
    entries: Vec<HandlerDescriptor>,
}

impl HandlerManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler<E, H, F>(mut self, factory: F) -> Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.entries.push(HandlerDescriptor::new::<E, H, F>(factory));
        self
    }

    pub fn shared<E, H>(mut self, handler: Arc<H>) -> Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        self.entries.push(HandlerDescriptor::shared::<E, H>(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<HandlerDescriptor> for HandlerManifest {
    fn from_iter<I: IntoIterator<Item = HandlerDescriptor>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Extend<HandlerDescriptor> for HandlerManifest {
    fn extend<I: IntoIterator<Item = HandlerDescriptor>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

/// 处理器注册表
/// - 以事件类型的 TypeId 为键，O(1) 查找
/// - 启动后以读为主；允许手动追加或覆盖
/// - 同一事件类型出现多个处理器不会在注册时报错，而是在订阅时作为歧义拒绝
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    by_event: Arc<DashMap<TypeId, Vec<HandlerDescriptor>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 扫描声明的处理器集合，一次性构建注册表
    pub fn discover<I>(declared: I) -> Self
    where
        I: IntoIterator<Item = HandlerDescriptor>,
    {
        let registry = Self::new();
        for descriptor in declared {
            registry.insert(descriptor);
        }
        registry
    }

    pub fn from_manifest(manifest: HandlerManifest) -> Self {
        Self::discover(manifest.entries)
    }

    /// 追加一个映射
    pub fn register<E, H, F>(&self, factory: F)
    where
        E: Event,
        H: EventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.insert(HandlerDescriptor::new::<E, H, F>(factory));
    }

    /// 覆盖事件类型 `E` 的全部映射
    pub fn override_handler<E, H, F>(&self, factory: F)
    where
        E: Event,
        H: EventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.by_event.insert(
            TypeId::of::<E>(),
            vec![HandlerDescriptor::new::<E, H, F>(factory)],
        );
    }

    pub fn insert(&self, descriptor: HandlerDescriptor) {
        self.by_event
            .entry(descriptor.event_id)
            .or_default()
            .push(descriptor);
    }

    /// 解析事件 `E` 的唯一处理器，并校验其类型为 `H`
    pub fn resolve<E, H>(&self) -> Result<HandlerFactory<E>, HandlerResolutionError>
    where
        E: Event,
        H: 'static,
    {
        let Some(entry) = self.by_event.get(&TypeId::of::<E>()) else {
            return Err(HandlerResolutionError::NotRegistered {
                event_type: E::EVENT_TYPE,
            });
        };

        let descriptor = match entry.value().as_slice() {
            [] => {
                return Err(HandlerResolutionError::NotRegistered {
                    event_type: E::EVENT_TYPE,
                });
            }
            [only] => only,
            many => {
                return Err(HandlerResolutionError::Ambiguous {
                    event_type: E::EVENT_TYPE,
                    candidates: many.iter().map(|d| d.handler_type).collect(),
                });
            }
        };

        if descriptor.handler_id != TypeId::of::<H>() {
            return Err(HandlerResolutionError::Mismatch {
                event_type: E::EVENT_TYPE,
                expected: type_name::<H>(),
                found: descriptor.handler_type,
            });
        }

        // 正常情况下这里的 downcast 永远不会失败（键与工厂同一泛型 E）
        descriptor
            .factory
            .downcast_ref::<HandlerFactory<E>>()
            .cloned()
            .ok_or(HandlerResolutionError::Mismatch {
                event_type: E::EVENT_TYPE,
                expected: type_name::<HandlerFactory<E>>(),
                found: "unknown",
            })
    }

    /// 已注册的事件类型名列表（只读视图）
    pub fn registered_event_types(&self) -> Vec<&'static str> {
        self.by_event
            .iter()
            .filter_map(|e| e.value().first().map(|d| d.event_type))
            .collect()
    }
}
