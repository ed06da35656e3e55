//! 订阅者注册表
//!
//! 每个生效的 handler 绑定对应一条 `Subscription`。存储采用写时复制：
//! 读者获取当前记录列表的 `Arc` 快照并在无锁状态下遍历，写者构建新列表后整体替换。
//! 一次派发看到的是某一时刻的视图，并发的订阅/退订在之后的派发中生效。
//!
use crate::error::{BusError, BusResult, HandlerResult};
use crate::handler::{Invoker, Subscriber};
use crate::message::{Message, MessageType};
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

pub type SubscriptionId = Uuid;

type ErasedInvoker = Box<dyn Fn(&(dyn Any + Send + Sync), &Message) -> HandlerResult + Send + Sync>;

/// 订阅者实例的非拥有引用
///
/// 注册表不会延长订阅者的生命周期；所有者持有的最后一个 `Arc` 释放后解析为 `None`。
#[derive(Clone)]
pub struct WeakHandle {
    inner: Weak<dyn Any + Send + Sync>,
}

impl WeakHandle {
    pub fn new<S: Send + Sync + 'static>(owner: &Arc<S>) -> Self {
        let inner: Weak<S> = Arc::downgrade(owner);
        Self { inner }
    }

    pub fn resolve(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.upgrade()
    }

    pub fn is_stale(&self) -> bool {
        self.inner.strong_count() == 0
    }

    /// 与存活订阅者做指针同一性比较
    pub fn points_to<S: Send + Sync + 'static>(&self, owner: &Arc<S>) -> bool {
        std::ptr::addr_eq(self.inner.as_ptr(), Arc::as_ptr(owner))
    }
}

/// 单条消息投递给单个订阅的结果
#[derive(Debug)]
pub enum Delivery {
    Invoked(HandlerResult),
    OwnerGone,
}

/// 总线上生效的一个 handler 绑定，创建后不再修改
pub struct Subscription {
    id: SubscriptionId,
    message_type: MessageType,
    subscriber: &'static str,
    handler: &'static str,
    veto_capable: bool,
    owner: WeakHandle,
    invoke: ErasedInvoker,
}

impl Subscription {
    fn bind<S: Subscriber>(
        owner: &Arc<S>,
        handler: &'static str,
        message_type: MessageType,
        veto_capable: bool,
        invoker: Invoker<S>,
    ) -> Self {
        let invoke: ErasedInvoker = Box::new(
            move |owner: &(dyn Any + Send + Sync), message: &Message| match owner
                .downcast_ref::<S>()
            {
                Some(subscriber) => invoker(subscriber, message),
                None => Ok(()),
            },
        );

        Self {
            id: Uuid::new_v4(),
            message_type,
            subscriber: std::any::type_name::<S>(),
            handler,
            veto_capable,
            owner: WeakHandle::new(owner),
            invoke,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn subscriber_name(&self) -> &'static str {
        self.subscriber
    }

    pub fn handler_name(&self) -> &'static str {
        self.handler
    }

    pub fn is_veto_capable(&self) -> bool {
        self.veto_capable
    }

    pub fn owner(&self) -> &WeakHandle {
        &self.owner
    }

    /// 解析所有者并以 `message` 调用 handler
    pub fn deliver(&self, message: &Message) -> Delivery {
        match self.owner.resolve() {
            Some(owner) => Delivery::Invoked((self.invoke)(owner.as_ref(), message)),
            None => Delivery::OwnerGone,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("message_type", &self.message_type)
            .field("subscriber", &self.subscriber)
            .field("handler", &self.handler)
            .field("veto_capable", &self.veto_capable)
            .finish_non_exhaustive()
    }
}

type Records = Arc<Vec<Arc<Subscription>>>;

#[derive(Default)]
pub struct SubscriberRegistry {
    records: RwLock<Records>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 `owner` 的全部 handler 绑定
    ///
    /// 先校验全部绑定；出现 `InvalidHandlerSignature` 时不添加任何记录。返回新增记录数。
    pub fn subscribe<S: Subscriber>(&self, owner: &Arc<S>) -> BusResult<usize> {
        let mut created = Vec::new();
        for binding in S::handlers() {
            let name = binding.name();
            let arity = binding.arity();
            let veto_capable = binding.is_veto_capable();
            let Some((message_type, invoker)) = binding.into_parts() else {
                return Err(BusError::InvalidHandlerSignature {
                    subscriber: std::any::type_name::<S>(),
                    handler: name,
                    arity,
                });
            };
            created.push(Arc::new(Subscription::bind(
                owner,
                name,
                message_type,
                veto_capable,
                invoker,
            )));
        }

        let added = created.len();
        if added > 0 {
            let mut guard = self.records.write();
            let mut next = Vec::with_capacity(guard.len() + added);
            next.extend(guard.iter().cloned());
            next.extend(created);
            *guard = Arc::new(next);
        }

        debug!(subscriber = std::any::type_name::<S>(), added, "subscribed");
        Ok(added)
    }

    /// 移除 `owner` 的全部记录，以及所有者已释放的记录
    pub fn unsubscribe<S: Send + Sync + 'static>(&self, owner: &Arc<S>) -> usize {
        let removed = self.retain(|r| !(r.owner.is_stale() || r.owner.points_to(owner)));
        debug!(subscriber = std::any::type_name::<S>(), removed, "unsubscribed");
        removed
    }

    /// 移除指定记录；已不存在的 id 忽略
    pub fn prune(&self, ids: &[SubscriptionId]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let removed = self.retain(|r| !ids.contains(&r.id));
        if removed > 0 {
            debug!(removed, "pruned dead subscriptions");
        }
        removed
    }

    /// 基于快照，返回消息类型等于 `message_type` 的记录
    pub fn matching(&self, message_type: MessageType) -> Matching {
        Matching {
            snapshot: self.snapshot(),
            message_type,
        }
    }

    pub fn snapshot(&self) -> Records {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn retain(&self, keep: impl Fn(&Subscription) -> bool) -> usize {
        let mut guard = self.records.write();
        let next: Vec<Arc<Subscription>> = guard.iter().filter(|r| keep(r)).cloned().collect();
        let removed = guard.len() - next.len();
        if removed > 0 {
            *guard = Arc::new(next);
        }
        removed
    }
}

/// 匹配某一消息类型的记录视图（惰性、可重复遍历）
pub struct Matching {
    snapshot: Records,
    message_type: MessageType,
}

impl Matching {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Subscription>> + '_ {
        self.snapshot
            .iter()
            .filter(move |r| r.message_type == self.message_type)
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// 划分为（可否决，普通）两组
    pub fn partition(&self) -> (Vec<Arc<Subscription>>, Vec<Arc<Subscription>>) {
        self.iter().cloned().partition(|r| r.veto_capable)
    }
}
