//! 总线上的消息
//!
//! 总线只按运行时类型识别消息：`Message` 是类型擦除、可廉价克隆的信封；
//! `MessageType` 是与订阅逐条比较的匹配键（精确类型相等，不做子类型匹配）。
//!
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// 消息类型的运行时标识
#[derive(Clone, Copy)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    pub fn of<M: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageType {}

impl Hash for MessageType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// 类型擦除后的已发布值
#[derive(Clone)]
pub struct Message {
    message_type: MessageType,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Message {
    pub fn new<M: Any + Send + Sync>(payload: M) -> Self {
        Self {
            message_type: MessageType::of::<M>(),
            payload: Arc::new(payload),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn is<M: Any>(&self) -> bool {
        self.payload.is::<M>()
    }

    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        self.payload.downcast_ref::<M>()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.message_type)
            .finish_non_exhaustive()
    }
}
