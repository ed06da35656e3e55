//! 否决事件（VetoEvent）
//!
//! 可否决 handler 否决某条消息后由派发引擎发布。它包装原消息，像普通消息一样投递，
//! 但自身永远不会被否决。
//!
use crate::message::{Message, MessageType};
use std::any::Any;

#[derive(Clone, Debug)]
pub struct VetoEvent {
    vetoed: Message,
}

impl VetoEvent {
    pub fn new(vetoed: Message) -> Self {
        Self { vetoed }
    }

    /// 被抑制了普通投递的原消息
    pub fn message(&self) -> &Message {
        &self.vetoed
    }

    pub fn message_type(&self) -> MessageType {
        self.vetoed.message_type()
    }

    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        self.vetoed.downcast_ref::<M>()
    }

    pub fn into_message(self) -> Message {
        self.vetoed
    }
}
