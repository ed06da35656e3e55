//! Handler 绑定
//!
//! 订阅者类型提供静态能力表：每个 handler 方法对应一个 `HandlerBinding`，
//! 绑定消息类型、调用器与可否决标志。能力表通常由 `#[subscriber]` 生成，也可手写。
//!
use crate::error::{HandlerError, HandlerResult};
use crate::message::{Message, MessageType};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub(crate) type Invoker<S> = Arc<dyn Fn(&S, &Message) -> HandlerResult + Send + Sync>;

/// 实例可订阅到 `EventBus` 的类型
pub trait Subscriber: Sized + Send + Sync + 'static {
    /// 该类型的 handler 绑定（有序）
    fn handlers() -> Vec<HandlerBinding<Self>>;
}

/// 订阅者类型 `S` 的一个候选 handler
pub struct HandlerBinding<S> {
    name: &'static str,
    message_type: Option<MessageType>,
    arity: usize,
    veto_capable: bool,
    invoker: Option<Invoker<S>>,
}

impl<S: Send + Sync + 'static> HandlerBinding<S> {
    /// 精确类型 `M` 的普通 handler
    pub fn new<M, F, R>(name: &'static str, f: F) -> Self
    where
        M: Any + Send + Sync,
        F: Fn(&S, &M) -> R + Send + Sync + 'static,
        R: IntoHandlerResult,
    {
        let invoker: Invoker<S> = Arc::new(move |subscriber: &S, message: &Message| {
            match message.downcast_ref::<M>() {
                Some(m) => f(subscriber, m).into_handler_result(),
                // 注册表以同一 M 为键，正常路径不可达
                None => Err(HandlerError::failed(format_args!(
                    "type mismatch: expected={}, found={}",
                    std::any::type_name::<M>(),
                    message.message_type()
                ))),
            }
        });

        Self {
            name,
            message_type: Some(MessageType::of::<M>()),
            arity: 1,
            veto_capable: false,
            invoker: Some(invoker),
        }
    }

    /// 精确类型 `M` 的可否决 handler
    pub fn veto<M, F, R>(name: &'static str, f: F) -> Self
    where
        M: Any + Send + Sync,
        F: Fn(&S, &M) -> R + Send + Sync + 'static,
        R: IntoHandlerResult,
    {
        Self::new(name, f).veto_capable(true)
    }

    /// 消息参数个数不为 1 的 handler 方法
    ///
    /// 不会成为订阅；`subscribe` 会以 `InvalidHandlerSignature` 拒绝整个订阅者。
    pub fn with_arity(name: &'static str, arity: usize) -> Self {
        Self {
            name,
            message_type: None,
            arity,
            veto_capable: false,
            invoker: None,
        }
    }

    pub fn veto_capable(mut self, veto_capable: bool) -> Self {
        self.veto_capable = veto_capable;
        self
    }
}

impl<S> HandlerBinding<S> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.message_type
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn is_veto_capable(&self) -> bool {
        self.veto_capable
    }

    pub(crate) fn into_parts(self) -> Option<(MessageType, Invoker<S>)> {
        match (self.arity, self.message_type, self.invoker) {
            (1, Some(message_type), Some(invoker)) => Some((message_type, invoker)),
            _ => None,
        }
    }
}

impl<S> fmt::Debug for HandlerBinding<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("name", &self.name)
            .field("message_type", &self.message_type)
            .field("arity", &self.arity)
            .field("veto_capable", &self.veto_capable)
            .finish()
    }
}

/// handler 方法可接受的返回类型
pub trait IntoHandlerResult {
    fn into_handler_result(self) -> HandlerResult;
}

impl IntoHandlerResult for () {
    fn into_handler_result(self) -> HandlerResult {
        Ok(())
    }
}

impl<E: Into<HandlerError>> IntoHandlerResult for Result<(), E> {
    fn into_handler_result(self) -> HandlerResult {
        self.map_err(Into::into)
    }
}
