//! EventBus 门面
//!
//! 协作方通过它订阅、退订与发布。克隆开销很小，所有克隆共享同一注册表与队列。
//! 没有进程级全局实例：自行构建并传递。
//!
use crate::engine::{DispatchConfig, DispatchEngine, DispatchHandle};
use crate::error::{BusError, BusResult};
use crate::failure::{FailureSink, TracingFailureSink};
use crate::handler::Subscriber;
use crate::message::Message;
use crate::queue::PublishQueue;
use crate::registry::SubscriberRegistry;
use bon::bon;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    registry: Arc<SubscriberRegistry>,
    queue: Arc<PublishQueue>,
    engine: Arc<DispatchEngine>,
    token: CancellationToken,
}

#[bon]
impl EventBus {
    #[builder]
    pub fn new(
        #[builder(default)] config: DispatchConfig,
        failure_sink: Option<Arc<dyn FailureSink>>,
    ) -> Self {
        let registry = Arc::new(SubscriberRegistry::new());
        let queue = Arc::new(PublishQueue::new());
        let failure_sink = failure_sink.unwrap_or_else(|| Arc::new(TracingFailureSink));
        let engine = Arc::new(DispatchEngine::new(
            registry.clone(),
            queue.clone(),
            failure_sink,
            config,
        ));

        Self {
            inner: Arc::new(BusInner {
                registry,
                queue,
                engine,
                token: CancellationToken::new(),
            }),
        }
    }
}

impl EventBus {
    /// 在当前 tokio 运行时上启动派发任务
    ///
    /// `start` 之前发布的消息会保留，启动后派发。每个总线只能启动一次。
    ///
    /// # Panics
    /// 不在 tokio 运行时内调用时。
    pub fn start(&self) -> BusResult<DispatchHandle> {
        let stream = self
            .inner
            .queue
            .take_stream()
            .ok_or(BusError::AlreadyStarted)?;
        Ok(self
            .inner
            .engine
            .clone()
            .spawn(stream, self.inner.token.clone()))
    }

    /// 注册 `subscriber` 的全部 handler。总线只持有弱引用，最后一个 `Arc` 释放即结束订阅
    pub fn subscribe<S: Subscriber>(&self, subscriber: &Arc<S>) -> BusResult<usize> {
        self.inner.registry.subscribe(subscriber)
    }

    pub fn unsubscribe<S: Send + Sync + 'static>(&self, subscriber: &Arc<S>) -> usize {
        self.inner.registry.unsubscribe(subscriber)
    }

    /// 将 `message` 入队，异步投递
    pub fn publish<M: Any + Send + Sync>(&self, message: M) -> BusResult<()> {
        self.inner.queue.publish(Message::new(message))
    }

    /// 入队已类型擦除的消息（例如从 `VetoEvent` 中取出的原消息）
    pub fn publish_message(&self, message: Message) -> BusResult<()> {
        self.inner.queue.publish(message)
    }

    /// 已接收但尚未被派发任务取出的消息数
    pub fn pending_count(&self) -> usize {
        self.inner.queue.pending_count()
    }

    pub fn has_pending_messages(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// 等待所有已接收消息派发完毕（或因关闭被丢弃）；未启动的总线上有待处理消息时不会返回
    pub async fn wait_idle(&self) {
        self.inner.queue.wait_idle().await
    }

    /// 停止接收发布并通知派发任务
    pub fn shutdown(&self) {
        self.inner.queue.close();
        self.inner.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.queue.is_closed()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscription_count())
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
