//! 发布队列
//!
//! 生产者与唯一派发任务之间的无界 FIFO，`publish` 从不等待投递。维护两个计数：
//! - `pending`：已接收、尚未出队（参考性积压量）；
//! - `outstanding`：已接收、尚未派发完成，供 `wait_idle` 使用。
//!
use crate::error::{BusError, BusResult};
use crate::message::Message;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub(crate) struct PublishQueue {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    pending: AtomicUsize,
    outstanding: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

impl PublishQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            pending: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    /// 生产者入口；队列关闭后拒绝
    pub(crate) fn publish(&self, message: Message) -> BusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::BusClosed);
        }
        self.enqueue(message)
    }

    /// 不检查关闭标志直接入队；供引擎投递 VetoEvent，关闭排空期间也需入队
    pub(crate) fn enqueue(&self, message: Message) -> BusResult<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(message).is_err() {
            // 接收端已释放：派发任务已退出
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.complete();
            return Err(BusError::BusClosed);
        }
        Ok(())
    }

    /// 将接收端交给派发任务，仅首次调用成功
    pub(crate) fn take_stream(&self) -> Option<UnboundedReceiverStream<Message>> {
        self.rx.lock().take().map(UnboundedReceiverStream::new)
    }

    pub(crate) fn mark_dequeued(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// 一条已接收消息离开系统（已派发、失败或被丢弃）
    pub(crate) fn complete(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn outstanding_count(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// 没有等待中或派发中的消息时返回
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_and_counters() {
        let queue = PublishQueue::new();
        queue.publish(Message::new(1_u32)).unwrap();
        queue.publish(Message::new(String::from("two"))).unwrap();
        queue.publish(Message::new(3_u32)).unwrap();
        assert_eq!(queue.pending_count(), 3);
        assert_eq!(queue.outstanding_count(), 3);

        let mut stream = queue.take_stream().expect("first take");
        assert!(queue.take_stream().is_none());

        let first = stream.next().await.unwrap();
        queue.mark_dequeued();
        assert_eq!(first.downcast_ref::<u32>(), Some(&1));
        let second = stream.next().await.unwrap();
        queue.mark_dequeued();
        assert_eq!(second.downcast_ref::<String>().map(String::as_str), Some("two"));
        let third = stream.next().await.unwrap();
        queue.mark_dequeued();
        assert_eq!(third.downcast_ref::<u32>(), Some(&3));

        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.outstanding_count(), 3);
    }

    #[tokio::test]
    async fn closed_queue_rejects_publish_but_accepts_internal_enqueue() {
        let queue = PublishQueue::new();
        queue.close();
        assert!(queue.is_closed());
        assert!(matches!(
            queue.publish(Message::new(1_u8)),
            Err(BusError::BusClosed)
        ));
        assert!(queue.enqueue(Message::new(2_u8)).is_ok());
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn enqueue_after_receiver_dropped_fails() {
        let queue = PublishQueue::new();
        drop(queue.take_stream());
        assert!(matches!(
            queue.enqueue(Message::new(1_u8)),
            Err(BusError::BusClosed)
        ));
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn wait_idle_resolves_after_completion() {
        let queue = std::sync::Arc::new(PublishQueue::new());
        queue.publish(Message::new(1_u8)).unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.mark_dequeued();
        queue.complete();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle should resolve")
            .unwrap();
    }
}
