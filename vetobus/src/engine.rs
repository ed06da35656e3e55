//! 派发引擎
//!
//! 单个常驻任务串行消费发布队列，每条消息走两阶段否决协议：
//! - 将匹配的订阅划分为可否决与普通两组；
//! - 否决阶段：在 blocking 线程池上并发执行全部可否决 handler（上限 `handler_concurrency`），并等待全部完成；
//! - 若有任一 handler 否决（且消息本身不是 `VetoEvent`），入队一个 `VetoEvent` 并跳过普通阶段；
//! - 否则执行普通阶段，同样的并发与屏障；
//! - 清理所有者已释放的订阅。
//!
//! handler 失败只中止该条消息的后续阶段；失败交给 `FailureSink`，循环继续。
//!
use crate::error::{DispatchError, HandlerError, HandlerFailure, Phase};
use crate::failure::FailureSink;
use crate::message::Message;
use crate::queue::PublishQueue;
use crate::registry::{Delivery, SubscriberRegistry, Subscription, SubscriptionId};
use crate::veto::VetoEvent;
use futures_util::{FutureExt, StreamExt, stream};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::{self, JoinError, JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

/// 派发配置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// 单个阶段内并发执行的 handler 数；1 表示严格串行
    pub handler_concurrency: usize,
    /// 关闭时派发队列中剩余的消息，而不是丢弃
    pub drain_on_shutdown: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handler_concurrency: 8,
            drain_on_shutdown: false,
        }
    }
}

/// 无 handler 失败时消息的派发结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    NoSubscribers,
    Delivered { invoked: usize },
    Vetoed,
}

#[derive(Default)]
struct PhaseReport {
    invoked: usize,
    vetoed: bool,
    dead: Vec<SubscriptionId>,
    failures: Vec<HandlerFailure>,
}

pub(crate) struct DispatchEngine {
    registry: Arc<SubscriberRegistry>,
    queue: Arc<PublishQueue>,
    failure_sink: Arc<dyn FailureSink>,
    config: DispatchConfig,
}

impl DispatchEngine {
    pub(crate) fn new(
        registry: Arc<SubscriberRegistry>,
        queue: Arc<PublishQueue>,
        failure_sink: Arc<dyn FailureSink>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            failure_sink,
            config,
        }
    }

    pub(crate) fn spawn(
        self: Arc<Self>,
        stream: UnboundedReceiverStream<Message>,
        token: CancellationToken,
    ) -> DispatchHandle {
        let queue = self.queue.clone();
        let task = tokio::spawn(self.run(stream, token.clone()));
        DispatchHandle {
            token,
            queue,
            task: Some(task),
        }
    }

    async fn run(
        self: Arc<Self>,
        mut stream: UnboundedReceiverStream<Message>,
        token: CancellationToken,
    ) {
        info!(
            handler_concurrency = self.concurrency(),
            "dispatch task started"
        );

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = stream.next() => match next {
                    Some(message) => self.process(message).await,
                    None => break,
                },
            }
        }

        let mut rx = stream.into_inner();
        if self.config.drain_on_shutdown {
            // 排空期间产生的 VetoEvent 仍会进入未关闭的通道
            while let Ok(message) = rx.try_recv() {
                self.process(message).await;
            }
        }

        rx.close();
        let mut abandoned = 0usize;
        while rx.try_recv().is_ok() {
            self.queue.mark_dequeued();
            self.queue.complete();
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!(abandoned, "dispatch task stopped with queued messages");
        }
        info!("dispatch task stopped");
    }

    async fn process(&self, message: Message) {
        self.queue.mark_dequeued();
        match self.dispatch(&message).await {
            Ok(outcome) => {
                trace!(message_type = %message.message_type(), ?outcome, "message dispatched");
            }
            Err(failure) => {
                let message_type = failure.message_type;
                let reported = AssertUnwindSafe(self.failure_sink.report(failure))
                    .catch_unwind()
                    .await;
                if let Err(payload) = reported {
                    error!(
                        %message_type,
                        reason = panic_message(payload.as_ref()),
                        "failure sink panicked"
                    );
                }
            }
        }
        self.queue.complete();
    }

    /// 对单条消息执行否决协议
    pub(crate) async fn dispatch(
        &self,
        message: &Message,
    ) -> Result<DispatchOutcome, DispatchError> {
        let (veto_list, regular_list) = self
            .registry
            .matching(message.message_type())
            .partition();
        if veto_list.is_empty() && regular_list.is_empty() {
            return Ok(DispatchOutcome::NoSubscribers);
        }

        let mut dead = Vec::new();
        let result = self
            .run_phases(message, veto_list, regular_list, &mut dead)
            .await;
        self.registry.prune(&dead);
        result
    }

    async fn run_phases(
        &self,
        message: &Message,
        veto_list: Vec<Arc<Subscription>>,
        regular_list: Vec<Arc<Subscription>>,
        dead: &mut Vec<SubscriptionId>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let veto = self.run_phase(Phase::Veto, veto_list, message).await;
        dead.extend(veto.dead);
        if !veto.failures.is_empty() {
            return Err(DispatchError {
                message_type: message.message_type(),
                phase: Phase::Veto,
                failures: veto.failures,
            });
        }

        let mut veto_called = veto.vetoed;
        if veto_called && message.is::<VetoEvent>() {
            trace!("veto raised while delivering a VetoEvent, ignored");
            veto_called = false;
        }

        if veto_called {
            let vetoed = Message::new(VetoEvent::new(message.clone()));
            if let Err(err) = self.queue.enqueue(vetoed) {
                warn!(message_type = %message.message_type(), error = %err, "VetoEvent dropped");
            }
            return Ok(DispatchOutcome::Vetoed);
        }

        let regular = self.run_phase(Phase::Regular, regular_list, message).await;
        dead.extend(regular.dead);
        if !regular.failures.is_empty() {
            return Err(DispatchError {
                message_type: message.message_type(),
                phase: Phase::Regular,
                failures: regular.failures,
            });
        }

        Ok(DispatchOutcome::Delivered {
            invoked: veto.invoked + regular.invoked,
        })
    }

    /// 以 `message` 调用 `records` 并等待全部调用结束
    async fn run_phase(
        &self,
        phase: Phase,
        records: Vec<Arc<Subscription>>,
        message: &Message,
    ) -> PhaseReport {
        let mut report = PhaseReport::default();
        if records.is_empty() {
            return report;
        }

        let results: Vec<(Arc<Subscription>, Result<Delivery, JoinError>)> = stream::iter(records)
            .map(|record| {
                let message = message.clone();
                async move {
                    let worker = record.clone();
                    let joined = task::spawn_blocking(move || worker.deliver(&message)).await;
                    (record, joined)
                }
            })
            .buffer_unordered(self.concurrency())
            .collect()
            .await;

        for (record, joined) in results {
            let subscriber = record.subscriber_name();
            let handler = record.handler_name();
            match joined {
                Ok(Delivery::OwnerGone) => report.dead.push(record.id()),
                Ok(Delivery::Invoked(Ok(()))) => report.invoked += 1,
                Ok(Delivery::Invoked(Err(HandlerError::Veto)))
                    if phase == Phase::Veto && record.is_veto_capable() =>
                {
                    report.invoked += 1;
                    report.vetoed = true;
                }
                Ok(Delivery::Invoked(Err(HandlerError::Veto))) => {
                    report
                        .failures
                        .push(HandlerFailure::UnexpectedVeto { subscriber, handler });
                }
                Ok(Delivery::Invoked(Err(HandlerError::Failed(source)))) => {
                    report.failures.push(HandlerFailure::Failed {
                        subscriber,
                        handler,
                        source,
                    });
                }
                Err(err) => {
                    report.failures.push(HandlerFailure::Panicked {
                        subscriber,
                        handler,
                        reason: panic_reason(err),
                    });
                }
            }
        }

        trace!(
            %phase,
            invoked = report.invoked,
            vetoed = report.vetoed,
            dead = report.dead.len(),
            failures = report.failures.len(),
            "phase finished"
        );
        report
    }

    fn concurrency(&self) -> usize {
        self.config.handler_concurrency.max(1)
    }
}

fn panic_reason(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    panic_message(err.into_panic().as_ref()).to_string()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// 派发任务句柄：关闭与等待
///
/// 句柄被 drop 时总线随之关闭。
#[must_use = "dropping the handle shuts the dispatch task down"]
pub struct DispatchHandle {
    token: CancellationToken,
    queue: Arc<PublishQueue>,
    task: Option<JoinHandle<()>>,
}

impl DispatchHandle {
    /// 停止接收发布并通知派发任务；正在派发的消息会先处理完
    pub fn shutdown(&self) {
        self.queue.close();
        self.token.cancel();
    }

    /// 等待派发任务退出（需先调用 `shutdown`）
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DispatchHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerResult;
    use crate::failure::TracingFailureSink;
    use crate::handler::{HandlerBinding, Subscriber};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        vetoes: AtomicUsize,
    }

    impl Subscriber for Recorder {
        fn handlers() -> Vec<HandlerBinding<Self>> {
            vec![
                HandlerBinding::new("record", |s: &Self, m: &String| {
                    s.seen.lock().unwrap().push(m.clone());
                }),
                HandlerBinding::veto("deny_secret", |_: &Self, m: &String| -> HandlerResult {
                    if m.starts_with("secret") {
                        Err(HandlerError::Veto)
                    } else {
                        Ok(())
                    }
                }),
                HandlerBinding::veto("deny_all_vetoes", |s: &Self, _: &VetoEvent| -> HandlerResult {
                    s.vetoes.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::Veto)
                }),
            ]
        }
    }

    fn engine() -> (Arc<SubscriberRegistry>, Arc<PublishQueue>, DispatchEngine) {
        let registry = Arc::new(SubscriberRegistry::new());
        let queue = Arc::new(PublishQueue::new());
        let engine = DispatchEngine::new(
            registry.clone(),
            queue.clone(),
            Arc::new(TracingFailureSink),
            DispatchConfig::default(),
        );
        (registry, queue, engine)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delivers_when_not_vetoed() {
        let (registry, queue, engine) = engine();
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(&recorder).unwrap();

        let outcome = engine.dispatch(&Message::new(String::from("hello"))).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Delivered { invoked: 2 });
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["hello".to_string()]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn veto_skips_regular_phase_and_enqueues_veto_event() {
        let (registry, queue, engine) = engine();
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(&recorder).unwrap();

        let outcome = engine.dispatch(&Message::new(String::from("secret plan"))).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Vetoed);
        assert!(recorder.seen.lock().unwrap().is_empty());
        assert_eq!(queue.pending_count(), 1);

        let mut stream = queue.take_stream().unwrap();
        let follow_up = stream.next().await.unwrap();
        let veto = follow_up.downcast_ref::<VetoEvent>().expect("VetoEvent");
        assert_eq!(veto.downcast_ref::<String>().map(String::as_str), Some("secret plan"));

        // 否决 VetoEvent 本身不生效
        let outcome = engine.dispatch(&follow_up).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Delivered { invoked: 1 });
        assert_eq!(recorder.vetoes.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn no_subscribers_is_not_an_error() {
        let (_registry, _queue, engine) = engine();
        let outcome = engine.dispatch(&Message::new(42_u64)).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NoSubscribers);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_owner_is_pruned() {
        let (registry, _queue, engine) = engine();
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(&recorder).unwrap();
        assert_eq!(registry.len(), 3);

        drop(recorder);
        let outcome = engine.dispatch(&Message::new(String::from("hello"))).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Delivered { invoked: 0 });
        // 本次只触及 String 的记录
        assert_eq!(registry.len(), 1);
    }

    struct Faulty;

    impl Subscriber for Faulty {
        fn handlers() -> Vec<HandlerBinding<Self>> {
            vec![
                HandlerBinding::new("fails", |_: &Self, _: &u32| -> HandlerResult {
                    Err(HandlerError::failed("boom"))
                }),
                HandlerBinding::new("panics", |_: &Self, _: &u32| -> HandlerResult {
                    panic!("handler exploded")
                }),
                HandlerBinding::new("vetoes", |_: &Self, _: &u32| -> HandlerResult {
                    Err(HandlerError::Veto)
                }),
            ]
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failures_are_collected_at_the_barrier() {
        let (registry, _queue, engine) = engine();
        let faulty = Arc::new(Faulty);
        registry.subscribe(&faulty).unwrap();

        let err = engine.dispatch(&Message::new(7_u32)).await.unwrap_err();
        assert_eq!(err.phase, Phase::Regular);
        assert_eq!(err.failures.len(), 3);

        let mut handlers: Vec<&str> = err.failures.iter().map(|f| f.handler()).collect();
        handlers.sort_unstable();
        assert_eq!(handlers, vec!["fails", "panics", "vetoes"]);
        assert!(err.failures.iter().any(|f| matches!(
            f,
            HandlerFailure::Panicked { reason, .. } if reason == "handler exploded"
        )));
        assert!(
            err.failures
                .iter()
                .any(|f| matches!(f, HandlerFailure::UnexpectedVeto { .. }))
        );
    }

    #[derive(Default)]
    struct Gatekeeper {
        passed: AtomicUsize,
    }

    impl Subscriber for Gatekeeper {
        fn handlers() -> Vec<HandlerBinding<Self>> {
            vec![
                HandlerBinding::veto("broken_gate", |_: &Self, _: &u8| -> HandlerResult {
                    Err(HandlerError::failed("gate offline"))
                }),
                HandlerBinding::new("after_gate", |s: &Self, _: &u8| {
                    s.passed.fetch_add(1, Ordering::SeqCst);
                }),
                HandlerBinding::veto("first_no", |_: &Self, _: &u16| -> HandlerResult {
                    Err(HandlerError::Veto)
                }),
                HandlerBinding::veto("second_no", |_: &Self, _: &u16| -> HandlerResult {
                    Err(HandlerError::Veto)
                }),
                HandlerBinding::new("after_no", |s: &Self, _: &u16| {
                    s.passed.fetch_add(1, Ordering::SeqCst);
                }),
            ]
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_veto_handler_aborts_in_veto_phase() {
        let (registry, queue, engine) = engine();
        let gate = Arc::new(Gatekeeper::default());
        registry.subscribe(&gate).unwrap();

        let err = engine.dispatch(&Message::new(1_u8)).await.unwrap_err();
        assert_eq!(err.phase, Phase::Veto);
        assert_eq!(err.failures.len(), 1);
        assert!(matches!(
            &err.failures[0],
            HandlerFailure::Failed { handler: "broken_gate", .. }
        ));
        // 普通阶段被跳过，且失败不等同于否决
        assert_eq!(gate.passed.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn several_vetoes_yield_one_veto_event() {
        let (registry, queue, engine) = engine();
        let gate = Arc::new(Gatekeeper::default());
        registry.subscribe(&gate).unwrap();

        let outcome = engine.dispatch(&Message::new(2_u16)).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Vetoed);
        assert_eq!(gate.passed.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_count(), 1);

        let mut stream = queue.take_stream().unwrap();
        let follow_up = stream.next().await.unwrap();
        let veto = follow_up.downcast_ref::<VetoEvent>().expect("VetoEvent");
        assert_eq!(veto.downcast_ref::<u16>(), Some(&2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dead_records_are_pruned_when_a_phase_fails() {
        let (registry, _queue, engine) = engine();
        let kept = Arc::new(Gatekeeper::default());
        let dropped = Arc::new(Gatekeeper::default());
        registry.subscribe(&kept).unwrap();
        registry.subscribe(&dropped).unwrap();
        assert_eq!(registry.len(), 10);

        drop(dropped);
        let err = engine.dispatch(&Message::new(3_u8)).await.unwrap_err();
        assert_eq!(err.phase, Phase::Veto);
        // 中止前只访问到已释放所有者的 u8 否决记录
        assert_eq!(registry.len(), 9);
    }

    #[test]
    fn config_defaults_and_partial_deserialization() {
        let cfg: DispatchConfig = serde_json::from_str(r#"{ "handler_concurrency": 1 }"#).unwrap();
        assert_eq!(cfg.handler_concurrency, 1);
        assert!(!cfg.drain_on_shutdown);
        assert_eq!(DispatchConfig::default().handler_concurrency, 8);
    }
}
