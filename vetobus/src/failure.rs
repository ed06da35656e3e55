//! 失败接收器（FailureSink）
//!
//! `publish` 发出即返回，派发失败的消息没有调用方可以回传；
//! 引擎把每个 `DispatchError` 交给宿主应用注入的 `FailureSink`，
//! 随后丢弃该消息，队列继续运行。
//!
use crate::error::DispatchError;
use async_trait::async_trait;
use tracing::error;

#[async_trait]
pub trait FailureSink: Send + Sync {
    async fn report(&self, failure: DispatchError);
}

/// 默认实现：每条失败消息、每个 handler 失败各记录一条 `error` 事件
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingFailureSink;

#[async_trait]
impl FailureSink for TracingFailureSink {
    async fn report(&self, failure: DispatchError) {
        error!(
            message_type = %failure.message_type,
            phase = %failure.phase,
            failures = failure.failures.len(),
            "message dispatch aborted"
        );
        for f in &failure.failures {
            error!(handler = f.handler(), error = %f, "handler failure");
        }
    }
}
