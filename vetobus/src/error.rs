//! 错误类型
//!
//! 分两类：
//! - `BusError`：同步返回给总线门面调用方的错误；
//! - `HandlerError` / `HandlerFailure` / `DispatchError`：handler 的返回值，
//!   以及派发引擎对投递失败消息的报告。
//!
use crate::message::MessageType;
use std::fmt;
use thiserror::Error;

/// 调用方可见的总线错误
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid handler signature: {subscriber}::{handler} takes {arity} parameters, not 1")]
    InvalidHandlerSignature {
        subscriber: &'static str,
        handler: &'static str,
        arity: usize,
    },
    #[error("event bus is closed")]
    BusClosed,
    #[error("dispatch task already started")]
    AlreadyStarted,
}

pub type BusResult<T> = Result<T, BusError>;

/// handler 返回给引擎的结果
///
/// `Veto` 是控制信号，只有可否决 handler 在否决阶段返回时才有意义；其余均视为失败。
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("message vetoed")]
    Veto,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(reason: impl fmt::Display) -> Self {
        HandlerError::Failed(anyhow::anyhow!("{reason}"))
    }

    pub fn is_veto(&self) -> bool {
        matches!(self, HandlerError::Veto)
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// 单次失败的 handler 调用
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum HandlerFailure {
    #[error("handler {subscriber}::{handler} failed: {source}")]
    Failed {
        subscriber: &'static str,
        handler: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("handler {subscriber}::{handler} panicked: {reason}")]
    Panicked {
        subscriber: &'static str,
        handler: &'static str,
        reason: String,
    },
    #[error("handler {subscriber}::{handler} signaled a veto but is not veto-capable")]
    UnexpectedVeto {
        subscriber: &'static str,
        handler: &'static str,
    },
}

impl HandlerFailure {
    pub fn handler(&self) -> &'static str {
        match self {
            HandlerFailure::Failed { handler, .. }
            | HandlerFailure::Panicked { handler, .. }
            | HandlerFailure::UnexpectedVeto { handler, .. } => handler,
        }
    }
}

/// 观察到失败的派发阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Veto,
    Regular,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Veto => f.write_str("veto"),
            Phase::Regular => f.write_str("regular"),
        }
    }
}

/// 单条消息派发的致命结果
///
/// 仅放弃该消息，队列继续运行。
#[derive(Debug, Error)]
#[error(
    "dispatch of {message_type} aborted in {phase} phase ({} handler failure(s))",
    .failures.len()
)]
pub struct DispatchError {
    pub message_type: MessageType,
    pub phase: Phase,
    pub failures: Vec<HandlerFailure>,
}
