//! 进程内发布/订阅派发器（vetobus）
//!
//! 组件按消息类型登记关注，总线负责投递，生产者与消费者互不耦合：
//! - `registry`：写时复制的订阅集合，对订阅者只持有弱引用；
//! - `queue`：`publish` 与派发任务之间的无界 FIFO；
//! - `engine`：串行消费者，执行两阶段否决协议，阶段内有界并发；
//! - `veto`：`VetoEvent`，可否决 handler 否决后发布；
//! - `handler`：`Subscriber` 能力表（见 `#[subscriber]`）；
//! - `bus`：`EventBus` 门面。
//!
//! 典型用法：
//! 1. 用 `#[subscriber]` / `#[handler]` 描述订阅者的 handler；
//! 2. 构建 `EventBus`，在 tokio 运行时内 `start`；
//! 3. 以 `Arc` 形式 `subscribe` 订阅者并 `publish` 消息；
//! 4. 对返回的 `DispatchHandle` 调用 `shutdown` 与 `join`。
//!
pub mod bus;
pub mod engine;
pub mod error;
pub mod failure;
pub mod handler;
pub mod message;
mod queue;
pub mod registry;
pub mod veto;

pub use bus::EventBus;
pub use engine::{DispatchConfig, DispatchHandle, DispatchOutcome};
pub use error::{
    BusError, BusResult, DispatchError, HandlerError, HandlerFailure, HandlerResult, Phase,
};
pub use failure::{FailureSink, TracingFailureSink};
pub use handler::{HandlerBinding, IntoHandlerResult, Subscriber};
pub use message::{Message, MessageType};
pub use veto::VetoEvent;

#[cfg(feature = "macros")]
pub use vetobus_macros::subscriber;

// 使 `#[subscriber]` 展开后的 `::vetobus` 路径在本 crate 的测试中可解析
extern crate self as vetobus;
