//! vetobus 过程宏
//!
//! `#[subscriber]` 将固有 impl 块中的 `#[handler]` 方法转换为 `vetobus::Subscriber` 能力表。
//!
use proc_macro::TokenStream;

mod handler_attr;
mod subscriber;

/// Subscriber 宏
/// - 作用于固有 `impl` 块
/// - 每个标注 `#[handler]`（普通）或 `#[handler(veto)]`（可否决）的方法生成一个 `HandlerBinding`，标注会被移除
/// - handler 方法接收 `&self` 与一个消息参数（`&T`，或按值的 `T: Clone`）；
///   参数个数不符的方法仍生成绑定，由 `EventBus::subscribe` 以 `InvalidHandlerSignature` 拒绝
/// - 返回类型：`()` 或 `Result<(), E>`，其中 `E: Into<HandlerError>`
#[proc_macro_attribute]
pub fn subscriber(attr: TokenStream, item: TokenStream) -> TokenStream {
    subscriber::expand(attr, item)
}
