use std::future::Future;
use std::pin::Pin;

/// 对象安全的 `Send` Future 包装。
///
/// # 契约说明（What）
/// - 约束 Future 为 `Send + 'a`，中间件与传输层都以它作为异步返回类型，可安全跨线程调度。
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
