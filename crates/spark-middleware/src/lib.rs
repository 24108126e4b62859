//! spark-middleware: 面向 RPC 链路的可复用中间件组件库。
//!
//! # 教案式概览
//! - **意图（Why）**：为应用团队提供现成的日志与调用统计步骤，避免在每个服务重复编写样板代码。
//! - **结构（How）**：按关注点拆分为 [`logging`] 与 [`metrics`] 两个模块，均实现
//!   [`spark_rpc_core::Middleware`]，且对结果类型泛型，因此既可挂在 Server 的全局/方法链上，
//!   也可作为 Client 拦截器使用。
//! - **契约（What）**：中间件只观察、不改写：下游的结果与错误原样返回给上游。

pub mod logging;
pub mod metrics;

pub use logging::{LogLevel, LoggingMiddleware, LoggingMiddlewareConfig};
pub use metrics::{CallMetrics, MethodStats, MetricsMiddleware};
