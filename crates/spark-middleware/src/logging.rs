use std::borrow::Cow;
use std::time::Instant;

use spark_rpc_core::{BoxFuture, Context, Middleware, Next, Result};
use tracing::{debug, info, trace, warn};

/// 成功调用的日志级别。失败调用固定以 `WARN` 输出。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    #[default]
    Debug,
    Info,
}

/// 中间件配置，指导日志步骤如何输出记录。
///
/// # 教案式说明
/// - **意图（Why）**：不同链路对日志量的容忍度不同，配置把差异外部化，使中间件本身保持无状态。
/// - **契约（What）**：
///   - `label`：低基数字符串，写入每条日志的 `label` 字段，用于区分 Server 链与 Client 链；
///   - `level`：成功调用的输出级别。
/// - **风险提示（Trade-offs）**：高频链路若使用 `Info` 级别可能造成日志风暴，请结合订阅端过滤使用。
#[derive(Clone, Debug)]
pub struct LoggingMiddlewareConfig {
    pub label: Cow<'static, str>,
    pub level: LogLevel,
}

impl Default for LoggingMiddlewareConfig {
    fn default() -> Self {
        Self {
            label: Cow::Borrowed("rpc"),
            level: LogLevel::Debug,
        }
    }
}

/// 记录每次调用的方法、耗时与结果。
///
/// # 教案式说明
/// - **结构（How）**：在 `next` 前后各取一次时间，下游返回后按结果输出一条结构化日志；
/// - **契约（What）**：日志字段包含 `label`、`service`、`method`、`elapsed_ms`，失败时追加
///   `code` 与 `message`。
#[derive(Clone, Debug, Default)]
pub struct LoggingMiddleware {
    config: LoggingMiddlewareConfig,
}

impl LoggingMiddleware {
    pub fn new(config: LoggingMiddlewareConfig) -> Self {
        Self { config }
    }

    pub fn labeled(label: impl Into<Cow<'static, str>>) -> Self {
        Self::new(LoggingMiddlewareConfig {
            label: label.into(),
            ..LoggingMiddlewareConfig::default()
        })
    }
}

impl<R> Middleware<Context, R> for LoggingMiddleware
where
    R: Default + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        next: Next<'a, Context, R>,
    ) -> BoxFuture<'a, Result<R>> {
        Box::pin(async move {
            let started = Instant::now();
            let service = ctx.service().to_owned();
            let method = ctx.method().unwrap_or("-").to_owned();

            let result = next.run(ctx).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let label = self.config.label.as_ref();

            match &result {
                Ok(_) => match self.config.level {
                    LogLevel::Trace => {
                        trace!(label, %service, %method, elapsed_ms, "rpc call completed")
                    }
                    LogLevel::Debug => {
                        debug!(label, %service, %method, elapsed_ms, "rpc call completed")
                    }
                    LogLevel::Info => {
                        info!(label, %service, %method, elapsed_ms, "rpc call completed")
                    }
                },
                Err(err) => warn!(
                    label,
                    %service,
                    %method,
                    elapsed_ms,
                    code = err.code(),
                    message = %err.message(),
                    "rpc call failed"
                ),
            }
            result
        })
    }

    fn name(&self) -> &'static str {
        "spark.middleware.logging"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::executor::block_on;
    use spark_rpc_core::test_stubs::UnreachableTransport;
    use spark_rpc_core::{
        ContextTemplate, NoopTracer, OrderedSerializer, Packet, RpcError, SpanGuard, Storage,
        compose, middleware_fn,
    };
    use tracing_test::traced_test;

    use super::*;

    fn context(method: &str) -> Context {
        let template = Arc::new(ContextTemplate::new(
            "users",
            Arc::new(OrderedSerializer::new(Arc::new(Storage::new()))),
            Arc::new(UnreachableTransport),
            Arc::new(NoopTracer),
        ));
        Context::derive(
            template,
            Packet::default().with_header("method", method),
            SpanGuard::noop(),
        )
    }

    #[test]
    #[traced_test]
    fn success_and_failure_are_logged() {
        let logging: Arc<dyn Middleware<Context, ()>> =
            Arc::new(LoggingMiddleware::new(LoggingMiddlewareConfig {
                label: "server".into(),
                level: LogLevel::Info,
            }));

        let ok = compose([logging.clone()]);
        block_on(ok.call(&mut context("get"), None)).unwrap();
        assert!(logs_contain("rpc call completed"));
        assert!(logs_contain("method=get"));

        let failing = middleware_fn::<Context, (), _>(|_ctx, _next| {
            Box::pin(async move { Err(RpcError::NotFound("user 7".into())) })
        });
        let chain = compose([logging, failing]);
        let err = block_on(chain.call(&mut context("get"), None)).unwrap_err();

        assert_eq!(err, RpcError::NotFound("user 7".into()), "日志中间件不得改写错误");
        assert!(logs_contain("rpc call failed"));
        assert!(logs_contain("rpc.not_found"));
    }
}
