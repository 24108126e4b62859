//! 调用统计中间件。
//!
//! # 教案式说明
//! - **意图（Why）**：在不接入完整指标后端的前提下，为每个方法提供调用次数、失败次数与累计耗时，
//!   便于测试与运维脚本直接读取。
//! - **逻辑（How）**：[`CallMetrics`] 以 `DashMap` 按方法名分片保存计数，[`MetricsMiddleware`]
//!   在下游返回后写入一次；多个中间件实例可共享同一个注册表。
//! - **契约（What）**：统计键为 `<service>.<method>`，缺失 `method` 头部时记为 `<service>.-`。

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use spark_rpc_core::{BoxFuture, Context, Middleware, Next, Result};

/// 单个方法的累计统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MethodStats {
    pub calls: u64,
    pub failures: u64,
    pub total_latency: Duration,
}

impl MethodStats {
    /// 平均耗时；尚无调用时为零。
    pub fn mean_latency(&self) -> Duration {
        match u32::try_from(self.calls) {
            Ok(0) => Duration::ZERO,
            Ok(calls) => self.total_latency / calls,
            Err(_) => {
                let nanos = self.total_latency.as_nanos() / u128::from(self.calls);
                Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
            }
        }
    }
}

/// 按方法聚合的调用统计注册表。
#[derive(Debug, Default)]
pub struct CallMetrics {
    methods: DashMap<String, MethodStats>,
}

impl CallMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, key: &str, elapsed: Duration, failed: bool) {
        let mut stats = self.methods.entry(key.to_owned()).or_default();
        stats.calls += 1;
        stats.failures += u64::from(failed);
        stats.total_latency += elapsed;
    }

    pub fn get(&self, key: &str) -> Option<MethodStats> {
        self.methods.get(key).map(|entry| *entry.value())
    }

    /// 以键排序的快照。
    pub fn snapshot(&self) -> Vec<(String, MethodStats)> {
        let mut entries: Vec<_> = self
            .methods
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn reset(&self) {
        self.methods.clear();
    }
}

/// 把每次调用写入 [`CallMetrics`] 的中间件。
#[derive(Clone, Debug, Default)]
pub struct MetricsMiddleware {
    registry: Arc<CallMetrics>,
}

impl MetricsMiddleware {
    pub fn new(registry: Arc<CallMetrics>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<CallMetrics> {
        &self.registry
    }
}

impl<R> Middleware<Context, R> for MetricsMiddleware
where
    R: Default + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        next: Next<'a, Context, R>,
    ) -> BoxFuture<'a, Result<R>> {
        Box::pin(async move {
            let key = format!("{}.{}", ctx.service(), ctx.method().unwrap_or("-"));
            let started = Instant::now();
            let result = next.run(ctx).await;
            self.registry
                .observe(&key, started.elapsed(), result.is_err());
            result
        })
    }

    fn name(&self) -> &'static str {
        "spark.middleware.metrics"
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use spark_rpc_core::test_stubs::UnreachableTransport;
    use spark_rpc_core::{
        ContextTemplate, NoopTracer, OrderedSerializer, Packet, RpcError, SpanGuard, Storage,
        compose, middleware_fn,
    };

    use super::*;

    fn context(method: Option<&str>) -> Context {
        let template = Arc::new(ContextTemplate::new(
            "orders",
            Arc::new(OrderedSerializer::new(Arc::new(Storage::new()))),
            Arc::new(UnreachableTransport),
            Arc::new(NoopTracer),
        ));
        let packet = match method {
            Some(method) => Packet::default().with_header("method", method),
            None => Packet::default(),
        };
        Context::derive(template, packet, SpanGuard::noop())
    }

    #[test]
    fn counts_calls_and_failures_per_method() {
        let registry = Arc::new(CallMetrics::new());
        let metrics: Arc<dyn Middleware<Context, ()>> =
            Arc::new(MetricsMiddleware::new(registry.clone()));
        let reject_cancel = middleware_fn::<Context, (), _>(|ctx, next| {
            Box::pin(async move {
                if ctx.method() == Some("cancel") {
                    return Err(RpcError::Forbidden("cancel".into()));
                }
                next.run(ctx).await
            })
        });
        let chain = compose([metrics, reject_cancel]);

        for method in ["create", "create", "cancel"] {
            let _ = block_on(chain.call(&mut context(Some(method)), None));
        }
        block_on(chain.call(&mut context(None), None)).unwrap();

        let create = registry.get("orders.create").expect("应有 create 统计");
        assert_eq!((create.calls, create.failures), (2, 0));
        let cancel = registry.get("orders.cancel").expect("应有 cancel 统计");
        assert_eq!((cancel.calls, cancel.failures), (1, 1), "失败调用也要计数");

        let keys: Vec<_> = registry.snapshot().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["orders.-", "orders.cancel", "orders.create"]);

        registry.reset();
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn mean_latency_handles_empty_stats() {
        assert_eq!(MethodStats::default().mean_latency(), Duration::ZERO);
        let stats = MethodStats {
            calls: 4,
            failures: 0,
            total_latency: Duration::from_millis(40),
        };
        assert_eq!(stats.mean_latency(), Duration::from_millis(10));
    }

    #[test]
    fn mean_latency_beyond_u32_calls() {
        let stats = MethodStats {
            calls: 1 << 32,
            failures: 0,
            total_latency: Duration::from_secs(1 << 33),
        };
        assert_eq!(stats.mean_latency(), Duration::from_secs(2));

        let saturated = MethodStats {
            calls: u64::MAX,
            failures: 0,
            total_latency: Duration::MAX,
        };
        assert!(saturated.mean_latency() <= Duration::from_secs(1), "均值不应溢出");
    }
}
