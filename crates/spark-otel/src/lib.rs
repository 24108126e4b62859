//! spark-otel: 把 `spark-rpc-core` 的追踪契约接入 OpenTelemetry。
//!
//! # 教案式概览
//! - **意图（Why）**：Server/Client 只依赖 [`spark_rpc_core::Tracer`]，生产环境通过本 crate 一次性接入
//!   OpenTelemetry 导出与 `tracing` 日志桥接。
//! - **结构（How）**：[`OtelTracer`] 实现追踪契约；[`install`] 组装全局 Subscriber 并返回可注入的 Tracer。
//! - **契约（What）**：`install` 只能成功一次；重复调用返回 [`Error::AlreadyInstalled`]。

use std::{
    borrow::Cow,
    sync::{Arc, OnceLock},
};

use opentelemetry::{global, trace::TracerProvider as _};
use opentelemetry_sdk::{
    Resource,
    trace::{self, TracerProvider},
};
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

mod bridge;

pub use bridge::OtelTracer;

#[cfg(feature = "test-util")]
use opentelemetry_sdk::export::trace::SpanData;
#[cfg(feature = "test-util")]
pub use test_support::InMemorySpanExporter;

/// 安装状态的全局缓存，确保 `install` 仅执行一次。
static INSTALL_STATE: OnceLock<InstallState> = OnceLock::new();

/// spark-otel 安装过程可能出现的错误类型。
///
/// # 教案式说明
/// - **意图（Why）**：归纳安装阶段的全部失败路径，便于调用方在启动流程中统一处理。
/// - **契约（What）**：所有错误都实现 [`std::error::Error`]。
#[derive(Debug)]
pub enum Error {
    /// `spark_otel::install` 被重复调用。
    AlreadyInstalled,
    /// 外部提前设置了全局 `tracing` Subscriber，无法再次注册。
    SubscriberAlreadySet,
    /// 设置全局 Subscriber 失败的底层错误。
    SetGlobalSubscriber(tracing::dispatcher::SetGlobalDefaultError),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::AlreadyInstalled => f.write_str("spark-otel 已完成安装，禁止重复调用 install"),
            Error::SubscriberAlreadySet => {
                f.write_str("全局 tracing Subscriber 已存在，spark-otel 无法覆盖")
            }
            Error::SetGlobalSubscriber(err) => {
                write!(f, "设置 tracing 全局 Subscriber 失败: {err}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// 框架安装后的持久状态，保持 Provider 在进程生命周期内有效。
struct InstallState {
    provider: TracerProvider,
    tracer: OtelTracer,
}

/// 零配置安装入口：构建 OpenTelemetry Provider、注册 tracing 层并返回协议层可用的 Tracer。
///
/// # 教案式说明
/// - **逻辑（How）**：
///   1. 检查是否重复安装或外部已设置 Subscriber；
///   2. 构建 `TracerProvider` 并注册到 `opentelemetry::global`；
///   3. 使用 `tracing-subscriber` 组装 `EnvFilter + fmt + OpenTelemetry` Layer，设置为全局 Subscriber；
///      过滤规则读取 `RUST_LOG`，缺省为 `info`；
///   4. 记录安装状态，返回 `Arc<dyn Tracer>` 供 Server/Client 注入。
/// - **契约（What）**：多次调用返回 [`Error::AlreadyInstalled`]；外部已配置 Subscriber 时返回
///   [`Error::SubscriberAlreadySet`]。
pub fn install() -> Result<Arc<dyn spark_rpc_core::Tracer>, Error> {
    if INSTALL_STATE.get().is_some() {
        return Err(Error::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(Error::SubscriberAlreadySet);
    }

    let state = install_impl()?;
    let tracer: Arc<dyn spark_rpc_core::Tracer> = Arc::new(state.tracer.clone());
    INSTALL_STATE
        .set(state)
        .map_err(|_| Error::AlreadyInstalled)?;
    Ok(tracer)
}

/// 已安装的 Tracer；尚未调用 [`install`] 时返回 `None`。
pub fn installed_tracer() -> Option<Arc<dyn spark_rpc_core::Tracer>> {
    INSTALL_STATE
        .get()
        .map(|state| Arc::new(state.tracer.clone()) as Arc<dyn spark_rpc_core::Tracer>)
}

/// 强制刷新 Provider，确保已结束的 Span 进入导出器。
pub fn force_flush() {
    if let Some(state) = INSTALL_STATE.get() {
        for result in state.provider.force_flush() {
            if let Err(err) = result {
                tracing::warn!(error = %err, "span flush failed");
            }
        }
    }
}

fn install_impl() -> Result<InstallState, Error> {
    let provider = build_tracer_provider();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.versioned_tracer(
        "spark.rpc",
        Some(env!("CARGO_PKG_VERSION")),
        Some(Cow::Borrowed(env!("CARGO_PKG_NAME"))),
        None,
    );

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer.clone()));
    tracing::subscriber::set_global_default(subscriber).map_err(Error::SetGlobalSubscriber)?;

    Ok(InstallState {
        provider,
        tracer: OtelTracer::new(tracer),
    })
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn build_tracer_provider() -> TracerProvider {
    #[allow(unused_mut)]
    let mut builder = TracerProvider::builder().with_config(
        trace::config()
            .with_sampler(trace::Sampler::AlwaysOn)
            .with_resource(Resource::default()),
    );

    #[cfg(feature = "test-util")]
    {
        builder = builder.with_simple_exporter(fetch_in_memory_exporter());
    }

    builder.build()
}

#[cfg(feature = "test-util")]
fn fetch_in_memory_exporter() -> InMemorySpanExporter {
    static EXPORTER: OnceLock<InMemorySpanExporter> = OnceLock::new();
    EXPORTER.get_or_init(InMemorySpanExporter::default).clone()
}

#[cfg(feature = "test-util")]
mod test_support {
    use std::sync::{Arc, Mutex};

    use futures_util::future::BoxFuture;
    use opentelemetry::trace::{TraceError, TraceResult};
    use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};

    /// 收集已完成 Span 供断言的导出器。
    ///
    /// # 教案式说明
    /// - **意图（Why）**：仅保留“收集已完成 Span”这一测试能力，避免 `opentelemetry-sdk/testing`
    ///   间接引入额外运行时依赖。
    /// - **实现逻辑（How）**：`Arc<Mutex<Vec<SpanData>>>` 保存导出结果，`export` 追加批次后立即返回。
    /// - **契约（What）**：`get_finished_spans` 返回缓冲快照；锁被毒化时返回错误。
    #[derive(Clone, Debug, Default)]
    pub struct InMemorySpanExporter {
        spans: Arc<Mutex<Vec<SpanData>>>,
    }

    impl InMemorySpanExporter {
        pub fn get_finished_spans(&self) -> TraceResult<Vec<SpanData>> {
            self.spans
                .lock()
                .map(|guard| guard.iter().cloned().collect())
                .map_err(TraceError::from)
        }

        /// 清空内部缓冲，确保多轮测试之间互不干扰。
        pub fn reset(&self) {
            if let Ok(mut guard) = self.spans.lock() {
                guard.clear();
            }
        }
    }

    impl SpanExporter for InMemorySpanExporter {
        fn export(&mut self, mut batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
            let result = self
                .spans
                .lock()
                .map(|mut guard| guard.append(&mut batch))
                .map_err(TraceError::from);

            Box::pin(async move { result })
        }

        fn shutdown(&mut self) {
            self.reset();
        }
    }
}

#[cfg(feature = "test-util")]
/// 测试辅助工具：不经过全局安装即可构造带内存导出器的 Tracer。
pub mod testing {
    use opentelemetry::trace::TracerProvider as _;

    use super::*;

    /// 构造独立的 Provider 与导出器，测试之间互不共享状态。
    pub fn isolated() -> (TracerProvider, OtelTracer, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_config(trace::config().with_sampler(trace::Sampler::AlwaysOn))
            .with_simple_exporter(exporter.clone())
            .build();
        let tracer = OtelTracer::new(provider.tracer("spark.rpc.test"));
        (provider, tracer, exporter)
    }

    /// 获取全局安装以来导出的全部 Span。
    pub fn finished_spans() -> Vec<SpanData> {
        force_flush();
        fetch_in_memory_exporter()
            .get_finished_spans()
            .unwrap_or_default()
    }

    /// 清空全局 In-Memory Exporter 中的 Span。
    pub fn reset() {
        fetch_in_memory_exporter().reset();
    }
}
