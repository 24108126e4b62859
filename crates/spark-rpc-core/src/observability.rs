//! 分布式追踪契约：`Tracer`/`Span` 抽象与作用域化的 [`SpanGuard`]。
//!
//! # 教案式概览
//! - **意图（Why）**：协议的每个阶段（解码、处理、编码、传输）都要开启子 Span，并通过头部把追踪上下文带到对端；
//!   核心层只定义契约，具体后端（OpenTelemetry 等）由外部 crate 注入。
//! - **结构（How）**：[`Tracer`] 负责创建 Span 与头部注入/提取，[`SpanGuard`] 以 RAII 方式持有 Span，
//!   离开作用域（包括 `?` 提前返回）时自动结束。
//! - **契约（What）**：未配置追踪时使用 [`NoopTracer`]，所有操作均为空操作，不影响协议流程。

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::{Result, RpcError};
use crate::packet::Header;

/// 可跨线传播的 Span 标识。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub sampled: bool,
}

impl SpanContext {
    pub const INVALID: SpanContext = SpanContext {
        trace_id: 0,
        span_id: 0,
        sampled: false,
    };

    pub fn is_valid(&self) -> bool {
        self.trace_id != 0 && self.span_id != 0
    }
}

/// Span 标签值。
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Str(text) => f.write_str(text),
            TagValue::Int(n) => write!(f, "{n}"),
            TagValue::Bool(flag) => write!(f, "{flag}"),
        }
    }
}

impl From<&str> for TagValue {
    fn from(text: &str) -> Self {
        TagValue::Str(text.to_owned())
    }
}

impl From<String> for TagValue {
    fn from(text: String) -> Self {
        TagValue::Str(text)
    }
}

impl From<i64> for TagValue {
    fn from(n: i64) -> Self {
        TagValue::Int(n)
    }
}

impl From<bool> for TagValue {
    fn from(flag: bool) -> Self {
        TagValue::Bool(flag)
    }
}

/// 创建 Span 的参数。
#[derive(Clone, Debug, Default)]
pub struct SpanOptions {
    pub child_of: Option<SpanContext>,
    pub tags: Vec<(String, TagValue)>,
}

impl SpanOptions {
    pub fn child_of(parent: Option<SpanContext>) -> Self {
        Self {
            child_of: parent,
            tags: Vec::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }
}

/// 一个正在进行的工作单元。
pub trait Span: Send + Sync {
    fn context(&self) -> SpanContext;

    fn set_tag(&mut self, key: &str, value: TagValue);

    /// 结束 Span。实现需保证重复调用无副作用。
    fn finish(&mut self);
}

/// 追踪后端契约。
///
/// # 契约说明（What）
/// - `start_span`：`options.child_of` 为 `None` 时开启新的 Trace；
/// - `inject`/`extract`：在头部中写入/读取载体字段，字段名由实现决定，对核心层不透明；
/// - 实现必须 `Send + Sync`，同一实例在所有并发请求之间共享。
pub trait Tracer: Send + Sync + 'static {
    fn start_span(&self, name: &str, options: SpanOptions) -> Box<dyn Span>;

    fn inject(&self, context: &SpanContext, carrier: &mut Header);

    fn extract(&self, carrier: &Header) -> Option<SpanContext>;
}

/// 空实现：不产生任何追踪数据。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracer;

struct NoopSpan {
    context: SpanContext,
}

impl Span for NoopSpan {
    fn context(&self) -> SpanContext {
        self.context
    }

    fn set_tag(&mut self, _key: &str, _value: TagValue) {}

    fn finish(&mut self) {}
}

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str, options: SpanOptions) -> Box<dyn Span> {
        Box::new(NoopSpan {
            context: options.child_of.unwrap_or(SpanContext::INVALID),
        })
    }

    fn inject(&self, _context: &SpanContext, _carrier: &mut Header) {}

    fn extract(&self, _carrier: &Header) -> Option<SpanContext> {
        None
    }
}

/// 作用域化的 Span 持有者。
///
/// # 教案式说明
/// - **意图 (Why)**：协议阶段可能在任意 `?` 处提前返回，Span 必须无论成功失败都被结束；
///   借助 `Drop` 把“结束”绑定到作用域，而不是依赖每条返回路径手动调用。
/// - **契约 (What)**：
///   - `child` 创建的子 Span 与父 Span 使用同一个 [`Tracer`]；
///   - [`SpanGuard::fail`] 写入 `error`、`error.code`、`error.message` 标签；
///   - Guard 被丢弃或调用 [`SpanGuard::finish`] 时结束 Span，且只结束一次。
pub struct SpanGuard {
    tracer: Arc<dyn Tracer>,
    span: Option<Box<dyn Span>>,
}

impl SpanGuard {
    /// 开启一个 Span，`parent` 为空时成为新 Trace 的根。
    pub fn start(
        tracer: Arc<dyn Tracer>,
        name: &str,
        parent: Option<SpanContext>,
        tags: Vec<(String, TagValue)>,
    ) -> Self {
        let span = tracer.start_span(
            name,
            SpanOptions {
                child_of: parent,
                tags,
            },
        );
        Self {
            tracer,
            span: Some(span),
        }
    }

    /// 不关联任何后端的 Guard。
    pub fn noop() -> Self {
        Self::start(Arc::new(NoopTracer), "noop", None, Vec::new())
    }

    pub fn child(&self, name: &str) -> SpanGuard {
        self.child_with_tags(name, Vec::new())
    }

    pub fn child_with_tags(&self, name: &str, tags: Vec<(String, TagValue)>) -> SpanGuard {
        SpanGuard::start(Arc::clone(&self.tracer), name, Some(self.context()), tags)
    }

    pub fn context(&self) -> SpanContext {
        self.span
            .as_ref()
            .map(|span| span.context())
            .unwrap_or(SpanContext::INVALID)
    }

    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.tracer
    }

    pub fn tag(&mut self, key: &str, value: impl Into<TagValue>) {
        if let Some(span) = self.span.as_mut() {
            span.set_tag(key, value.into());
        }
    }

    /// 标记失败。
    pub fn fail(&mut self, err: &RpcError) {
        self.tag("error", true);
        self.tag("error.code", err.code());
        self.tag("error.message", err.message().into_owned());
    }

    /// 根据结果决定是否标记失败，返回原结果。
    pub fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    /// 把当前 Span 的上下文写入头部。
    pub fn inject_into(&self, carrier: &mut Header) {
        let context = self.context();
        if context.is_valid() {
            self.tracer.inject(&context, carrier);
        }
    }

    pub fn finish(mut self) {
        self.end();
    }

    fn end(&mut self) {
        if let Some(mut span) = self.span.take() {
            span.finish();
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.end();
    }
}

impl fmt::Debug for SpanGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanGuard")
            .field("context", &self.context())
            .field("finished", &self.span.is_none())
            .finish()
    }
}

/// 在父 Span 之下以子 Span 包裹一段同步操作。
///
/// `parent` 为空时直接执行，不产生 Span。
pub fn traced<T>(
    parent: Option<&SpanGuard>,
    stage: &str,
    tags: Vec<(String, TagValue)>,
    op: impl FnOnce() -> Result<T>,
) -> Result<T> {
    match parent {
        Some(parent) => {
            let mut span = parent.child_with_tags(stage, tags);
            span.record(op())
        }
        None => op(),
    }
}

/// [`traced`] 的异步版本。
pub async fn traced_async<T, F>(
    parent: Option<&SpanGuard>,
    stage: &str,
    tags: Vec<(String, TagValue)>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match parent {
        Some(parent) => {
            let mut span = parent.child_with_tags(stage, tags);
            let result = fut.await;
            span.record(result)
        }
        None => fut.await,
    }
}
