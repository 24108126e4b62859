use opentelemetry::{
    Context, KeyValue, Value,
    propagation::{Extractor, Injector, TextMapPropagator},
    trace::{
        self as otel_trace, Span as _, SpanContext as OtelSpanContext, TraceContextExt as _,
        Tracer as _,
    },
};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use spark_rpc_core::{Header, Span, SpanContext, SpanOptions, TagValue, Tracer};

/// OpenTelemetry 版本的 [`Tracer`]，把协议各阶段的 Span 交给 OpenTelemetry SDK 导出。
///
/// # 教案式说明
/// - **意图（Why）**：核心层只认识轻量的 [`SpanContext`]，而导出后端需要 W3C 语义的上下文；
///   该类型承担两种表示之间的桥梁，使 Server/Client 无需感知具体后端。
/// - **逻辑（How）**：
///   1. `start_span` 把父级 [`SpanContext`] 转换为远程父 Span，再由 SDK `Tracer` 构建子 Span；
///   2. 标签逐条映射为 [`KeyValue`]；
///   3. `inject`/`extract` 使用 W3C `traceparent` 头部。
/// - **契约（What）**：返回的 Span 与父级共享同一 `trace_id`；父级无效时开启新的 Trace。
#[derive(Clone)]
pub struct OtelTracer {
    tracer: opentelemetry_sdk::trace::Tracer,
    propagator: TraceContextPropagator,
}

impl OtelTracer {
    pub fn new(tracer: opentelemetry_sdk::trace::Tracer) -> Self {
        Self {
            tracer,
            propagator: TraceContextPropagator::new(),
        }
    }
}

impl std::fmt::Debug for OtelTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtelTracer").finish_non_exhaustive()
    }
}

impl Tracer for OtelTracer {
    fn start_span(&self, name: &str, options: SpanOptions) -> Box<dyn Span> {
        let parent = match options.child_of.filter(SpanContext::is_valid) {
            Some(parent) => Context::new().with_remote_span_context(span_context_to_otel(&parent)),
            None => Context::new(),
        };

        let mut builder = self.tracer.span_builder(name.to_owned());
        builder.attributes = Some(
            options
                .tags
                .into_iter()
                .map(|(key, value)| KeyValue::new(key, tag_to_otel(value)))
                .collect(),
        );
        let span = self.tracer.build_with_context(builder, &parent);
        let context = span_context_from_otel(span.span_context());
        Box::new(OtelSpan {
            span: Some(span),
            context,
        })
    }

    fn inject(&self, context: &SpanContext, carrier: &mut Header) {
        let cx = Context::new().with_remote_span_context(span_context_to_otel(context));
        self.propagator
            .inject_context(&cx, &mut HeaderInjector(carrier));
    }

    fn extract(&self, carrier: &Header) -> Option<SpanContext> {
        let cx = self.propagator.extract(&HeaderExtractor(carrier));
        let remote = cx.span().span_context().clone();
        remote
            .is_valid()
            .then(|| span_context_from_otel(&remote))
    }
}

/// 持有 SDK Span 的适配器，`finish` 时调用 `end`。
struct OtelSpan {
    span: Option<opentelemetry_sdk::trace::Span>,
    context: SpanContext,
}

impl Span for OtelSpan {
    fn context(&self) -> SpanContext {
        self.context
    }

    fn set_tag(&mut self, key: &str, value: TagValue) {
        if let Some(span) = self.span.as_mut() {
            span.set_attribute(KeyValue::new(key.to_owned(), tag_to_otel(value)));
        }
    }

    fn finish(&mut self) {
        if let Some(mut span) = self.span.take() {
            span.end();
        }
    }
}

fn tag_to_otel(value: TagValue) -> Value {
    match value {
        TagValue::Str(text) => Value::from(text),
        TagValue::Int(n) => Value::from(n),
        TagValue::Bool(flag) => Value::from(flag),
    }
}

fn span_context_to_otel(context: &SpanContext) -> OtelSpanContext {
    let flags = if context.sampled {
        otel_trace::TraceFlags::SAMPLED
    } else {
        otel_trace::TraceFlags::default()
    };
    OtelSpanContext::new(
        otel_trace::TraceId::from_bytes(context.trace_id.to_be_bytes()),
        otel_trace::SpanId::from_bytes(context.span_id.to_be_bytes()),
        flags,
        true,
        otel_trace::TraceState::default(),
    )
}

fn span_context_from_otel(context: &OtelSpanContext) -> SpanContext {
    SpanContext {
        trace_id: u128::from_be_bytes(context.trace_id().to_bytes()),
        span_id: u64::from_be_bytes(context.span_id().to_bytes()),
        sampled: context.is_sampled(),
    }
}

struct HeaderInjector<'a>(&'a mut Header);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(spark_rpc_core::normalize_header_name(key), value);
    }
}

struct HeaderExtractor<'a>(&'a Header);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&spark_rpc_core::normalize_header_name(key))
            .map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}
