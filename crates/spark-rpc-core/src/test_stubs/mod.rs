//! 测试桩集合：可断言的追踪记录器与不可达传输层。
//!
//! # 设计定位（Why）
//! - 协议测试需要断言“每个阶段都开启并结束了 Span”“跨线后父子关系保持”，
//!   但不希望引入 OpenTelemetry 全套依赖；
//! - 统一出口让各 crate 的测试复用同一实现，接口演进时集中获得编译错误提示。
//!
//! # 使用方式（How）
//! - `RecordingTracer::new()` 得到可克隆的句柄，`tracer.shared()` 转换为 `Arc<dyn Tracer>` 注入 Server/Client；
//! - 请求完成后通过 [`RecordingTracer::finished`] 读取已结束的 Span。
//!
//! # 契约说明（What）
//! - Span 标识由单调计数器生成，保证非零且在同一记录器内唯一；
//! - `inject`/`extract` 使用 `x-trace-id`/`x-span-id`/`x-sampled` 三个头部键，仅供测试。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, RpcError};
use crate::observability::{Span, SpanContext, SpanGuard, SpanOptions, TagValue, Tracer};
use crate::packet::{Header, Packet};
use crate::transport::{PacketHandler, Transporter};

const TRACE_ID: &str = "x-trace-id";
const SPAN_ID: &str = "x-span-id";
const SAMPLED: &str = "x-sampled";

/// 已结束 Span 的快照。
#[derive(Clone, Debug, PartialEq)]
pub struct FinishedSpan {
    pub name: String,
    pub context: SpanContext,
    pub parent: Option<SpanContext>,
    pub tags: Vec<(String, TagValue)>,
}

impl FinishedSpan {
    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags
            .iter()
            .rev()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value)
    }

    pub fn has_tag(&self, key: &str) -> bool {
        self.tag(key).is_some()
    }
}

#[derive(Debug, Default)]
struct Shared {
    next_id: AtomicU64,
    finished: Mutex<Vec<FinishedSpan>>,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// 记录所有已结束 Span 的追踪器。
#[derive(Clone, Debug, Default)]
pub struct RecordingTracer {
    shared: Arc<Shared>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Arc<dyn Tracer> {
        Arc::new(self.clone())
    }

    /// 开启一个新 Trace 的根 Span。
    pub fn root(&self, name: &str) -> SpanGuard {
        SpanGuard::start(self.shared(), name, None, Vec::new())
    }

    /// 按结束顺序返回全部 Span。
    pub fn finished(&self) -> Vec<FinishedSpan> {
        self.shared.finished.lock().clone()
    }

    pub fn find(&self, name: &str) -> Option<FinishedSpan> {
        self.shared
            .finished
            .lock()
            .iter()
            .find(|span| span.name == name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.shared
            .finished
            .lock()
            .iter()
            .map(|span| span.name.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.shared.finished.lock().clear();
    }
}

struct RecordingSpan {
    shared: Arc<Shared>,
    record: Option<FinishedSpan>,
    context: SpanContext,
}

impl Span for RecordingSpan {
    fn context(&self) -> SpanContext {
        self.context
    }

    fn set_tag(&mut self, key: &str, value: TagValue) {
        if let Some(record) = self.record.as_mut() {
            record.tags.push((key.to_owned(), value));
        }
    }

    fn finish(&mut self) {
        if let Some(record) = self.record.take() {
            self.shared.finished.lock().push(record);
        }
    }
}

impl Tracer for RecordingTracer {
    fn start_span(&self, name: &str, options: SpanOptions) -> Box<dyn Span> {
        let parent = options.child_of.filter(SpanContext::is_valid);
        let context = SpanContext {
            trace_id: parent
                .map(|parent| parent.trace_id)
                .unwrap_or_else(|| u128::from(self.shared.next_id())),
            span_id: self.shared.next_id(),
            sampled: true,
        };
        Box::new(RecordingSpan {
            shared: Arc::clone(&self.shared),
            record: Some(FinishedSpan {
                name: name.to_owned(),
                context,
                parent,
                tags: options.tags,
            }),
            context,
        })
    }

    fn inject(&self, context: &SpanContext, carrier: &mut Header) {
        carrier.insert(TRACE_ID.to_owned(), format!("{:032x}", context.trace_id));
        carrier.insert(SPAN_ID.to_owned(), format!("{:016x}", context.span_id));
        carrier.insert(SAMPLED.to_owned(), u8::from(context.sampled).to_string());
    }

    fn extract(&self, carrier: &Header) -> Option<SpanContext> {
        let trace_id = u128::from_str_radix(carrier.get(TRACE_ID)?, 16).ok()?;
        let span_id = u64::from_str_radix(carrier.get(SPAN_ID)?, 16).ok()?;
        let sampled = carrier.get(SAMPLED).is_some_and(|flag| flag == "1");
        let context = SpanContext {
            trace_id,
            span_id,
            sampled,
        };
        context.is_valid().then_some(context)
    }
}

/// 拒绝一切收发的传输层，用于不涉及网络的上下文测试。
#[derive(Clone, Copy, Debug, Default)]
pub struct UnreachableTransport;

impl UnreachableTransport {
    fn refuse(subject: &str) -> RpcError {
        RpcError::Transporter(format!("subject `{subject}` is unreachable"))
    }
}

#[async_trait]
impl Transporter for UnreachableTransport {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, subject: &str, _handler: Arc<dyn PacketHandler>) -> Result<()> {
        Err(Self::refuse(subject))
    }

    async fn send_request(&self, subject: &str, _packet: Packet) -> Result<Packet> {
        Err(Self::refuse(subject))
    }

    async fn send(&self, subject: &str, _packet: Packet) -> Result<()> {
        Err(Self::refuse(subject))
    }
}
