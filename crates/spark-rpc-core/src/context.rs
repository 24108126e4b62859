//! 请求上下文与响应模型。
//!
//! # 教案式概览
//! - **意图（Why）**：每个服务（或每个远端目标）只构造一次 [`ContextTemplate`]，其中保存不可变的共享引用；
//!   每个请求由模板派生出独立的 [`Context`]，请求期的改动（请求体、响应头、Span、暂存区）不会触及模板。
//! - **结构（How）**：模板置于 `Arc` 中，派生只复制一次引用计数与默认响应头；
//!   Server 的方法链与 Client 的拦截器链使用同一个上下文类型。
//! - **契约（What）**：
//!   - [`Context::set_header`] 写入响应头，名称经过小写与去空白规范化；
//!   - 入站头部查询同样经过规范化，因此大小写不敏感；
//!   - [`Context::get_extra`] 在 `strict` 且缺失时返回 [`RpcError::Internal`]，否则返回 `None`。

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, RpcError};
use crate::observability::{SpanGuard, Tracer};
use crate::packet::{Header, Packet, headers, normalize_header_name};
use crate::serializer::Serializer;
use crate::transport::Transporter;
use crate::value::Value;

/// 每个服务（或远端目标）共享的上下文模板。
pub struct ContextTemplate {
    service: String,
    serializer: Arc<dyn Serializer>,
    transporter: Arc<dyn Transporter>,
    tracer: Arc<dyn Tracer>,
    response_header: Header,
}

impl ContextTemplate {
    pub fn new(
        service: impl Into<String>,
        serializer: Arc<dyn Serializer>,
        transporter: Arc<dyn Transporter>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        Self {
            service: service.into(),
            serializer,
            transporter,
            tracer,
            response_header: Header::new(),
        }
    }

    /// 为所有派生响应预置一个头部。
    pub fn with_response_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.response_header
            .insert(normalize_header_name(name), value.into());
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn transporter(&self) -> &Arc<dyn Transporter> {
        &self.transporter
    }

    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.tracer
    }

    pub fn response_header(&self) -> &Header {
        &self.response_header
    }
}

impl fmt::Debug for ContextTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextTemplate")
            .field("service", &self.service)
            .field("serializer", &self.serializer.kind())
            .field("transporter", &self.transporter.name())
            .finish()
    }
}

/// 请求对应的响应。
///
/// `body` 是处理器产出的动态值，`encoded` 是编码阶段写入的线上字节。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Response {
    header: Header,
    body: Value,
    encoded: Bytes,
}

impl Response {
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.header
            .get(&normalize_header_name(name))
            .map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.header.insert(normalize_header_name(name), value.into());
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn set_body(&mut self, body: Value) {
        self.body = body;
    }

    pub fn take_body(&mut self) -> Value {
        std::mem::take(&mut self.body)
    }

    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    pub fn set_encoded(&mut self, encoded: Bytes) {
        self.encoded = encoded;
    }

    /// 写入错误头部，并清空响应体。
    pub fn set_error(&mut self, err: &RpcError) {
        self.header
            .insert(headers::ERROR.to_owned(), err.code().to_owned());
        self.header
            .insert(headers::ERROR_MESSAGE.to_owned(), err.message().into_owned());
        self.body = Value::Null;
        self.encoded = Bytes::new();
    }

    /// 组装为待发送的数据包。
    pub fn to_packet(&self) -> Packet {
        Packet::new(self.header.clone(), self.encoded.clone())
    }
}

type Extra = HashMap<String, Box<dyn Any + Send + Sync>>;

/// 单次请求（或单次远端调用）的上下文。
///
/// # 契约说明（What）
/// - 生命周期与一次链路执行相同，链路结束（无论成败）后随之销毁，其持有的 Span 同时结束；
/// - 不同请求之间不共享任何可变字段。
pub struct Context {
    template: Arc<ContextTemplate>,
    packet: Packet,
    body: Value,
    response: Response,
    span: SpanGuard,
    extra: Extra,
}

impl Context {
    /// 由模板派生请求上下文。
    pub fn derive(template: Arc<ContextTemplate>, packet: Packet, span: SpanGuard) -> Self {
        let response = Response {
            header: template.response_header.clone(),
            ..Response::default()
        };
        Self {
            template,
            packet,
            body: Value::Null,
            response,
            span,
            extra: Extra::new(),
        }
    }

    pub fn template(&self) -> &Arc<ContextTemplate> {
        &self.template
    }

    pub fn service(&self) -> &str {
        self.template.service()
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        self.template.serializer()
    }

    pub fn transporter(&self) -> &Arc<dyn Transporter> {
        self.template.transporter()
    }

    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        self.template.tracer()
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn packet_mut(&mut self) -> &mut Packet {
        &mut self.packet
    }

    /// 入站头部。
    pub fn headers(&self) -> &Header {
        &self.packet.header
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.packet.header(name)
    }

    /// 请求的目标方法名。
    pub fn method(&self) -> Option<&str> {
        self.header(headers::METHOD)
    }

    /// 解码后的请求体。
    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Value {
        &mut self.body
    }

    pub fn set_body(&mut self, body: Value) {
        self.body = body;
    }

    pub fn take_body(&mut self) -> Value {
        std::mem::take(&mut self.body)
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    /// 写入响应头。
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.response.set_header(name, value);
    }

    /// 设置响应体。
    pub fn respond(&mut self, body: impl Into<Value>) {
        self.response.set_body(body.into());
    }

    pub fn span(&self) -> &SpanGuard {
        &self.span
    }

    pub fn span_mut(&mut self) -> &mut SpanGuard {
        &mut self.span
    }

    /// 在当前 Span 之下开启子 Span。
    pub fn start_span(&self, name: &str) -> SpanGuard {
        self.span.child(name)
    }

    pub fn set_extra<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.extra.insert(name.into(), Box::new(value));
    }

    /// 读取暂存值。
    ///
    /// 类型不符与缺失同样处理：`strict` 时返回 [`RpcError::Internal`]，否则返回 `None`。
    pub fn get_extra<T: Any>(&self, name: &str, strict: bool) -> Result<Option<&T>> {
        match self.extra.get(name).map(|value| value.downcast_ref::<T>()) {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) if strict => Err(RpcError::Internal(format!(
                "extra `{name}` is not a {}",
                std::any::type_name::<T>()
            ))),
            None if strict => Err(RpcError::Internal(format!("extra `{name}` is not set"))),
            _ => Ok(None),
        }
    }

    pub fn remove_extra(&mut self, name: &str) -> bool {
        self.extra.remove(name).is_some()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("service", &self.template.service)
            .field("header", &self.packet.header)
            .field("body", &self.body)
            .field("response", &self.response)
            .field("span", &self.span)
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}
