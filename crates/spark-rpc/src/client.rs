//! RPC Client：Schema 协商、远端调用与错误重建。
//!
//! # 教案式概览
//! - **意图（Why）**：调用方在编译期并不掌握远端类型，Client 在首次调用某个目标时拉取其 Schema 文档，
//!   据此构造私有的 Storage 与编解码器，之后所有调用都以动态值收发。
//! - **结构（How）**：
//!   - 每个目标对应一个 `OnceCell<Arc<RemoteService>>`，并发的首次调用只会触发一次 Schema 拉取；
//!   - 调用经过拦截器链（结果类型为响应体 [`Value`]），终端步骤 [`RemoteCall`] 负责编码、发送与解码；
//!   - 每个阶段开启子 Span，Span 由 [`SpanGuard`] 在作用域结束时关闭。
//! - **契约（What）**：
//!   - 未知方法返回 [`RpcError::BadRequest`]；
//!   - 响应头携带 `error` 时按错误码重建类型化错误；
//!   - 超时由传输层判定，表现为 [`RpcError::RequestTimeOut`]。

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use spark_rpc_core::{
    BoxFuture, Context, ContextTemplate, Middleware, Next, NoopTracer, Packet, Result, RpcError,
    SerializerConfig, SpanGuard, Storage, TagValue, Tracer, Transporter, Value, compose,
    create_serializer, headers, rpc_subject, traced_async,
};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::schema_doc::{MethodSchema, SCHEMA_METHOD, SchemaDocument};

type Interceptor = Arc<dyn Middleware<Context, Value>>;

/// 已协商的远端服务。
struct RemoteService {
    document: SchemaDocument,
    template: Arc<ContextTemplate>,
}

/// RPC 客户端。
///
/// 同一个 Client 可以调用任意多个目标服务，各目标的 Schema 相互独立。
pub struct Client {
    name: String,
    transporter: Arc<dyn Transporter>,
    tracer: Arc<dyn Tracer>,
    interceptors: RwLock<Vec<Interceptor>>,
    remotes: DashMap<String, Arc<OnceCell<Arc<RemoteService>>>>,
}

impl Client {
    /// `name` 是调用方自身的服务名，写入每个请求的 `service` 头部。
    pub fn new(name: impl Into<String>, transporter: Arc<dyn Transporter>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RpcError::Config("client name must not be blank".into()));
        }
        Ok(Self {
            name,
            transporter,
            tracer: Arc::new(NoopTracer),
            interceptors: RwLock::new(Vec::new()),
            remotes: DashMap::new(),
        })
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 追加拦截器，对之后发起的调用生效。
    pub fn use_interceptor(&self, interceptor: Interceptor) {
        self.interceptors.write().push(interceptor);
    }

    /// 目标服务的 Schema 是否已就绪。
    pub fn is_resolved(&self, target: &str) -> bool {
        self.remotes
            .get(target)
            .is_some_and(|cell| cell.initialized())
    }

    /// 已就绪目标的 Schema 文档。
    pub fn schema(&self, target: &str) -> Option<SchemaDocument> {
        let cell = self.remotes.get(target).map(|cell| Arc::clone(cell.value()))?;
        cell.get().map(|remote| remote.document.clone())
    }

    /// 调用保留方法拉取目标的 Schema 文档，不写入缓存。
    ///
    /// `parent` 存在时 `schema_fetch` Span 作为其子 Span，拉取因此归入调用方的 Trace。
    pub async fn fetch_schema(
        &self,
        target: &str,
        parent: Option<&SpanGuard>,
    ) -> Result<SchemaDocument> {
        let mut packet = Packet::default()
            .with_header(headers::METHOD, SCHEMA_METHOD)
            .with_header(headers::SERVICE, self.name.as_str());
        let tags = vec![("rpc.target".to_owned(), TagValue::from(target))];
        let mut span = match parent {
            Some(parent) => parent.child_with_tags("schema_fetch", tags),
            None => SpanGuard::start(Arc::clone(&self.tracer), "schema_fetch", None, tags),
        };
        span.inject_into(&mut packet.header);

        let result = async {
            let reply = self
                .transporter
                .send_request(&rpc_subject(target), packet)
                .await?;
            if let Some(err) = reply.error() {
                return Err(err);
            }
            SchemaDocument::from_json(&reply.body)
        }
        .await;
        let document = span.record(result)?;
        info!(
            %target,
            serializer = %document.serializer,
            methods = document.methods.len(),
            "schema fetched"
        );
        Ok(document)
    }

    /// 以给定文档覆盖目标的 Schema。
    pub fn set_schema(&self, target: &str, document: SchemaDocument) -> Result<()> {
        let remote = self.build_remote(target, document)?;
        self.remotes
            .insert(target.to_owned(), Arc::new(OnceCell::from(remote)));
        Ok(())
    }

    fn build_remote(&self, target: &str, document: SchemaDocument) -> Result<Arc<RemoteService>> {
        let storage = Arc::new(Storage::new());
        storage.extend(document.types.clone())?;
        let serializer = create_serializer(
            &SerializerConfig::new(document.serializer.clone()),
            storage,
        )?;
        let template = Arc::new(ContextTemplate::new(
            target,
            serializer,
            Arc::clone(&self.transporter),
            Arc::clone(&self.tracer),
        ));
        Ok(Arc::new(RemoteService { document, template }))
    }

    /// 获取目标的协商结果；并发的首次调用共享同一次拉取，失败后下次调用重试。
    ///
    /// 拉取沿用发起拉取的那次调用的 `parent`，等待中的并发调用不会产生额外的 Span。
    async fn remote(
        &self,
        target: &str,
        parent: Option<&SpanGuard>,
    ) -> Result<Arc<RemoteService>> {
        let cell = Arc::clone(
            self.remotes
                .entry(target.to_owned())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        );
        cell.get_or_try_init(|| async {
            let document = self.fetch_schema(target, parent).await?;
            self.build_remote(target, document)
        })
        .await
        .cloned()
    }

    /// 调用远端方法，返回解码后的响应体。
    ///
    /// # 执行逻辑（How）
    /// 1. 必要时拉取 Schema（每个目标至多一次成功拉取）；
    /// 2. 在方法表中解析 `<target>.<method>`，未知方法返回 [`RpcError::BadRequest`]；
    /// 3. 开启 `rpc.client` Span（`parent` 存在时作为其子 Span），依次执行拦截器与 [`RemoteCall`]；
    /// 4. 无论成败 Span 都会结束，失败时带有错误标签。
    pub async fn call(
        &self,
        target: &str,
        method: &str,
        body: Value,
        parent: Option<&SpanGuard>,
    ) -> Result<Value> {
        let mut ctx = self.prepare(target, method, body, parent).await?;
        self.intercept(&mut ctx, &RemoteCall).await
    }

    /// 以强类型结构发起调用。
    pub async fn call_typed<Req, Resp>(
        &self,
        target: &str,
        method: &str,
        request: &Req,
        parent: Option<&SpanGuard>,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = Value::from_serialize(request)?;
        self.call(target, method, body, parent)
            .await?
            .deserialize_into()
    }

    /// 即发即弃：请求不携带 `reply` 头部，远端处理后不回复。
    ///
    /// 与 [`Client::call`] 经过同一条拦截器链，链的结果恒为 [`Value::Null`]。
    pub async fn notify(
        &self,
        target: &str,
        method: &str,
        body: Value,
        parent: Option<&SpanGuard>,
    ) -> Result<()> {
        let mut ctx = self.prepare(target, method, body, parent).await?;
        self.intercept(&mut ctx, &RemoteNotify).await.map(|_| ())
    }

    /// 以给定终端步骤执行拦截器链，并在根 Span 上记录结果。
    async fn intercept(
        &self,
        ctx: &mut Context,
        terminal: &dyn Middleware<Context, Value>,
    ) -> Result<Value> {
        let interceptors = compose(self.interceptors.read().clone());
        let result = interceptors.call(ctx, Some(terminal)).await;
        ctx.span_mut().record(result)
    }

    async fn prepare(
        &self,
        target: &str,
        method: &str,
        body: Value,
        parent: Option<&SpanGuard>,
    ) -> Result<Context> {
        let remote = self.remote(target, parent).await?;
        let schema = remote.document.method(target, method).cloned().ok_or_else(|| {
            RpcError::BadRequest(format!(
                "method `{method}` is not exposed by service `{target}`"
            ))
        })?;

        let name = format!("rpc.client {target}.{method}");
        let tags = vec![
            ("rpc.service".to_owned(), TagValue::from(target)),
            ("rpc.method".to_owned(), TagValue::from(method)),
        ];
        let span = match parent {
            Some(parent) => parent.child_with_tags(&name, tags),
            None => SpanGuard::start(Arc::clone(&self.tracer), &name, None, tags),
        };

        let packet = Packet::default()
            .with_header(headers::METHOD, method)
            .with_header(headers::SERVICE, self.name.as_str());
        let mut ctx = Context::derive(Arc::clone(&remote.template), packet, span);
        ctx.set_body(body);
        ctx.set_extra(METHOD_SCHEMA, schema);
        Ok(ctx)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("transporter", &self.transporter.name())
            .field("interceptors", &self.interceptors.read().len())
            .field(
                "targets",
                &self
                    .remotes
                    .iter()
                    .map(|entry| entry.key().clone())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

const METHOD_SCHEMA: &str = "spark.rpc.method_schema";

/// 拦截器链的终端步骤：编码、发送、还原错误并解码响应。
struct RemoteCall;

impl Middleware<Context, Value> for RemoteCall {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        _next: Next<'a, Context, Value>,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let reply = send_encoded(ctx, true).await?.ok_or_else(|| {
                RpcError::Internal("request/reply call finished without a reply".into())
            })?;
            if let Some(err) = reply.error() {
                return Err(err);
            }

            let schema = ctx
                .get_extra::<MethodSchema>(METHOD_SCHEMA, true)?
                .cloned()
                .ok_or_else(|| RpcError::Internal("method schema missing".into()))?;
            let body = ctx
                .serializer()
                .decode_for("method_response", &schema.response, &reply.body, Some(ctx.span()))
                .map_err(|err| match err {
                    RpcError::Serializer(message) => RpcError::BadResponse(message),
                    other => other,
                })?;

            for (name, value) in &reply.header {
                ctx.response_mut().set_header(name, value.clone());
            }
            ctx.response_mut().set_encoded(reply.body);
            ctx.respond(body.clone());
            Ok(body)
        })
    }

    fn name(&self) -> &'static str {
        "spark.rpc.remote_call"
    }
}

/// 即发即弃路径的终端步骤：只编码并发送。
struct RemoteNotify;

impl Middleware<Context, Value> for RemoteNotify {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        _next: Next<'a, Context, Value>,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            send_encoded(ctx, false).await?;
            Ok(Value::Null)
        })
    }

    fn name(&self) -> &'static str {
        "spark.rpc.remote_notify"
    }
}

/// 编码请求体、注入追踪上下文并发送；`expect_reply` 为假时走即发即弃路径。
async fn send_encoded(ctx: &mut Context, expect_reply: bool) -> Result<Option<Packet>> {
    let schema = ctx
        .get_extra::<MethodSchema>(METHOD_SCHEMA, true)?
        .cloned()
        .ok_or_else(|| RpcError::Internal("method schema missing".into()))?;
    let encoded = ctx.serializer().encode_for(
        "method_request",
        &schema.request,
        ctx.body(),
        Some(ctx.span()),
    )?;

    let mut header = ctx.headers().clone();
    ctx.span().inject_into(&mut header);
    let packet = Packet::new(header, encoded);
    ctx.packet_mut().body = packet.body.clone();

    let subject = rpc_subject(ctx.service());
    let tags = vec![("rpc.subject".to_owned(), TagValue::from(subject.as_str()))];
    let transporter = Arc::clone(ctx.transporter());
    if expect_reply {
        traced_async(
            Some(ctx.span()),
            "transport_request",
            tags,
            transporter.send_request(&subject, packet),
        )
        .await
        .map(Some)
    } else {
        traced_async(
            Some(ctx.span()),
            "transport_send",
            tags,
            transporter.send(&subject, packet),
        )
        .await?;
        debug!(%subject, "notification sent");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use spark_rpc_core::codes;
    use spark_rpc_core::test_stubs::UnreachableTransport;

    use super::*;

    #[test]
    fn blank_name_is_rejected() {
        let err = Client::new("", Arc::new(UnreachableTransport)).unwrap_err();
        assert_eq!(err.code(), codes::CONFIG);
    }

    #[tokio::test]
    async fn unreachable_target_stays_unresolved() {
        let client = Client::new("web", Arc::new(UnreachableTransport)).unwrap();
        let err = client
            .call("users", "get", Value::Null, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::TRANSPORTER);
        assert!(!client.is_resolved("users"), "拉取失败后不应缓存");
    }

    #[tokio::test]
    async fn preset_schema_skips_the_fetch() {
        let client = Client::new("web", Arc::new(UnreachableTransport)).unwrap();
        client
            .set_schema(
                "users",
                SchemaDocument {
                    transporter: "memory".into(),
                    serializer: "ordered".into(),
                    ..SchemaDocument::default()
                },
            )
            .unwrap();
        assert!(client.is_resolved("users"));

        let err = client
            .call("users", "get", Value::Null, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::BAD_REQUEST, "未知方法应为 bad request");
        assert!(err.message().contains("users"));
    }

    #[test]
    fn unknown_serializer_in_document_is_a_config_error() {
        let client = Client::new("web", Arc::new(UnreachableTransport)).unwrap();
        let err = client
            .set_schema(
                "users",
                SchemaDocument {
                    serializer: "xml".into(),
                    ..SchemaDocument::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), codes::CONFIG);
    }
}
