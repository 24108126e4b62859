//! RPC Server：方法注册、入站分发与保留的 Schema 方法。
//!
//! # 教案式概览
//! - **意图（Why）**：把“主题订阅 → 上下文派生 → 中间件链 → 方法链 → 回复”的协议骨架固化下来，
//!   业务代码只需注册方法处理器。
//! - **结构（How）**：
//!   - 顶层链：[`ErrorBoundary`] → 全局中间件 → [`Dispatch`]（终端步骤）；
//!   - 方法链：[`EncodeResponse`] → [`DecodeRequest`] → 方法中间件 → [`InvokeHandler`]（终端步骤）；
//!   - 两条链都在 `start` 时固化，之后只读。
//! - **状态机（What）**：`idle` → `started`。注册、追加中间件只允许在 `idle` 状态；
//!   `start` 只能成功一次。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use spark_rpc_core::{
    BoxFuture, Composed, Context, ContextTemplate, Definition, Middleware, NoopTracer, Packet,
    PacketHandler, Result, RpcError, Serializer, SpanGuard, TagValue, Tracer, Transporter,
    async_trait, compose, headers, rpc_subject,
};
use tracing::{debug, info, warn};

use crate::schema_doc::{MethodSchema, SCHEMA_METHOD, SchemaDocument};
use crate::service::{MethodDefinition, MethodHandler, Service};

type ServerMiddleware = Arc<dyn Middleware<Context, ()>>;

/// 已注册方法：类型名与固化后的方法链。
struct MethodEntry {
    schema: MethodSchema,
    chain: Composed<Context, ()>,
    handler: InvokeHandler,
}

/// RPC 服务端。
///
/// # 契约说明（What）
/// - 服务名不得为空；订阅主题为 `<service>_rpc`；
/// - 方法的请求/响应类型在注册时写入 Storage（引用已有名称时要求其已存在）；
/// - 任何请求期错误都被转换为 `error`/`error.message` 响应头，不会中断进程。
pub struct Server {
    name: String,
    transporter: Arc<dyn Transporter>,
    serializer: Arc<dyn Serializer>,
    tracer: Arc<dyn Tracer>,
    middlewares: Mutex<Vec<ServerMiddleware>>,
    methods: RwLock<BTreeMap<String, Arc<MethodEntry>>>,
    started: AtomicBool,
}

impl Server {
    /// 构造服务端，默认不产生追踪数据。
    pub fn new(
        name: impl Into<String>,
        transporter: Arc<dyn Transporter>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RpcError::Config("service name must not be blank".into()));
        }
        Ok(Self {
            name,
            transporter,
            serializer,
            tracer: Arc::new(NoopTracer),
            middlewares: Mutex::new(Vec::new()),
            methods: RwLock::new(BTreeMap::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn ensure_idle(&self, action: &str) -> Result<()> {
        if self.is_started() {
            return Err(RpcError::Config(format!(
                "cannot {action} after server `{}` has started",
                self.name
            )));
        }
        Ok(())
    }

    /// 注册一个类型，返回规范名称。
    pub fn record(&self, definition: impl Into<Definition>) -> Result<String> {
        self.ensure_idle("register records")?;
        self.serializer.record(definition.into())
    }

    /// 追加全局中间件，作用于包括保留方法在内的每个请求。
    pub fn use_middleware(&self, middleware: ServerMiddleware) -> Result<()> {
        self.ensure_idle("add middlewares")?;
        self.middlewares.lock().push(middleware);
        Ok(())
    }

    /// 注册方法。
    ///
    /// # 契约说明（What）
    /// - 名称为空、与保留方法同名或重复注册返回 [`RpcError::Config`]；
    /// - 类型注册失败（冲突、悬空引用）原样返回 [`RpcError::Schema`]。
    pub fn add_method(&self, definition: MethodDefinition) -> Result<()> {
        self.ensure_idle("register methods")?;
        let MethodDefinition {
            name,
            request,
            response,
            description,
            middlewares,
            handler,
        } = definition;

        let name = name.trim().to_owned();
        if name.is_empty() {
            return Err(RpcError::Config("method name must not be blank".into()));
        }
        if name == SCHEMA_METHOD {
            return Err(RpcError::Config(format!("method `{name}` is reserved")));
        }
        if self.methods.read().contains_key(&name) {
            return Err(RpcError::Config(format!(
                "method `{}.{name}` is already registered",
                self.name
            )));
        }

        let mut names = self
            .serializer
            .record_all(vec![request, response])?
            .into_iter();
        let (Some(request), Some(response)) = (names.next(), names.next()) else {
            return Err(RpcError::Internal("type registration lost a name".into()));
        };

        let mut steps: Vec<ServerMiddleware> =
            vec![Arc::new(EncodeResponse), Arc::new(DecodeRequest)];
        steps.extend(middlewares);
        let entry = MethodEntry {
            schema: MethodSchema {
                request,
                response,
                description,
            },
            chain: compose(steps),
            handler: InvokeHandler { handler },
        };

        let mut methods = self.methods.write();
        if methods.contains_key(&name) {
            return Err(RpcError::Config(format!(
                "method `{}.{name}` is already registered",
                self.name
            )));
        }
        debug!(service = %self.name, method = %name, "method registered");
        methods.insert(name, Arc::new(entry));
        Ok(())
    }

    /// 以闭包处理器注册方法。
    pub fn method<F>(
        &self,
        name: &str,
        request: impl Into<Definition>,
        response: impl Into<Definition>,
        handler: F,
    ) -> Result<()>
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.add_method(MethodDefinition::new(name, request, response, handler))
    }

    /// 注册带方法级中间件的方法。
    pub fn handle(
        &self,
        name: &str,
        request: impl Into<Definition>,
        response: impl Into<Definition>,
        middlewares: Vec<ServerMiddleware>,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<()> {
        let mut definition = MethodDefinition::with_handler(name, request, response, handler);
        definition.middlewares = middlewares;
        self.add_method(definition)
    }

    /// 注册一个服务实现的全部记录与方法。
    pub fn create_service<S: Service>(&self, service: Arc<S>) -> Result<()> {
        self.ensure_idle("register services")?;
        for record in service.records() {
            self.serializer.record(record)?;
        }
        for method in service.methods() {
            self.add_method(method)?;
        }
        Ok(())
    }

    /// 当前的 Schema 文档。
    pub fn get_schema(&self) -> SchemaDocument {
        SchemaDocument {
            transporter: self.transporter.name().to_owned(),
            serializer: self.serializer.kind().to_owned(),
            types: self.serializer.storage().snapshot(),
            methods: self
                .methods
                .read()
                .iter()
                .map(|(name, entry)| {
                    (SchemaDocument::method_key(&self.name, name), entry.schema.clone())
                })
                .collect(),
        }
    }

    /// 连接传输层并订阅 `<service>_rpc`。
    ///
    /// # 执行逻辑（How）
    /// 1. 原子地切换到 `started`，重复调用返回 [`RpcError::Config`]；
    /// 2. 校验 Storage 中的引用完整性，并预先编码 Schema 文档；
    /// 3. 固化顶层链与方法表后订阅主题；任一步失败都会回到 `idle` 状态。
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RpcError::Config(format!(
                "server `{}` is already started",
                self.name
            )));
        }
        let result = self.start_inner().await;
        if result.is_err() {
            self.started.store(false, Ordering::Release);
        }
        result
    }

    async fn start_inner(&self) -> Result<()> {
        self.serializer.storage().verify()?;
        let schema = self.get_schema().to_json()?;

        let mut steps: Vec<ServerMiddleware> = vec![Arc::new(ErrorBoundary)];
        steps.extend(self.middlewares.lock().iter().cloned());
        let inbound = Arc::new(Inbound {
            template: Arc::new(ContextTemplate::new(
                self.name.clone(),
                Arc::clone(&self.serializer),
                Arc::clone(&self.transporter),
                Arc::clone(&self.tracer),
            )),
            chain: compose(steps),
            dispatch: Dispatch {
                methods: self
                    .methods
                    .read()
                    .iter()
                    .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
                    .collect(),
                schema,
            },
        });

        self.transporter.connect().await?;
        let subject = rpc_subject(&self.name);
        self.transporter.subscribe(&subject, inbound).await?;
        info!(
            service = %self.name,
            %subject,
            serializer = self.serializer.kind(),
            transporter = self.transporter.name(),
            "rpc server started"
        );
        Ok(())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("serializer", &self.serializer.kind())
            .field("transporter", &self.transporter.name())
            .field("methods", &self.methods.read().keys().collect::<Vec<_>>())
            .field("started", &self.is_started())
            .finish()
    }
}

/// 订阅回调：为每个入站数据包派生上下文并执行顶层链。
struct Inbound {
    template: Arc<ContextTemplate>,
    chain: Composed<Context, ()>,
    dispatch: Dispatch,
}

#[async_trait]
impl PacketHandler for Inbound {
    async fn on_packet(&self, packet: Packet) {
        let service = self.template.service();
        let method = packet.header(headers::METHOD).unwrap_or("-").to_owned();
        let tracer = Arc::clone(self.template.tracer());
        let parent = tracer.extract(&packet.header);
        let span = SpanGuard::start(
            tracer,
            &format!("rpc.server {service}.{method}"),
            parent,
            vec![
                ("rpc.service".to_owned(), TagValue::from(service)),
                ("rpc.method".to_owned(), TagValue::from(method.as_str())),
            ],
        );

        let mut ctx = Context::derive(Arc::clone(&self.template), packet, span);
        if let Err(err) = self
            .chain
            .call(&mut ctx, Some(&self.dispatch as &dyn Middleware<Context, ()>))
            .await
        {
            warn!(
                %service,
                %method,
                code = err.code(),
                message = %err.message(),
                "request escaped the error boundary"
            );
        }
    }
}

/// 最外层步骤：把下游错误转换为错误响应，并按 `reply` 头部决定是否回复。
struct ErrorBoundary;

impl Middleware<Context, ()> for ErrorBoundary {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        next: spark_rpc_core::Next<'a, Context, ()>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Err(err) = next.run(ctx).await {
                warn!(
                    service = %ctx.service(),
                    method = ctx.method().unwrap_or("-"),
                    code = err.code(),
                    message = %err.message(),
                    "rpc handler failed"
                );
                ctx.span_mut().fail(&err);
                ctx.response_mut().set_error(&err);
            }

            match ctx.header(headers::REPLY).map(str::to_owned) {
                Some(reply) => {
                    let packet = ctx.response().to_packet();
                    if let Err(err) = ctx.transporter().send(&reply, packet).await {
                        warn!(%reply, code = err.code(), message = %err.message(), "failed to send reply");
                    }
                }
                None => debug!(
                    service = %ctx.service(),
                    method = ctx.method().unwrap_or("-"),
                    "fire-and-forget request, reply dropped"
                ),
            }
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "spark.rpc.error_boundary"
    }
}

/// 顶层链的终端步骤：按 `method` 头部查找方法链。
struct Dispatch {
    methods: HashMap<String, Arc<MethodEntry>>,
    schema: Bytes,
}

impl Middleware<Context, ()> for Dispatch {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        _next: spark_rpc_core::Next<'a, Context, ()>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let Some(method) = ctx.method().map(str::to_owned) else {
                return Err(RpcError::HandlerUnimplemented(format!(
                    "request to `{}` carries no method header",
                    ctx.service()
                )));
            };

            if method == SCHEMA_METHOD {
                ctx.response_mut().set_encoded(self.schema.clone());
                return Ok(());
            }

            let entry = self.methods.get(&method).cloned().ok_or_else(|| {
                RpcError::HandlerUnimplemented(format!(
                    "method `{}.{method}` is not registered",
                    ctx.service()
                ))
            })?;
            ctx.set_extra(METHOD_SCHEMA, entry.schema.clone());
            entry
                .chain
                .call(ctx, Some(&entry.handler as &dyn Middleware<Context, ()>))
                .await
        })
    }

    fn name(&self) -> &'static str {
        "spark.rpc.dispatch"
    }
}

/// 方法链经由暂存区共享的类型信息。
const METHOD_SCHEMA: &str = "spark.rpc.method_schema";

fn method_schema(ctx: &Context) -> Result<MethodSchema> {
    ctx.get_extra::<MethodSchema>(METHOD_SCHEMA, true)?
        .cloned()
        .ok_or_else(|| RpcError::Internal("method schema missing".into()))
}

/// 解码请求体，开启 `method_request` 子 Span。
struct DecodeRequest;

impl Middleware<Context, ()> for DecodeRequest {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        next: spark_rpc_core::Next<'a, Context, ()>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let schema = method_schema(ctx)?;
            let body = ctx
                .serializer()
                .decode_for(
                    "method_request",
                    &schema.request,
                    &ctx.packet().body,
                    Some(ctx.span()),
                )
                .map_err(|err| match err {
                    RpcError::Serializer(message) => RpcError::BadRequest(message),
                    other => other,
                })?;
            ctx.set_body(body);
            next.run(ctx).await
        })
    }

    fn name(&self) -> &'static str {
        "spark.rpc.decode_request"
    }
}

/// 下游成功后编码响应体，开启 `method_response` 子 Span。
struct EncodeResponse;

impl Middleware<Context, ()> for EncodeResponse {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        next: spark_rpc_core::Next<'a, Context, ()>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            next.run(ctx).await?;
            let schema = method_schema(ctx)?;
            let encoded = ctx.serializer().encode_for(
                "method_response",
                &schema.response,
                ctx.response().body(),
                Some(ctx.span()),
            )?;
            ctx.response_mut().set_encoded(encoded);
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "spark.rpc.encode_response"
    }
}

/// 方法链的终端步骤：在 `method_handler` 子 Span 中执行业务处理器。
struct InvokeHandler {
    handler: Arc<dyn MethodHandler>,
}

impl Middleware<Context, ()> for InvokeHandler {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        _next: spark_rpc_core::Next<'a, Context, ()>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut span = ctx.start_span("method_handler");
            let result = self.handler.call(ctx).await;
            span.record(result)
        })
    }

    fn name(&self) -> &'static str {
        "spark.rpc.invoke_handler"
    }
}
