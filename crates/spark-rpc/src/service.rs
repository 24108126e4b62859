//! 方法定义与批量注册契约。
//!
//! 服务端既可以逐个调用 [`Server::method`](crate::Server::method) 命令式注册，也可以实现 [`Service`]
//! 一次性交出全部记录与方法，由 [`Server::create_service`](crate::Server::create_service) 驱动；
//! 两条路径最终都落到 [`Server::add_method`](crate::Server::add_method)。

use std::fmt;
use std::sync::Arc;

use spark_rpc_core::{BoxFuture, Context, Definition, Middleware, Result};

/// 方法的业务处理器。
///
/// 处理器从 [`Context::body`] 读取已解码的请求体，并通过 [`Context::respond`] 写入响应体。
pub trait MethodHandler: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<()>>;
}

impl<F> MethodHandler for F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<()>> {
        self(ctx)
    }
}

/// 一个待注册的方法。
pub struct MethodDefinition {
    pub name: String,
    pub request: Definition,
    pub response: Definition,
    pub description: Option<String>,
    /// 仅作用于该方法的中间件，位于解码之后、处理器之前。
    pub middlewares: Vec<Arc<dyn Middleware<Context, ()>>>,
    pub handler: Arc<dyn MethodHandler>,
}

impl MethodDefinition {
    /// 以闭包作为处理器。闭包需返回装箱的 Future：
    ///
    /// ```ignore
    /// MethodDefinition::new("get", "UserId", "User", |ctx| {
    ///     Box::pin(async move {
    ///         let id = ctx.body().get("id").cloned().unwrap_or_default();
    ///         ctx.respond(Value::record([("id", id)]));
    ///         Ok(())
    ///     })
    /// });
    /// ```
    pub fn new<F>(
        name: impl Into<String>,
        request: impl Into<Definition>,
        response: impl Into<Definition>,
        handler: F,
    ) -> Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        Self::with_handler(name, request, response, Arc::new(handler))
    }

    pub fn with_handler(
        name: impl Into<String>,
        request: impl Into<Definition>,
        response: impl Into<Definition>,
        handler: Arc<dyn MethodHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            request: request.into(),
            response: response.into(),
            description: None,
            middlewares: Vec::new(),
            handler,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware<Context, ()>>) -> Self {
        self.middlewares.push(middleware);
        self
    }
}

impl fmt::Debug for MethodDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDefinition")
            .field("name", &self.name)
            .field("request", &self.request.name())
            .field("response", &self.response.name())
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

/// 可整体注册的服务。
///
/// # 契约说明（What）
/// - `records` 先于 `methods` 注册，方法可以按名称引用这些记录；
/// - `methods` 以 `Arc<Self>` 调用，处理器闭包可以持有服务实例。
pub trait Service: Send + Sync + 'static {
    fn records(&self) -> Vec<Definition> {
        Vec::new()
    }

    fn methods(self: Arc<Self>) -> Vec<MethodDefinition>;
}
