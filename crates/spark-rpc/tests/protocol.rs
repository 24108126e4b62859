use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spark_middleware::{CallMetrics, LoggingMiddleware, MetricsMiddleware};
use spark_rpc::{Client, SCHEMA_METHOD, Server};
use spark_rpc_core::{
    BoxFuture, Context, Definition, GenericSerializer, Middleware, NamedType, OrderedSerializer,
    Packet, RpcError, Serializer, Storage, Transporter, Value, codes, headers, middleware_fn,
    rpc_subject,
};
use spark_transport_memory::MemoryTransport;
use tokio::sync::mpsc;

fn user_id() -> Definition {
    Definition::record(
        "UserId",
        NamedType::record().field("id", NamedType::Long, 1).build(),
    )
}

fn user() -> Definition {
    Definition::record(
        "User",
        NamedType::record()
            .field("id", NamedType::Long, 1)
            .field("name", NamedType::String, 2)
            .nullable_field("email", NamedType::String, 3)
            .build(),
    )
}

fn ordered() -> Arc<dyn Serializer> {
    Arc::new(OrderedSerializer::new(Arc::new(Storage::new())))
}

/// 注册 `users.get`（id 为 404 时返回 NotFound("x")）与 `users.rename`。
fn users_server(transport: Arc<MemoryTransport>, serializer: Arc<dyn Serializer>) -> Server {
    let server = Server::new("users", transport, serializer).unwrap();
    server.record(user_id()).unwrap();
    server.record(user()).unwrap();
    server
        .method("get", "UserId", "User", |ctx| {
            Box::pin(async move {
                let id = ctx.body().get("id").and_then(Value::as_i64).unwrap_or_default();
                if id == 404 {
                    return Err(RpcError::NotFound("x".into()));
                }
                ctx.respond(Value::record([
                    ("id", Value::Long(id)),
                    ("name", Value::from(format!("user-{id}"))),
                    ("email", Value::Null),
                ]));
                Ok(())
            })
        })
        .unwrap();
    server
        .method("rename", "User", "User", |ctx| {
            Box::pin(async move {
                let mut body = ctx.take_body();
                if let Value::Map(fields) = &mut body {
                    fields.insert("name".into(), Value::from("renamed"));
                }
                ctx.respond(body);
                Ok(())
            })
        })
        .unwrap();
    server
}

fn schema_counter(count: Arc<AtomicUsize>) -> Arc<dyn Middleware<Context, ()>> {
    middleware_fn::<Context, (), _>(move |ctx, next| {
        if ctx.method() == Some(SCHEMA_METHOD) {
            count.fetch_add(1, Ordering::SeqCst);
        }
        Box::pin(async move { next.run(ctx).await })
    })
}

fn id(n: i64) -> Value {
    Value::record([("id", Value::Long(n))])
}

#[tokio::test]
async fn schema_is_fetched_once_per_target() {
    let transport = Arc::new(MemoryTransport::default());
    let server = users_server(transport.clone(), ordered());
    let fetches = Arc::new(AtomicUsize::new(0));
    server.use_middleware(schema_counter(fetches.clone())).unwrap();
    server.start().await.unwrap();

    let client = Client::new("web", transport.clone()).unwrap();
    let (a, b) = tokio::join!(
        client.call("users", "get", id(1), None),
        client.call("users", "get", id(2), None)
    );
    assert_eq!(a.unwrap().get("name"), Some(&Value::from("user-1")));
    assert_eq!(b.unwrap().get("name"), Some(&Value::from("user-2")));
    assert_eq!(fetches.load(Ordering::SeqCst), 1, "并发首次调用只应拉取一次 Schema");

    let renamed = client
        .call(
            "users",
            "rename",
            Value::record([
                ("id", Value::Long(3)),
                ("name", Value::from("old")),
                ("email", Value::from("a@b.c")),
            ]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(renamed.get("name"), Some(&Value::from("renamed")));
    assert_eq!(renamed.get("email"), Some(&Value::from("a@b.c")));
    assert_eq!(fetches.load(Ordering::SeqCst), 1, "其他方法不应再次拉取");
    assert!(client.is_resolved("users"));
}

#[tokio::test]
async fn handler_errors_are_rebuilt_on_the_client() {
    let transport = Arc::new(MemoryTransport::default());
    let server = users_server(transport.clone(), ordered());
    server.start().await.unwrap();

    let client = Client::new("web", transport).unwrap();
    let err = client.call("users", "get", id(404), None).await.unwrap_err();
    assert_eq!(err, RpcError::NotFound("x".into()));
    assert_eq!(err.code(), codes::NOT_FOUND);
    assert_eq!(err.message(), "x");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn unknown_methods_fail_on_both_sides() {
    let transport = Arc::new(MemoryTransport::default());
    let server = users_server(transport.clone(), ordered());
    server.start().await.unwrap();

    let client = Client::new("web", transport.clone()).unwrap();
    let err = client.call("users", "delete", id(1), None).await.unwrap_err();
    assert_eq!(err.code(), codes::BAD_REQUEST);
    assert!(err.message().contains("delete"));

    let reply = transport
        .send_request(
            &rpc_subject("users"),
            Packet::default().with_header(headers::METHOD, "delete"),
        )
        .await
        .unwrap();
    assert_eq!(
        reply.header(headers::ERROR),
        Some(codes::HANDLER_UNIMPLEMENTED)
    );
    assert!(reply.body.is_empty(), "错误响应不携带响应体");

    let reply = transport
        .send_request(&rpc_subject("users"), Packet::default())
        .await
        .unwrap();
    assert_eq!(
        reply.header(headers::ERROR),
        Some(codes::HANDLER_UNIMPLEMENTED),
        "缺少 method 头部同样视为未实现"
    );
}

#[tokio::test]
async fn undecodable_request_is_a_bad_request() {
    let transport = Arc::new(MemoryTransport::default());
    let server = users_server(transport.clone(), ordered());
    server.start().await.unwrap();

    let reply = transport
        .send_request(
            &rpc_subject("users"),
            Packet::new(Default::default(), vec![0xff; 3].into())
                .with_header(headers::METHOD, "get"),
        )
        .await
        .unwrap();
    assert_eq!(reply.header(headers::ERROR), Some(codes::BAD_REQUEST));
}

#[tokio::test]
async fn fire_and_forget_requests_run_without_a_reply() {
    let transport = Arc::new(MemoryTransport::default());
    let server = Server::new("audit", transport.clone(), ordered()).unwrap();
    server.record(user_id()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .method("track", "UserId", "UserId", move |ctx| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ctx.body().clone());
                let body = ctx.take_body();
                ctx.respond(body);
                Ok(())
            })
        })
        .unwrap();
    server.start().await.unwrap();

    let client = Client::new("web", transport.clone()).unwrap();
    let metrics = Arc::new(CallMetrics::new());
    client.use_interceptor(Arc::new(MetricsMiddleware::new(metrics.clone())));
    client.notify("audit", "track", id(9), None).await.unwrap();
    let sent = metrics.get("audit.track").expect("即发即弃同样经过拦截器链");
    assert_eq!((sent.calls, sent.failures), (1, 0));

    let seen = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("处理器应在超时前执行")
        .expect("通道不应关闭");
    assert_eq!(seen, id(9));
    assert_eq!(transport.pending_requests(), 0);
}

#[tokio::test]
async fn registration_is_closed_after_start() {
    let transport = Arc::new(MemoryTransport::default());
    let server = users_server(transport, ordered());
    server.start().await.unwrap();
    assert!(server.is_started());

    assert_eq!(server.start().await.unwrap_err().code(), codes::CONFIG);
    assert_eq!(server.record(user()).unwrap_err().code(), codes::CONFIG);
    let err = server
        .method("late", "User", "User", |ctx| {
            Box::pin(async move {
                ctx.respond(Value::Null);
                Ok(())
            })
        })
        .unwrap_err();
    assert_eq!(err.code(), codes::CONFIG);
    let err = server
        .use_middleware(Arc::new(LoggingMiddleware::default()))
        .unwrap_err();
    assert_eq!(err.code(), codes::CONFIG);
}

#[tokio::test]
async fn slow_handlers_time_out_at_the_transport() {
    let transport = Arc::new(MemoryTransport::new(Duration::from_millis(50)));
    let server = Server::new("slow", transport.clone(), ordered()).unwrap();
    server.record(user_id()).unwrap();
    server
        .method("wait", "UserId", "UserId", |ctx| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let body = ctx.take_body();
                ctx.respond(body);
                Ok(())
            })
        })
        .unwrap();
    server.start().await.unwrap();

    let client = Client::new("web", transport).unwrap();
    let err = client.call("slow", "wait", id(1), None).await.unwrap_err();
    assert_eq!(err.code(), codes::REQUEST_TIMEOUT);
    assert!(err.is_retryable(), "超时是唯一可安全重试的错误");
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct UserId {
    id: i64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct User {
    id: i64,
    name: String,
    email: Option<String>,
}

#[tokio::test]
async fn typed_calls_over_the_generic_codec() {
    let transport = Arc::new(MemoryTransport::default());
    let serializer: Arc<dyn Serializer> =
        Arc::new(GenericSerializer::new(Arc::new(Storage::new())));
    let server = users_server(transport.clone(), serializer);
    server.start().await.unwrap();

    let client = Client::new("web", transport).unwrap();
    let user: User = client
        .call_typed("users", "get", &UserId { id: 5 }, None)
        .await
        .unwrap();
    assert_eq!(
        user,
        User {
            id: 5,
            name: "user-5".into(),
            email: None,
        }
    );
    assert_eq!(
        client.schema("users").map(|doc| doc.serializer),
        Some("generic".to_owned()),
        "Client 应采用服务端声明的编解码器"
    );
}

#[tokio::test]
async fn middlewares_and_interceptors_wrap_every_call() {
    let transport = Arc::new(MemoryTransport::default());
    let server = users_server(transport.clone(), ordered());
    let metrics = Arc::new(CallMetrics::new());
    server
        .use_middleware(Arc::new(MetricsMiddleware::new(metrics.clone())))
        .unwrap();
    server
        .use_middleware(Arc::new(LoggingMiddleware::labeled("server")))
        .unwrap();
    server.start().await.unwrap();

    let client = Client::new("web", transport).unwrap();
    client.use_interceptor(Arc::new(LoggingMiddleware::labeled("client")));
    let stamped = Arc::new(AtomicUsize::new(0));
    let counter = stamped.clone();
    client.use_interceptor(middleware_fn::<Context, Value, _>(move |ctx, next| {
        counter.fetch_add(1, Ordering::SeqCst);
        ctx.packet_mut()
            .header
            .insert("x-request-id".into(), "r-1".into());
        Box::pin(async move {
            let mut body = next.run(ctx).await?;
            if let Value::Map(fields) = &mut body {
                fields.insert("intercepted".into(), Value::Boolean(true));
            }
            Ok(body)
        })
    }));

    let body = client.call("users", "get", id(1), None).await.unwrap();
    assert_eq!(body.get("intercepted"), Some(&Value::Boolean(true)));
    let _ = client.call("users", "get", id(404), None).await.unwrap_err();
    assert_eq!(stamped.load(Ordering::SeqCst), 2);

    let get = metrics.get("users.get").expect("应统计 users.get");
    assert_eq!((get.calls, get.failures), (2, 1));
    let schema = metrics
        .get(&format!("users.{SCHEMA_METHOD}"))
        .expect("保留方法同样经过全局中间件");
    assert_eq!(schema.calls, 1);
}

fn open_vault(ctx: &mut Context) -> BoxFuture<'_, spark_rpc_core::Result<()>> {
    Box::pin(async move {
        let identity = ctx.get_extra::<String>("identity", true)?.cloned();
        if identity.as_deref() != Some("admin") {
            return Err(RpcError::Forbidden("admins only".into()));
        }
        let body = ctx.take_body();
        ctx.respond(body);
        Ok(())
    })
}

#[tokio::test]
async fn per_method_middlewares_guard_the_handler() {
    let transport = Arc::new(MemoryTransport::default());
    let server = Server::new("vault", transport.clone(), ordered()).unwrap();
    server.record(user_id()).unwrap();

    let require_token = middleware_fn::<Context, (), _>(|ctx, next| {
        Box::pin(async move {
            let Some(token) = ctx.header("x-token").map(str::to_owned) else {
                return Err(RpcError::Unauthorized("missing token".into()));
            };
            ctx.set_extra("identity", token);
            next.run(ctx).await
        })
    });
    server
        .handle(
            "open",
            "UserId",
            "UserId",
            vec![require_token],
            Arc::new(open_vault),
        )
        .unwrap();
    server.start().await.unwrap();

    let client = Client::new("web", transport).unwrap();
    let err = client.call("vault", "open", id(1), None).await.unwrap_err();
    assert_eq!(err.code(), codes::UNAUTHORIZED);

    client.use_interceptor(middleware_fn::<Context, Value, _>(|ctx, next| {
        ctx.packet_mut()
            .header
            .insert("x-token".into(), "guest".into());
        Box::pin(async move { next.run(ctx).await })
    }));
    let err = client.call("vault", "open", id(1), None).await.unwrap_err();
    assert_eq!(err, RpcError::Forbidden("admins only".into()));
}
