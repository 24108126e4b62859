//! 跨线追踪：Client 注入、Server 提取，父子关系在一次往返中保持。

use std::sync::Arc;

use spark_rpc::{Client, Server};
use spark_rpc_core::test_stubs::RecordingTracer;
use spark_rpc_core::{
    Definition, NamedType, OrderedSerializer, RpcError, Serializer, Storage, TagValue, Value,
    codes,
};
use spark_transport_memory::MemoryTransport;
use tracing_test::traced_test;

fn echo_server(transport: Arc<MemoryTransport>, tracer: &RecordingTracer) -> Server {
    let serializer: Arc<dyn Serializer> =
        Arc::new(OrderedSerializer::new(Arc::new(Storage::new())));
    let server = Server::new("echo", transport, serializer)
        .unwrap()
        .with_tracer(tracer.shared());
    server
        .record(Definition::record(
            "Ping",
            NamedType::record().field("seq", NamedType::Long, 1).build(),
        ))
        .unwrap();
    server
        .method("ping", "Ping", "Ping", |ctx| {
            Box::pin(async move {
                let seq = ctx.body().get("seq").and_then(Value::as_i64).unwrap_or_default();
                if seq < 0 {
                    return Err(RpcError::NotFound(format!("sequence {seq}")));
                }
                ctx.respond(Value::record([("seq", Value::Long(seq + 1))]));
                Ok(())
            })
        })
        .unwrap();
    server
}

fn ping(seq: i64) -> Value {
    Value::record([("seq", Value::Long(seq))])
}

#[tokio::test]
async fn server_spans_continue_the_client_trace() {
    let tracer = RecordingTracer::new();
    let transport = Arc::new(MemoryTransport::default());
    echo_server(transport.clone(), &tracer).start().await.unwrap();
    let client = Client::new("web", transport)
        .unwrap()
        .with_tracer(tracer.shared());

    let root = tracer.root("request");
    let reply = client.call("echo", "ping", ping(1), Some(&root)).await.unwrap();
    assert_eq!(reply.get("seq"), Some(&Value::Long(2)));
    let root_context = root.context();
    drop(root);

    let client_span = tracer.find("rpc.client echo.ping").expect("应记录客户端 Span");
    let server_span = tracer.find("rpc.server echo.ping").expect("应记录服务端 Span");
    assert_eq!(client_span.parent, Some(root_context));
    assert_eq!(
        server_span.parent,
        Some(client_span.context),
        "服务端根 Span 应是客户端 Span 的子 Span"
    );
    assert_eq!(server_span.context.trace_id, root_context.trace_id);
    assert_eq!(
        server_span.tag("rpc.method"),
        Some(&TagValue::from("ping"))
    );

    let names = tracer.names();
    for stage in [
        "method_request",
        "method_handler",
        "method_response",
        "transport_request",
    ] {
        assert!(names.iter().any(|name| name == stage), "缺少阶段 Span `{stage}`: {names:?}");
    }
    assert!(
        tracer.finished().iter().all(|span| !span.has_tag("error")),
        "成功调用不应带有错误标签"
    );
}

#[tokio::test]
async fn failures_are_tagged_on_both_sides() {
    let tracer = RecordingTracer::new();
    let transport = Arc::new(MemoryTransport::default());
    echo_server(transport.clone(), &tracer).start().await.unwrap();
    let client = Client::new("web", transport)
        .unwrap()
        .with_tracer(tracer.shared());

    let err = client.call("echo", "ping", ping(-1), None).await.unwrap_err();
    assert_eq!(err.code(), codes::NOT_FOUND);

    let server_span = tracer.find("rpc.server echo.ping").unwrap();
    assert_eq!(
        server_span.tag("error.code"),
        Some(&TagValue::from(codes::NOT_FOUND))
    );
    let handler_span = tracer.find("method_handler").unwrap();
    assert!(handler_span.has_tag("error"));
    let client_span = tracer.find("rpc.client echo.ping").unwrap();
    assert_eq!(
        client_span.tag("error.message"),
        Some(&TagValue::from("sequence -1"))
    );
    assert_eq!(client_span.parent, None, "未提供父 Span 时开启新的 Trace");
}

#[tokio::test]
#[traced_test]
async fn schema_fetch_is_traced_and_logged() {
    let tracer = RecordingTracer::new();
    let transport = Arc::new(MemoryTransport::default());
    echo_server(transport.clone(), &tracer).start().await.unwrap();
    let client = Client::new("web", transport)
        .unwrap()
        .with_tracer(tracer.shared());

    let document = client.fetch_schema("echo", None).await.unwrap();
    assert!(document.method("echo", "ping").is_some());
    assert!(logs_contain("schema fetched"));

    let fetch = tracer.find("schema_fetch").expect("应记录 schema_fetch Span");
    let served = tracer
        .find("rpc.server echo.metadata.schema")
        .expect("保留方法同样经过服务端链");
    assert_eq!(served.parent, Some(fetch.context));
}

#[tokio::test]
async fn first_call_fetches_the_schema_inside_the_caller_trace() {
    let tracer = RecordingTracer::new();
    let transport = Arc::new(MemoryTransport::default());
    echo_server(transport.clone(), &tracer).start().await.unwrap();
    let client = Client::new("web", transport)
        .unwrap()
        .with_tracer(tracer.shared());

    let root = tracer.root("request");
    client.call("echo", "ping", ping(1), Some(&root)).await.unwrap();
    let root_context = root.context();
    drop(root);

    let fetch = tracer.find("schema_fetch").expect("首次调用应拉取 Schema");
    assert_eq!(
        fetch.parent,
        Some(root_context),
        "Schema 拉取应归入调用方的 Trace"
    );
    let served = tracer.find("rpc.server echo.metadata.schema").unwrap();
    assert_eq!(served.context.trace_id, root_context.trace_id);

    tracer.clear();
    let root = tracer.root("second");
    client.call("echo", "ping", ping(2), Some(&root)).await.unwrap();
    drop(root);
    assert!(
        tracer.find("schema_fetch").is_none(),
        "已就绪的目标不应再次拉取"
    );
}
