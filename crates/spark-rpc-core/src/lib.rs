#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-rpc-core: 自描述 Schema、序列化引擎、中间件编排与请求上下文的核心契约。"]
#![doc = ""]
#![doc = "== 分层 =="]
#![doc = "1. `schema`：具名类型与注册表，是其余模块的共同基础。"]
#![doc = "2. `serializer`：按字段序号布局的二进制编码与通用编码。"]
#![doc = "3. `pipeline`：Server 方法链与 Client 拦截器链共用的洋葱式编排。"]
#![doc = "4. `context`/`packet`/`transport`/`observability`：请求生命周期、线上形态与外部协作者契约。"]

pub mod config;
pub mod context;
pub mod error;
pub mod future;
pub mod observability;
pub mod packet;
pub mod pipeline;
pub mod schema;
pub mod serializer;
/// 测试桩命名空间，集中暴露可断言的追踪记录器与不可达传输层，供各 crate 的测试复用。
pub mod test_stubs;
pub mod transport;
pub mod value;

pub use async_trait::async_trait;
pub use config::{BrokerConfig, SerializerConfig, TransportConfig};
pub use context::{Context, ContextTemplate, Response};
pub use error::{FieldViolation, Result, RpcError, Violation, codes};
pub use future::BoxFuture;
pub use observability::{
    NoopTracer, Span, SpanContext, SpanGuard, SpanOptions, TagValue, Tracer, traced,
    traced_async,
};
pub use packet::{Header, Packet, headers, normalize_header_name, rpc_subject};
pub use pipeline::{Composed, Middleware, Next, compose, middleware_fn};
pub use schema::{
    Definition, FieldDef, NamedType, Record, RecordBuilder, RecordDefinition, Storage,
    TypedDefinition,
};
pub use serializer::{GenericSerializer, OrderedSerializer, Serializer, create_serializer};
pub use transport::{PacketHandler, Transporter};
pub use value::{Fields, Value};
