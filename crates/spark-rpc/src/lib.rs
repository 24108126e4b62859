#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-rpc: 基于自描述 Schema 的 RPC Server 与 Client。"]
#![doc = ""]
#![doc = "Server 在 `<service>_rpc` 主题上分发请求，并通过保留方法 `metadata.schema` 下发类型目录；"]
#![doc = "Client 在首次调用某个目标时拉取该目录，随后以协商的编解码器收发动态值。"]

pub mod client;
pub mod schema_doc;
pub mod server;
pub mod service;

pub use client::Client;
pub use schema_doc::{MethodSchema, SCHEMA_METHOD, SchemaDocument};
pub use server::Server;
pub use service::{MethodDefinition, MethodHandler, Service};
