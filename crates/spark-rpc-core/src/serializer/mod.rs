//! 序列化引擎：具名类型与二进制线上形式之间的转换。
//!
//! # 教案式概览
//! - **意图（Why）**：Server 与 Client 都只持有 `Arc<dyn Serializer>`，具体实现由配置在启动期选定，
//!   协议层从不关心底层格式。
//! - **结构（How）**：
//!   - [`OrderedSerializer`]：按字段序号布局的二进制编码，是默认实现；
//!   - [`GenericSerializer`]：自描述的 MessagePack 编码，Storage 仅作为名称校验闸门；
//!   - [`create_serializer`]：按配置标签构造实现，未知标签返回 [`RpcError::Config`]。
//! - **契约（What）**：每个实现绑定且只绑定一个 [`Storage`]；未注册的类型名在编解码时返回
//!   [`RpcError::Serializer`]。

mod generic;
mod ordered;
mod wire;

use std::sync::Arc;

use bytes::Bytes;

pub use generic::GenericSerializer;
pub use ordered::OrderedSerializer;

use crate::config::SerializerConfig;
use crate::error::{Result, RpcError};
use crate::observability::{SpanGuard, TagValue, traced};
use crate::schema::{Definition, Storage};
use crate::value::Value;

/// 编解码器契约。
///
/// # 契约说明（What）
/// - `record`/`record_all`：委托给 [`Storage::add`]/[`Storage::add_all`]，返回规范名称；编译缓存在首次编解码时惰性填充；
/// - `encode`/`decode`：名称未注册或值与类型不符时返回 [`RpcError::Serializer`]；
/// - `encode_for`/`decode_for`：语义同上，额外在 `span` 之下开启名为 `stage` 的子 Span，
///   `span` 为 `None` 时不产生任何追踪数据。
pub trait Serializer: Send + Sync + 'static {
    /// 配置标签，同时写入 Schema 文档的 `serializer` 字段。
    fn kind(&self) -> &'static str;

    fn storage(&self) -> &Arc<Storage>;

    fn record(&self, definition: Definition) -> Result<String> {
        self.storage().add(definition)
    }

    /// 成组注册，任一失败则整组不生效；见 [`Storage::add_all`]。
    fn record_all(&self, definitions: Vec<Definition>) -> Result<Vec<String>> {
        self.storage().add_all(definitions)
    }

    fn encode(&self, name: &str, value: &Value) -> Result<Bytes>;

    fn decode(&self, name: &str, buffer: &[u8]) -> Result<Value>;

    fn encode_for(
        &self,
        stage: &str,
        name: &str,
        value: &Value,
        span: Option<&SpanGuard>,
    ) -> Result<Bytes> {
        traced(span, stage, stage_tags(self.kind(), name, "encode"), || {
            self.encode(name, value)
        })
    }

    fn decode_for(
        &self,
        stage: &str,
        name: &str,
        buffer: &[u8],
        span: Option<&SpanGuard>,
    ) -> Result<Value> {
        traced(span, stage, stage_tags(self.kind(), name, "decode"), || {
            self.decode(name, buffer)
        })
    }
}

fn stage_tags(kind: &str, name: &str, direction: &str) -> Vec<(String, TagValue)> {
    vec![
        ("serializer".to_owned(), TagValue::from(kind)),
        ("type".to_owned(), TagValue::from(name)),
        ("direction".to_owned(), TagValue::from(direction)),
    ]
}

/// 依据配置构造编解码器。
pub fn create_serializer(
    config: &SerializerConfig,
    storage: Arc<Storage>,
) -> Result<Arc<dyn Serializer>> {
    match config.kind.trim() {
        OrderedSerializer::KIND => Ok(Arc::new(OrderedSerializer::new(storage))),
        GenericSerializer::KIND => Ok(Arc::new(GenericSerializer::new(storage))),
        other => Err(RpcError::Config(format!("unknown serializer kind `{other}`"))),
    }
}
