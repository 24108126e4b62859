//! Schema 文档：保留方法 `metadata.schema` 的响应体。
//!
//! # 教案式说明
//! - **意图（Why）**：Client 在首次调用某个目标服务前并不知道其类型目录，Server 必须能以与协商编码无关的
//!   形式整体下发 Schema，Client 据此重建私有的 Storage 与编解码器。
//! - **契约（What）**：
//!   - 文档以 JSON 编码，字段为 `transporter`、`serializer`、`types`、`methods`；
//!   - `methods` 的键为 `<service>.<name>`，值给出请求/响应类型名与可选描述；
//!   - 保留方法本身不出现在 `methods` 中，它始终存在。

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use spark_rpc_core::{NamedType, Result, RpcError};

/// 保留的 Schema 查询方法名。
pub const SCHEMA_METHOD: &str = "metadata.schema";

/// 单个方法的请求/响应类型。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSchema {
    pub request: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    pub transporter: String,
    pub serializer: String,
    #[serde(default)]
    pub types: BTreeMap<String, NamedType>,
    #[serde(default)]
    pub methods: BTreeMap<String, MethodSchema>,
}

impl SchemaDocument {
    /// 方法表的键。
    pub fn method_key(service: &str, method: &str) -> String {
        format!("{service}.{method}")
    }

    pub fn method(&self, service: &str, method: &str) -> Option<&MethodSchema> {
        self.methods.get(&Self::method_key(service, method))
    }

    pub fn to_json(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| RpcError::Serializer(format!("schema document: {err}")))
    }

    /// 解析对端下发的文档，格式错误视为 [`RpcError::BadResponse`]。
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|err| RpcError::BadResponse(format!("malformed schema document: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_rpc_core::codes;

    #[test]
    fn document_json_shape() {
        let mut doc = SchemaDocument {
            transporter: "memory".into(),
            serializer: "ordered".into(),
            ..SchemaDocument::default()
        };
        doc.types.insert(
            "User".into(),
            NamedType::record().field("id", NamedType::Long, 1).build(),
        );
        doc.methods.insert(
            SchemaDocument::method_key("users", "get"),
            MethodSchema {
                request: "User".into(),
                response: "User".into(),
                description: None,
            },
        );

        let json: serde_json::Value = serde_json::from_slice(&doc.to_json().unwrap()).unwrap();
        assert_eq!(json["serializer"], "ordered");
        assert_eq!(json["types"]["User"]["type"], "record");
        assert_eq!(json["methods"]["users.get"]["request"], "User");
        assert!(
            json["methods"]["users.get"].get("description").is_none(),
            "空描述不应出现在文档中"
        );

        let parsed = SchemaDocument::from_json(&doc.to_json().unwrap()).unwrap();
        assert_eq!(parsed, doc);
        assert!(parsed.method("users", "get").is_some());
        assert!(parsed.method("users", "list").is_none());
    }

    #[test]
    fn garbage_is_a_bad_response() {
        let err = SchemaDocument::from_json(b"\x00not json").unwrap_err();
        assert_eq!(err.code(), codes::BAD_RESPONSE);
    }
}
