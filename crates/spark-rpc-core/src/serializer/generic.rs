use std::sync::Arc;

use bytes::Bytes;

use super::Serializer;
use crate::error::{Result, RpcError};
use crate::schema::Storage;
use crate::value::Value;

/// 基于 MessagePack 的通用编解码器。
///
/// 值以自描述形式编码，字段名随数据一起传输；Storage 只用于确认类型名已注册，
/// 不参与布局。整数在解码后统一为 `Long`，调用方应通过 [`Value::as_i64`] 读取。
#[derive(Debug)]
pub struct GenericSerializer {
    storage: Arc<Storage>,
}

impl GenericSerializer {
    pub const KIND: &'static str = "generic";

    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    fn ensure_known(&self, name: &str) -> Result<()> {
        if self.storage.has(name) {
            Ok(())
        } else {
            Err(RpcError::Serializer(format!("type `{name}` is not registered")))
        }
    }
}

impl Serializer for GenericSerializer {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn encode(&self, name: &str, value: &Value) -> Result<Bytes> {
        self.ensure_known(name)?;
        Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
    }

    fn decode(&self, name: &str, buffer: &[u8]) -> Result<Value> {
        self.ensure_known(name)?;
        Ok(rmp_serde::from_slice(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::schema::{Definition, NamedType};

    #[test]
    fn storage_gates_but_does_not_shape() {
        let codec = GenericSerializer::new(Arc::new(Storage::new()));
        let err = codec.encode("Anything", &Value::Null).unwrap_err();
        assert_eq!(err.code(), codes::SERIALIZER);

        codec
            .record(Definition::record(
                "Loose",
                NamedType::record().field("id", NamedType::Long, 1).build(),
            ))
            .unwrap();

        // 通用编解码器不按 Schema 校验字段。
        let value = Value::record([
            ("id", Value::Long(7)),
            ("note", Value::from("extra")),
            ("blob", Value::Bytes(vec![1, 2, 3])),
        ]);
        let bytes = codec.encode("Loose", &value).unwrap();
        let decoded = codec.decode("Loose", &bytes).unwrap();
        assert_eq!(decoded.get("id").and_then(Value::as_i64), Some(7));
        assert_eq!(decoded.get("note").and_then(Value::as_str), Some("extra"));
        assert_eq!(
            decoded.get("blob").and_then(Value::as_bytes),
            Some(&[1u8, 2, 3][..])
        );
    }

    #[test]
    fn garbage_is_a_serializer_error() {
        let storage = Arc::new(Storage::new());
        storage
            .add(Definition::record("T", NamedType::record().build()))
            .unwrap();
        let codec = GenericSerializer::new(storage);
        let err = codec.decode("T", &[0xc1]).unwrap_err();
        assert_eq!(err.code(), codes::SERIALIZER);
    }
}
