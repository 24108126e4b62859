//! 动态值模型：所有编解码器的输入与输出。
//!
//! # 教案式概览
//! - **意图（Why）**：Client 在运行期才得知远端类型，无法依赖编译期契约，因此解码结果必须是自描述的动态值。
//! - **结构（How）**：记录（record）与映射（map）共享 [`Value::Map`] 表示，字段顺序不体现在值上，
//!   线上布局完全由 Schema 的 `order` 决定。
//! - **契约（What）**：`Serialize`/`Deserialize` 实现保持“最朴素”的数据模型映射，供通用编解码器使用；
//!   [`Value::from_serialize`]/[`Value::deserialize_into`] 经由 `serde_json` 与强类型结构互转。

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::error::{Result, RpcError};

/// 记录/映射的字段集合。
pub type Fields = BTreeMap<String, Value>;

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    String(String),
    /// 自 Unix 纪元起的毫秒数。
    Timestamp(i64),
    Array(Vec<Value>),
    Map(Fields),
}

impl Value {
    /// 以键值对快速构造记录值。
    pub fn record<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Map(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(flag) => Some(*flag),
            _ => None,
        }
    }

    /// 整数视图：`Int`、`Long` 与 `Timestamp` 均可读取。
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(i64::from(*n)),
            Value::Long(n) | Value::Timestamp(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(f64::from(*n)),
            Value::Double(n) => Some(*n),
            Value::Int(n) => Some(f64::from(*n)),
            Value::Long(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Fields> {
        match self {
            Value::Map(fields) => Some(fields),
            _ => None,
        }
    }

    /// 读取记录字段，非记录或字段缺失时返回 `None`。
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.as_map().and_then(|fields| fields.get(field))
    }

    /// 人类可读的类型标签，用于错误消息。
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Bytes(_) => "bytes",
            Value::String(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// 将任意可序列化结构转换为动态值。
    ///
    /// 经由 `serde_json` 中转：整数统一落为 `Long`，浮点落为 `Double`，字节序列落为 `Array`。
    /// 有序编解码器在编码时会按 Schema 做数值收窄，因此这些差异不会影响线上布局。
    pub fn from_serialize<T: serde::Serialize>(value: &T) -> Result<Self> {
        let json = serde_json::to_value(value)
            .map_err(|err| RpcError::Serializer(format!("to value: {err}")))?;
        Ok(Value::from(json))
    }

    /// 将动态值还原为强类型结构。
    pub fn deserialize_into<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        serde_json::from_value(serde_json::Value::from(self))
            .map_err(|err| RpcError::Serializer(format!("from value: {err}")))
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(flag) => Value::Boolean(flag),
            serde_json::Value::Number(number) => match number.as_i64() {
                Some(n) => Value::Long(n),
                None => Value::Double(number.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(text) => Value::String(text),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(flag) => serde_json::Value::Bool(flag),
            Value::Int(n) => serde_json::Value::from(n),
            Value::Long(n) | Value::Timestamp(n) => serde_json::Value::from(n),
            Value::Float(n) => serde_json::Value::from(f64::from(n)),
            Value::Double(n) => serde_json::Value::from(n),
            Value::Bytes(bytes) => serde_json::Value::from(bytes),
            Value::String(text) => serde_json::Value::String(text),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Map(fields) => serde_json::Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Boolean(flag)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::String(text.to_owned())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::String(text)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Fields> for Value {
    fn from(fields: Fields) -> Self {
        Value::Map(fields)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Boolean(flag) => serializer.serialize_bool(*flag),
            Value::Int(n) => serializer.serialize_i32(*n),
            Value::Long(n) | Value::Timestamp(n) => serializer.serialize_i64(*n),
            Value::Float(n) => serializer.serialize_f32(*n),
            Value::Double(n) => serializer.serialize_f64(*n),
            Value::Bytes(bytes) => serializer.serialize_bytes(bytes),
            Value::String(text) => serializer.serialize_str(text),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (key, value) in fields {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any self-describing value")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Value, D::Error> {
        Value::deserialize(d)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Boolean(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::Long(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        i64::try_from(v)
            .map(Value::Long)
            .map_err(|_| E::custom(format!("integer {v} exceeds the long range")))
    }

    fn visit_f32<E: de::Error>(self, v: f32) -> std::result::Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::Double(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::String(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<Value, E> {
        Ok(Value::Bytes(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Value, A::Error> {
        let mut fields = Fields::new();
        while let Some((key, value)) = map.next_entry::<String, Value>()? {
            fields.insert(key, value);
        }
        Ok(Value::Map(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct User {
        name: String,
        age: i32,
        tags: Vec<String>,
    }

    #[test]
    fn typed_structs_convert_through_value() {
        let user = User {
            name: "ada".into(),
            age: 36,
            tags: vec!["admin".into()],
        };
        let value = Value::from_serialize(&user).expect("序列化为动态值");
        assert_eq!(value.get("name").and_then(Value::as_str), Some("ada"));
        assert_eq!(value.get("age").and_then(Value::as_i64), Some(36));

        let back: User = value.deserialize_into().expect("还原为结构体");
        assert_eq!(back, user);
    }

    #[test]
    fn int_and_long_share_integer_view() {
        assert_eq!(Value::Int(7).as_i64(), Some(7));
        assert_eq!(Value::Long(7).as_i64(), Some(7));
        assert_eq!(Value::Timestamp(7).as_i64(), Some(7));
        assert_eq!(Value::String("7".into()).as_i64(), None);
    }
}
