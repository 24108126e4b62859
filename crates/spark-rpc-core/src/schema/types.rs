use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 具名类型：Schema 存储中的一个条目。
///
/// # 教案式说明
/// - **意图（Why）**：服务之间不共享编译产物，类型目录必须能以 JSON 形式整体下发，再由对端重建；
/// - **结构（How）**：采用 `{"type": "<tag>", ...}` 的内部标签表示，`record` 字段按名称存放，
///   线上布局只由每个字段的 `order` 决定；
/// - **契约（What）**：`pointer` 必须指向同一 [`Storage`](super::Storage) 中已存在（或正在注册）的名称，
///   该约束由 [`validate`](super::validate) 递归检查。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NamedType {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    String,
    Timestamp,
    Enum {
        symbols: Vec<String>,
    },
    Record {
        fields: BTreeMap<String, FieldDef>,
    },
    Array {
        items: Box<NamedType>,
    },
    Map {
        values: Box<NamedType>,
    },
    Union {
        variants: Vec<NamedType>,
    },
    Pointer {
        name: String,
    },
}

impl NamedType {
    /// 开始构造一个记录类型。
    pub fn record() -> RecordBuilder {
        RecordBuilder::default()
    }

    pub fn array(items: NamedType) -> Self {
        NamedType::Array {
            items: Box::new(items),
        }
    }

    pub fn map(values: NamedType) -> Self {
        NamedType::Map {
            values: Box::new(values),
        }
    }

    pub fn union<I: IntoIterator<Item = NamedType>>(variants: I) -> Self {
        NamedType::Union {
            variants: variants.into_iter().collect(),
        }
    }

    pub fn enumeration<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NamedType::Enum {
            symbols: symbols.into_iter().map(Into::into).collect(),
        }
    }

    pub fn pointer(name: impl Into<String>) -> Self {
        NamedType::Pointer { name: name.into() }
    }

    /// 类型标签，与 JSON 表示中的 `type` 字段一致。
    pub fn tag(&self) -> &'static str {
        match self {
            NamedType::Null => "null",
            NamedType::Boolean => "boolean",
            NamedType::Int => "int",
            NamedType::Long => "long",
            NamedType::Float => "float",
            NamedType::Double => "double",
            NamedType::Bytes => "bytes",
            NamedType::String => "string",
            NamedType::Timestamp => "timestamp",
            NamedType::Enum { .. } => "enum",
            NamedType::Record { .. } => "record",
            NamedType::Array { .. } => "array",
            NamedType::Map { .. } => "map",
            NamedType::Union { .. } => "union",
            NamedType::Pointer { .. } => "pointer",
        }
    }
}

/// 记录中的单个字段定义。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(rename = "type")]
    pub ty: NamedType,
    /// 线上布局序号，记录内唯一且为正。
    pub order: u32,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldDef {
    pub fn new(ty: NamedType, order: u32) -> Self {
        Self {
            ty,
            order,
            nullable: false,
            deprecated: None,
            description: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = Some(true);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// 记录类型的链式构造器。
///
/// 构造器不做任何校验，重复字段名以最后一次为准；序号冲突等问题在注册时由 Storage 报告。
#[derive(Debug, Default)]
pub struct RecordBuilder {
    fields: BTreeMap<String, FieldDef>,
}

impl RecordBuilder {
    pub fn field(self, name: impl Into<String>, ty: NamedType, order: u32) -> Self {
        self.field_def(name, FieldDef::new(ty, order))
    }

    pub fn nullable_field(self, name: impl Into<String>, ty: NamedType, order: u32) -> Self {
        self.field_def(name, FieldDef::new(ty, order).nullable())
    }

    pub fn field_def(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(name.into(), def);
        self
    }

    pub fn build(self) -> NamedType {
        NamedType::Record {
            fields: self.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_form_uses_type_tag() {
        let ty = NamedType::record()
            .field("name", NamedType::String, 1)
            .nullable_field("parent", NamedType::pointer("Node"), 2)
            .build();

        let json = serde_json::to_value(&ty).expect("序列化 Schema");
        assert_eq!(json["type"], "record");
        assert_eq!(json["fields"]["name"]["type"]["type"], "string");
        assert_eq!(json["fields"]["parent"]["nullable"], true);
        assert_eq!(json["fields"]["parent"]["type"]["name"], "Node");

        let back: NamedType = serde_json::from_value(json).expect("反序列化 Schema");
        assert_eq!(back, ty);
    }
}
