//! 按字段序号布局的二进制编解码器。
//!
//! # 教案式概览
//! - **意图（Why）**：两个服务各自声明的记录只要字段序号兼容，就必须能互相解码；
//!   因此线上布局只由 `order` 决定，字段名不出现在字节流中。
//! - **结构（How）**：首次使用某个类型名时，把 [`NamedType`] 编译为 [`Wire`] 计划并缓存；
//!   指针被编译为对目标名称的引用，目标计划同样只编译一次，递归类型因此天然受支持。
//! - **契约（What）**：
//!   - 可空字段等价于 `union[null, T]`，缺失或为 `null` 时写入分支 0；
//!   - 联合类型选择第一个与值相容的分支；
//!   - 解码要求恰好消耗全部输入，并限制嵌套深度以抵御恶意输入。

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;

use super::Serializer;
use super::wire;
use crate::error::{Result, RpcError};
use crate::schema::{NamedType, Storage};
use crate::value::{Fields, Value};

/// 编解码的最大嵌套深度。
const MAX_DEPTH: usize = 64;

/// 元素零宽度时（如 `array<null>`）单个数据块允许的最大条目数。
const MAX_ZERO_WIDTH_ITEMS: usize = 1 << 16;

/// 编译后的线上计划。
#[derive(Clone, Debug, PartialEq)]
enum Wire {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    String,
    Timestamp,
    Enum(Vec<String>),
    Record(Vec<WireField>),
    Array(Box<Wire>),
    Map(Box<Wire>),
    Union(Vec<Wire>),
    Ref(String),
}

#[derive(Clone, Debug, PartialEq)]
struct WireField {
    name: String,
    order: u32,
    wire: Wire,
}

impl Wire {
    /// 是否可以直接接受 `null`（不解析引用）。
    fn admits_null(&self) -> bool {
        match self {
            Wire::Null => true,
            Wire::Union(variants) => variants.iter().any(Wire::admits_null),
            _ => false,
        }
    }
}

/// 计划编码后是否恒为零字节：`null`、空记录以及字段全部零宽度的记录。
///
/// 联合、数组与映射至少写入一个计数或分支号，因此不是零宽度；引用沿计划表解析，
/// 超过深度上限时按非零宽度处理。
fn zero_width(plans: &Plans, wire: &Wire, depth: usize) -> bool {
    if depth > MAX_DEPTH {
        return false;
    }
    match wire {
        Wire::Null => true,
        Wire::Record(fields) => fields
            .iter()
            .all(|field| zero_width(plans, &field.wire, depth + 1)),
        Wire::Ref(target) => plans
            .get(target)
            .is_some_and(|plan| zero_width(plans, plan, depth + 1)),
        _ => false,
    }
}

/// 把具名类型编译为计划，并收集其中出现的指针目标。
fn compile(ty: &NamedType, refs: &mut Vec<String>) -> Wire {
    match ty {
        NamedType::Null => Wire::Null,
        NamedType::Boolean => Wire::Boolean,
        NamedType::Int => Wire::Int,
        NamedType::Long => Wire::Long,
        NamedType::Float => Wire::Float,
        NamedType::Double => Wire::Double,
        NamedType::Bytes => Wire::Bytes,
        NamedType::String => Wire::String,
        NamedType::Timestamp => Wire::Timestamp,
        NamedType::Enum { symbols } => Wire::Enum(symbols.clone()),
        NamedType::Record { fields } => {
            let mut compiled: Vec<WireField> = fields
                .iter()
                .map(|(name, field)| {
                    let inner = compile(&field.ty, refs);
                    let wire = if field.nullable {
                        Wire::Union(vec![Wire::Null, inner])
                    } else {
                        inner
                    };
                    WireField {
                        name: name.clone(),
                        order: field.order,
                        wire,
                    }
                })
                .collect();
            compiled.sort_by_key(|field| field.order);
            Wire::Record(compiled)
        }
        NamedType::Array { items } => Wire::Array(Box::new(compile(items, refs))),
        NamedType::Map { values } => Wire::Map(Box::new(compile(values, refs))),
        NamedType::Union { variants } => {
            Wire::Union(variants.iter().map(|variant| compile(variant, refs)).collect())
        }
        NamedType::Pointer { name } => {
            refs.push(name.clone());
            Wire::Ref(name.clone())
        }
    }
}

type Plans = HashMap<String, Arc<Wire>>;

/// 有序二进制编解码器。
///
/// # 教案式说明
/// - **逻辑（How）**：`plans` 以类型名为键缓存编译结果，读路径只持读锁；
///   缺失时在写锁内以工作队列方式编译目标及其传递引用的全部类型。
/// - **契约（What）**：Storage 对已注册名称只追加不修改，因此缓存无需失效。
#[derive(Debug)]
pub struct OrderedSerializer {
    storage: Arc<Storage>,
    plans: RwLock<Plans>,
}

impl OrderedSerializer {
    pub const KIND: &'static str = "ordered";

    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            plans: RwLock::new(HashMap::new()),
        }
    }

    /// 确保 `name` 及其引用的类型都已编译。
    fn ensure_plan(&self, name: &str) -> Result<()> {
        if self.plans.read().contains_key(name) {
            return Ok(());
        }

        let mut plans = self.plans.write();
        let mut pending = vec![name.to_owned()];
        while let Some(next) = pending.pop() {
            if plans.contains_key(&next) {
                continue;
            }
            let ty = self.storage.get(&next).map_err(|_| {
                RpcError::Serializer(format!("type `{next}` is not registered"))
            })?;
            let mut refs = Vec::new();
            let wire = compile(&ty, &mut refs);
            plans.insert(next, Arc::new(wire));
            pending.extend(refs.into_iter().filter(|target| !plans.contains_key(target)));
        }
        Ok(())
    }
}

impl Serializer for OrderedSerializer {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn encode(&self, name: &str, value: &Value) -> Result<Bytes> {
        self.ensure_plan(name)?;
        let plans = self.plans.read();
        let root = lookup(&plans, name)?;
        let mut buf = BytesMut::new();
        Encoder { plans: &plans }.write(&root, value, name, 0, &mut buf)?;
        Ok(buf.freeze())
    }

    fn decode(&self, name: &str, buffer: &[u8]) -> Result<Value> {
        self.ensure_plan(name)?;
        let plans = self.plans.read();
        let root = lookup(&plans, name)?;
        let mut input = buffer;
        let value = Decoder { plans: &plans }.read(&root, &mut input, 0)?;
        if !input.is_empty() {
            return Err(RpcError::Serializer(format!(
                "{} trailing bytes after decoding `{name}`",
                input.len()
            )));
        }
        Ok(value)
    }
}

fn lookup(plans: &Plans, name: &str) -> Result<Arc<Wire>> {
    plans
        .get(name)
        .cloned()
        .ok_or_else(|| RpcError::Serializer(format!("type `{name}` is not registered")))
}

fn too_deep(path: &str) -> RpcError {
    RpcError::Serializer(format!("{path}: nesting exceeds {MAX_DEPTH} levels"))
}

fn mismatch(path: &str, expected: &str, value: &Value) -> RpcError {
    RpcError::Serializer(format!(
        "{path}: expected {expected}, got {}",
        value.kind()
    ))
}

struct Encoder<'p> {
    plans: &'p Plans,
}

impl Encoder<'_> {
    fn write(
        &self,
        wire: &Wire,
        value: &Value,
        path: &str,
        depth: usize,
        buf: &mut BytesMut,
    ) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(too_deep(path));
        }
        match wire {
            Wire::Null => match value {
                Value::Null => Ok(()),
                other => Err(mismatch(path, "null", other)),
            },
            Wire::Boolean => match value {
                Value::Boolean(flag) => {
                    wire::put_bool(buf, *flag);
                    Ok(())
                }
                other => Err(mismatch(path, "boolean", other)),
            },
            Wire::Int => match value {
                Value::Int(n) => {
                    wire::put_long(buf, i64::from(*n));
                    Ok(())
                }
                Value::Long(n) => {
                    let n = i32::try_from(*n).map_err(|_| {
                        RpcError::Serializer(format!("{path}: {n} is out of the int range"))
                    })?;
                    wire::put_long(buf, i64::from(n));
                    Ok(())
                }
                other => Err(mismatch(path, "int", other)),
            },
            Wire::Long => match value {
                Value::Int(n) => {
                    wire::put_long(buf, i64::from(*n));
                    Ok(())
                }
                Value::Long(n) => {
                    wire::put_long(buf, *n);
                    Ok(())
                }
                other => Err(mismatch(path, "long", other)),
            },
            Wire::Timestamp => match value {
                Value::Timestamp(n) | Value::Long(n) => {
                    wire::put_long(buf, *n);
                    Ok(())
                }
                Value::Int(n) => {
                    wire::put_long(buf, i64::from(*n));
                    Ok(())
                }
                other => Err(mismatch(path, "timestamp", other)),
            },
            Wire::Float => match value.as_f64() {
                Some(n) => {
                    wire::put_f32(buf, n as f32);
                    Ok(())
                }
                None => Err(mismatch(path, "float", value)),
            },
            Wire::Double => match value.as_f64() {
                Some(n) => {
                    wire::put_f64(buf, n);
                    Ok(())
                }
                None => Err(mismatch(path, "double", value)),
            },
            Wire::Bytes => match value {
                Value::Bytes(bytes) => {
                    wire::put_bytes(buf, bytes);
                    Ok(())
                }
                // 经由 serde 转换的 `Vec<u8>` 会落为整数数组。
                Value::Array(items) => {
                    let bytes = items
                        .iter()
                        .map(|item| item.as_i64().and_then(|n| u8::try_from(n).ok()))
                        .collect::<Option<Vec<u8>>>()
                        .ok_or_else(|| mismatch(path, "bytes", value))?;
                    wire::put_bytes(buf, &bytes);
                    Ok(())
                }
                other => Err(mismatch(path, "bytes", other)),
            },
            Wire::String => match value {
                Value::String(text) => {
                    wire::put_bytes(buf, text.as_bytes());
                    Ok(())
                }
                other => Err(mismatch(path, "string", other)),
            },
            Wire::Enum(symbols) => {
                let symbol = value.as_str().ok_or_else(|| mismatch(path, "enum", value))?;
                let index = symbols
                    .iter()
                    .position(|candidate| candidate == symbol)
                    .ok_or_else(|| {
                        RpcError::Serializer(format!("{path}: unknown enum symbol `{symbol}`"))
                    })?;
                wire::put_long(buf, index as i64);
                Ok(())
            }
            Wire::Record(fields) => {
                let map = value
                    .as_map()
                    .ok_or_else(|| mismatch(path, "record", value))?;
                for field in fields {
                    let field_path = format!("{path}.{}", field.name);
                    let field_value = map.get(&field.name).unwrap_or(&Value::Null);
                    if field_value.is_null() && !field.wire.admits_null() {
                        return Err(RpcError::Serializer(format!(
                            "{field_path}: missing required field (order {})",
                            field.order
                        )));
                    }
                    self.write(&field.wire, field_value, &field_path, depth + 1, buf)?;
                }
                Ok(())
            }
            Wire::Array(items) => {
                let values = value
                    .as_array()
                    .ok_or_else(|| mismatch(path, "array", value))?;
                if !values.is_empty() {
                    wire::put_long(buf, values.len() as i64);
                    let item_path = format!("{path}[]");
                    for item in values {
                        self.write(items, item, &item_path, depth + 1, buf)?;
                    }
                }
                wire::put_long(buf, 0);
                Ok(())
            }
            Wire::Map(values) => {
                let entries = value.as_map().ok_or_else(|| mismatch(path, "map", value))?;
                if !entries.is_empty() {
                    wire::put_long(buf, entries.len() as i64);
                    for (key, entry) in entries {
                        wire::put_bytes(buf, key.as_bytes());
                        self.write(values, entry, &format!("{path}{{{key}}}"), depth + 1, buf)?;
                    }
                }
                wire::put_long(buf, 0);
                Ok(())
            }
            Wire::Union(variants) => {
                let index = variants
                    .iter()
                    .position(|variant| self.conforms(variant, value, depth + 1))
                    .ok_or_else(|| {
                        RpcError::Serializer(format!(
                            "{path}: {} matches no union branch",
                            value.kind()
                        ))
                    })?;
                wire::put_long(buf, index as i64);
                self.write(&variants[index], value, path, depth + 1, buf)
            }
            Wire::Ref(target) => {
                let plan = lookup(self.plans, target)?;
                self.write(&plan, value, path, depth + 1, buf)
            }
        }
    }

    /// 浅层相容性判断，用于选择联合分支。
    fn conforms(&self, wire: &Wire, value: &Value, depth: usize) -> bool {
        if depth > MAX_DEPTH {
            return false;
        }
        match (wire, value) {
            (Wire::Null, Value::Null) => true,
            (Wire::Boolean, Value::Boolean(_)) => true,
            (Wire::Int, Value::Int(_)) => true,
            (Wire::Int, Value::Long(n)) => i32::try_from(*n).is_ok(),
            (Wire::Long, Value::Int(_) | Value::Long(_)) => true,
            (Wire::Timestamp, Value::Timestamp(_) | Value::Long(_) | Value::Int(_)) => true,
            (Wire::Float | Wire::Double, _) => value.as_f64().is_some(),
            (Wire::Bytes, Value::Bytes(_)) => true,
            (Wire::String, Value::String(_)) => true,
            (Wire::Enum(symbols), Value::String(symbol)) => symbols.contains(symbol),
            (Wire::Record(fields), Value::Map(map)) => fields.iter().all(|field| {
                field.wire.admits_null() || map.get(&field.name).is_some_and(|v| !v.is_null())
            }),
            (Wire::Array(_), Value::Array(_)) => true,
            (Wire::Map(_), Value::Map(_)) => true,
            (Wire::Union(variants), _) => variants
                .iter()
                .any(|variant| self.conforms(variant, value, depth + 1)),
            (Wire::Ref(target), _) => self
                .plans
                .get(target)
                .is_some_and(|plan| self.conforms(plan, value, depth + 1)),
            _ => false,
        }
    }
}

struct Decoder<'p> {
    plans: &'p Plans,
}

impl Decoder<'_> {
    fn read(&self, wire: &Wire, input: &mut &[u8], depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(too_deep("decode"));
        }
        let value = match wire {
            Wire::Null => Value::Null,
            Wire::Boolean => Value::Boolean(wire::get_bool(input)?),
            Wire::Int => Value::Int(wire::get_int(input)?),
            Wire::Long => Value::Long(wire::get_long(input)?),
            Wire::Timestamp => Value::Timestamp(wire::get_long(input)?),
            Wire::Float => Value::Float(wire::get_f32(input)?),
            Wire::Double => Value::Double(wire::get_f64(input)?),
            Wire::Bytes => Value::Bytes(wire::get_bytes(input)?),
            Wire::String => Value::String(wire::get_string(input)?),
            Wire::Enum(symbols) => {
                let index = wire::get_long(input)?;
                let symbol = usize::try_from(index)
                    .ok()
                    .and_then(|index| symbols.get(index))
                    .ok_or_else(|| {
                        RpcError::Serializer(format!("enum index {index} is out of range"))
                    })?;
                Value::String(symbol.clone())
            }
            Wire::Record(fields) => {
                let mut out = Fields::new();
                for field in fields {
                    let value = self.read(&field.wire, input, depth + 1)?;
                    out.insert(field.name.clone(), value);
                }
                Value::Map(out)
            }
            Wire::Array(items) => {
                let items_zero_width = zero_width(self.plans, items, depth + 1);
                let mut out = Vec::new();
                while let Some(count) = self.block_count(input, items_zero_width)? {
                    out.reserve(count);
                    for _ in 0..count {
                        out.push(self.read(items, input, depth + 1)?);
                    }
                }
                Value::Array(out)
            }
            Wire::Map(values) => {
                let mut out = Fields::new();
                // 每个条目至少携带键的长度前缀。
                while let Some(count) = self.block_count(input, false)? {
                    for _ in 0..count {
                        let key = wire::get_string(input)?;
                        let value = self.read(values, input, depth + 1)?;
                        out.insert(key, value);
                    }
                }
                Value::Map(out)
            }
            Wire::Union(variants) => {
                let index = wire::get_long(input)?;
                let variant = usize::try_from(index)
                    .ok()
                    .and_then(|index| variants.get(index))
                    .ok_or_else(|| {
                        RpcError::Serializer(format!("union branch {index} is out of range"))
                    })?;
                self.read(variant, input, depth + 1)?
            }
            Wire::Ref(target) => {
                let plan = lookup(self.plans, target)?;
                self.read(&plan, input, depth + 1)?
            }
        };
        Ok(value)
    }

    /// 读取下一个数据块的条目数，`None` 表示结束标记。
    ///
    /// 负数计数后跟随块字节长度，按条目数读取即可，长度本身被跳过。
    fn block_count(&self, input: &mut &[u8], zero_width: bool) -> Result<Option<usize>> {
        let raw = wire::get_long(input)?;
        if raw == 0 {
            return Ok(None);
        }
        if raw < 0 {
            wire::get_long(input)?;
        }
        let count = usize::try_from(raw.unsigned_abs())
            .map_err(|_| RpcError::Serializer(format!("block count {raw} is too large")))?;
        let limit = if zero_width {
            MAX_ZERO_WIDTH_ITEMS
        } else {
            input.len()
        };
        if count > limit {
            return Err(RpcError::Serializer(format!(
                "block count {count} exceeds the remaining input"
            )));
        }
        Ok(Some(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Definition;
    use proptest::prelude::*;

    fn serializer() -> OrderedSerializer {
        OrderedSerializer::new(Arc::new(Storage::new()))
    }

    #[test]
    fn fields_line_up_by_order_not_by_name() {
        let codec = serializer();
        codec
            .record(Definition::record(
                "A",
                NamedType::record()
                    .field("name", NamedType::String, 1)
                    .field("age", NamedType::Int, 2)
                    .build(),
            ))
            .unwrap();
        codec
            .record(Definition::record(
                "B",
                NamedType::record()
                    .field("number", NamedType::Int, 2)
                    .field("string", NamedType::String, 1)
                    .build(),
            ))
            .unwrap();

        let encoded = codec
            .encode(
                "A",
                &Value::record([("name", Value::from("my name")), ("age", Value::Int(22))]),
            )
            .unwrap();
        let decoded = codec.decode("B", &encoded).unwrap();

        assert_eq!(
            decoded,
            Value::record([("string", Value::from("my name")), ("number", Value::Int(22))])
        );
    }

    #[test]
    fn declaration_order_does_not_change_layout() {
        let codec = serializer();
        codec
            .record(Definition::record(
                "Forward",
                NamedType::record()
                    .field("a", NamedType::Long, 1)
                    .field("b", NamedType::String, 2)
                    .build(),
            ))
            .unwrap();
        let value = Value::record([("a", Value::Long(-3)), ("b", Value::from("x"))]);
        let bytes = codec.encode("Forward", &value).unwrap();
        // order 1 的 long(-3) 在前，随后是 order 2 的字符串。
        assert_eq!(&bytes[..], &[0x05, 0x02, b'x']);
    }

    #[test]
    fn nullable_fields_accept_absence() {
        let codec = serializer();
        codec
            .record(Definition::record(
                "Profile",
                NamedType::record()
                    .field("id", NamedType::Long, 1)
                    .nullable_field("nickname", NamedType::String, 2)
                    .build(),
            ))
            .unwrap();

        let bytes = codec
            .encode("Profile", &Value::record([("id", Value::Long(1))]))
            .unwrap();
        let decoded = codec.decode("Profile", &bytes).unwrap();
        assert_eq!(decoded.get("nickname"), Some(&Value::Null));

        let bytes = codec
            .encode(
                "Profile",
                &Value::record([("id", Value::Long(1)), ("nickname", Value::from("ada"))]),
            )
            .unwrap();
        let decoded = codec.decode("Profile", &bytes).unwrap();
        assert_eq!(decoded.get("nickname").and_then(Value::as_str), Some("ada"));
    }

    #[test]
    fn missing_required_field_is_a_serializer_error() {
        let codec = serializer();
        codec
            .record(Definition::record(
                "Strict",
                NamedType::record().field("id", NamedType::Long, 1).build(),
            ))
            .unwrap();
        let err = codec.encode("Strict", &Value::Map(Fields::new())).unwrap_err();
        assert_eq!(err.code(), crate::error::codes::SERIALIZER);
        assert!(err.message().contains("Strict.id"), "{err}");
    }

    #[test]
    fn unknown_type_is_a_serializer_error() {
        let codec = serializer();
        let err = codec.encode("Ghost", &Value::Null).unwrap_err();
        assert_eq!(err.code(), crate::error::codes::SERIALIZER);
        let err = codec.decode("Ghost", &[]).unwrap_err();
        assert_eq!(err.code(), crate::error::codes::SERIALIZER);
    }

    #[test]
    fn recursive_pointers_compile_once() {
        let codec = serializer();
        codec
            .record(Definition::record(
                "Node",
                NamedType::record()
                    .field("value", NamedType::Int, 1)
                    .nullable_field("next", NamedType::pointer("Node"), 2)
                    .build(),
            ))
            .unwrap();

        let list = Value::record([
            ("value", Value::Int(1)),
            (
                "next",
                Value::record([
                    ("value", Value::Int(2)),
                    ("next", Value::Null),
                ]),
            ),
        ]);
        let bytes = codec.encode("Node", &list).unwrap();
        assert_eq!(codec.decode("Node", &bytes).unwrap(), list);
        assert_eq!(codec.plans.read().len(), 1, "自引用只应编译一次");
    }

    #[test]
    fn shared_targets_are_memoized() {
        let codec = serializer();
        codec
            .record(Definition::record(
                "Address",
                NamedType::record().field("city", NamedType::String, 1).build(),
            ))
            .unwrap();
        codec
            .record(Definition::record(
                "Company",
                NamedType::record()
                    .field("hq", NamedType::pointer("Address"), 1)
                    .field("branches", NamedType::array(NamedType::pointer("Address")), 2)
                    .build(),
            ))
            .unwrap();

        let value = Value::record([
            ("hq", Value::record([("city", Value::from("Oslo"))])),
            (
                "branches",
                Value::Array(vec![Value::record([("city", Value::from("Bergen"))])]),
            ),
        ]);
        let bytes = codec.encode("Company", &value).unwrap();
        assert_eq!(codec.decode("Company", &bytes).unwrap(), value);

        let plans = codec.plans.read();
        assert_eq!(plans.len(), 2);
        assert!(plans.contains_key("Address"));
    }

    #[test]
    fn enums_maps_and_unions() {
        let codec = serializer();
        codec
            .record(Definition::record(
                "Event",
                NamedType::record()
                    .field("level", NamedType::enumeration(["DEBUG", "INFO", "WARN"]), 1)
                    .field("labels", NamedType::map(NamedType::String), 2)
                    .field(
                        "payload",
                        NamedType::union([NamedType::Long, NamedType::String]),
                        3,
                    )
                    .field("at", NamedType::Timestamp, 4)
                    .field("raw", NamedType::Bytes, 5)
                    .field("ratio", NamedType::Double, 6)
                    .field("ok", NamedType::Boolean, 7)
                    .build(),
            ))
            .unwrap();

        let mut labels = Fields::new();
        labels.insert("region".into(), Value::from("eu"));
        let value = Value::record([
            ("level", Value::from("WARN")),
            ("labels", Value::Map(labels)),
            ("payload", Value::from("text")),
            ("at", Value::Timestamp(1_700_000_000_000)),
            ("raw", Value::Bytes(vec![0, 1, 255])),
            ("ratio", Value::Double(0.5)),
            ("ok", Value::Boolean(true)),
        ]);
        let bytes = codec.encode("Event", &value).unwrap();
        assert_eq!(codec.decode("Event", &bytes).unwrap(), value);

        let bad = Value::record([("level", Value::from("TRACE"))]);
        assert!(codec.encode("Event", &bad).is_err());
    }

    #[test]
    fn hostile_input_is_rejected() {
        let codec = serializer();
        codec
            .record(Definition::record(
                "List",
                NamedType::record()
                    .field("items", NamedType::array(NamedType::Long), 1)
                    .build(),
            ))
            .unwrap();

        // 声称 2^40 个元素，但输入只剩几个字节。
        let mut buf = BytesMut::new();
        wire::put_long(&mut buf, 1 << 40);
        assert!(codec.decode("List", &buf).is_err());

        // 合法编码之后多出的字节。
        let mut buf = BytesMut::new();
        wire::put_long(&mut buf, 0);
        buf.extend_from_slice(&[0xff]);
        assert!(codec.decode("List", &buf).is_err());
    }

    #[test]
    fn arrays_of_empty_records_round_trip() {
        let codec = serializer();
        codec
            .record(Definition::record("Empty", NamedType::record().build()))
            .unwrap();
        codec
            .record(Definition::record(
                "Wrapper",
                NamedType::record()
                    .field("inner", NamedType::pointer("Empty"), 1)
                    .field("nothing", NamedType::Null, 2)
                    .build(),
            ))
            .unwrap();
        codec
            .record(Definition::record(
                "Batch",
                NamedType::record()
                    .field("items", NamedType::array(NamedType::pointer("Empty")), 1)
                    .field("wrapped", NamedType::array(NamedType::pointer("Wrapper")), 2)
                    .build(),
            ))
            .unwrap();

        let empty = Value::record(Vec::<(&str, Value)>::new());
        let wrapper = Value::record([("inner", empty.clone()), ("nothing", Value::Null)]);
        let value = Value::record([
            ("items", Value::Array(vec![empty; 5])),
            ("wrapped", Value::Array(vec![wrapper; 7])),
        ]);
        let bytes = codec.encode("Batch", &value).unwrap();
        assert_eq!(bytes.len(), 4, "零宽度元素只占用块计数与结束标记");
        assert_eq!(codec.decode("Batch", &bytes).unwrap(), value);

        // 零宽度元素的条目数仍有上限。
        let mut buf = BytesMut::new();
        wire::put_long(&mut buf, 1 << 40);
        assert!(codec.decode("Batch", &buf).is_err());
    }

    #[test]
    fn union_branches_widen_integers_to_floating_point() {
        let codec = serializer();
        codec
            .record(Definition::record(
                "Reading",
                NamedType::record()
                    .field(
                        "value",
                        NamedType::union([NamedType::Double, NamedType::String]),
                        1,
                    )
                    .build(),
            ))
            .unwrap();

        let bytes = codec
            .encode("Reading", &Value::record([("value", Value::Int(3))]))
            .unwrap();
        assert_eq!(
            codec.decode("Reading", &bytes).unwrap(),
            Value::record([("value", Value::Double(3.0))])
        );
    }

    fn scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::Long),
            ".{0,16}".prop_map(Value::String),
            any::<bool>().prop_map(Value::Boolean),
        ]
    }

    proptest! {
        #[test]
        fn records_survive_encoding(
            id in any::<i64>(),
            name in ".{0,24}",
            tags in proptest::collection::vec(".{0,8}", 0..6),
            extra in proptest::option::of(scalar()),
        ) {
            let codec = serializer();
            codec
                .record(Definition::record(
                    "Item",
                    NamedType::record()
                        .field("id", NamedType::Long, 3)
                        .field("name", NamedType::String, 1)
                        .field("tags", NamedType::array(NamedType::String), 2)
                        .nullable_field(
                            "extra",
                            NamedType::union([NamedType::Long, NamedType::String, NamedType::Boolean]),
                            4,
                        )
                        .build(),
                ))
                .unwrap();

            let value = Value::record([
                ("id", Value::Long(id)),
                ("name", Value::String(name)),
                ("tags", Value::Array(tags.into_iter().map(Value::String).collect())),
                ("extra", extra.unwrap_or(Value::Null)),
            ]);
            let bytes = codec.encode("Item", &value).unwrap();
            prop_assert_eq!(codec.decode("Item", &bytes).unwrap(), value);
        }
    }
}
