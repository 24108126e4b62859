use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::types::NamedType;
use super::validate::{check_name, validate};
use crate::error::{Result, RpcError};

/// 由 Rust 类型自描述的记录，相当于“带注解的类定义”。
///
/// # 教案式说明
/// - **意图（Why）**：让业务结构体直接携带 Schema，适配器（派生宏、代码生成或手写实现）都能经由
///   [`Definition::of`] 调用同一注册入口；
/// - **契约（What）**：同名冲突以 Rust `TypeId` 判定身份，两个不同类型声明同一 `NAME` 即视为冲突，
///   即使它们的结构完全一致。
pub trait Record: 'static {
    /// 注册到 Storage 的规范名称。
    const NAME: &'static str;

    /// 类型结构。
    fn schema() -> NamedType;
}

/// 完整的具名记录定义。
#[derive(Clone, Debug, PartialEq)]
pub struct RecordDefinition {
    pub name: String,
    pub schema: NamedType,
}

impl RecordDefinition {
    pub fn new(name: impl Into<String>, schema: NamedType) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// 来自 [`Record`] 实现的定义，携带原始类型身份。
#[derive(Clone, Debug)]
pub struct TypedDefinition {
    name: &'static str,
    schema: NamedType,
    origin: TypeId,
    type_name: &'static str,
}

impl TypedDefinition {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn schema(&self) -> &NamedType {
        &self.schema
    }

    /// 产生该定义的 Rust 类型名，仅用于诊断。
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// `Storage::add` 接受的三种定义形态。
#[derive(Clone, Debug)]
pub enum Definition {
    /// 裸名称：引用一个已经存在的类型。
    Reference(String),
    /// 结构化记录。
    Record(RecordDefinition),
    /// Rust 类型自描述的记录。
    Typed(TypedDefinition),
}

impl Definition {
    /// 从 [`Record`] 实现构造定义。
    pub fn of<R: Record>() -> Self {
        Definition::Typed(TypedDefinition {
            name: R::NAME,
            schema: R::schema(),
            origin: TypeId::of::<R>(),
            type_name: std::any::type_name::<R>(),
        })
    }

    pub fn record(name: impl Into<String>, schema: NamedType) -> Self {
        Definition::Record(RecordDefinition::new(name, schema))
    }

    /// 定义声明的名称。
    pub fn name(&self) -> &str {
        match self {
            Definition::Reference(name) => name,
            Definition::Record(def) => &def.name,
            Definition::Typed(def) => def.name,
        }
    }
}

impl From<&str> for Definition {
    fn from(name: &str) -> Self {
        Definition::Reference(name.to_owned())
    }
}

impl From<String> for Definition {
    fn from(name: String) -> Self {
        Definition::Reference(name)
    }
}

impl From<RecordDefinition> for Definition {
    fn from(def: RecordDefinition) -> Self {
        Definition::Record(def)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Origin {
    Structural,
    Typed(TypeId, &'static str),
}

#[derive(Clone, Debug, Default)]
struct StorageInner {
    types: BTreeMap<String, NamedType>,
    origins: HashMap<String, Origin>,
}

/// 具名类型注册表。
///
/// # 教案式说明
/// - **意图（Why）**：Server 在构造期登记本地类型，Client 在首次调用时注入远端类型；请求处理期间只读。
/// - **逻辑（How）**：内部以 `RwLock` 保护，读路径（`get`/`has`）只持读锁；每次注册在写锁内完成
///   “冲突判定 → 结构校验 → 写入”，因此一次逻辑注册是原子的。
/// - **契约（What）**：
///   - 同名且同一定义（结构相同的记录，或同一 `TypeId`）重复注册为幂等操作，返回同一名称；
///   - 同名不同定义返回 [`RpcError::Schema`]；
///   - 指针可以指向自身（递归类型），但不能指向未注册的名称。
#[derive(Debug, Default)]
pub struct Storage {
    inner: RwLock<StorageInner>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个定义并返回规范名称。
    pub fn add(&self, definition: impl Into<Definition>) -> Result<String> {
        register(&mut self.inner.write(), definition.into())
    }

    /// 按顺序注册一组定义，返回各自的规范名称。
    ///
    /// 任一定义失败时整组都不写入；后面的定义可以引用同组前面注册的名称。
    pub fn add_all<I>(&self, definitions: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = Definition>,
    {
        let mut inner = self.inner.write();
        let mut staged = inner.clone();
        let names = definitions
            .into_iter()
            .map(|definition| register(&mut staged, definition))
            .collect::<Result<Vec<_>>>()?;
        *inner = staged;
        Ok(names)
    }

    /// 原子地批量注册，用于注入远端 Schema。
    ///
    /// # 契约说明（What）
    /// - 批次内的指针可以任意顺序互相引用；
    /// - 与已注册类型同名时，结构一致视为幂等，否则整批失败；
    /// - 任一条目失败则不写入任何条目。
    pub fn extend(&self, types: BTreeMap<String, NamedType>) -> Result<()> {
        let mut inner = self.inner.write();

        for (name, schema) in &types {
            check_name(name)?;
            if let Some(existing) = inner.types.get(name) {
                if existing != schema {
                    return Err(RpcError::Schema(format!(
                        "type `{name}` is already registered with a different definition"
                    )));
                }
            }
        }

        let resolves =
            |target: &str| types.contains_key(target) || inner.types.contains_key(target);
        for (name, schema) in &types {
            validate(name, schema, &resolves)?;
        }

        for (name, schema) in types {
            inner.origins.entry(name.clone()).or_insert(Origin::Structural);
            inner.types.entry(name).or_insert(schema);
        }
        Ok(())
    }

    /// 读取类型定义。
    pub fn get(&self, name: &str) -> Result<NamedType> {
        self.inner
            .read()
            .types
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::Schema(format!("type `{name}` does not exist")))
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.read().types.contains_key(name)
    }

    /// 已注册名称（字典序）。
    pub fn names(&self) -> Vec<String> {
        self.inner.read().types.keys().cloned().collect()
    }

    /// 当前全部类型的拷贝，用于导出 Schema 文档。
    pub fn snapshot(&self) -> BTreeMap<String, NamedType> {
        self.inner.read().types.clone()
    }

    /// 重新校验全部已注册类型。
    pub fn verify(&self) -> Result<()> {
        let inner = self.inner.read();
        let resolves = |target: &str| inner.types.contains_key(target);
        for (name, schema) in &inner.types {
            check_name(name)?;
            validate(name, schema, &resolves)?;
        }
        Ok(())
    }
}

/// 在给定状态上注册一个定义；调用方持有写锁。
fn register(inner: &mut StorageInner, definition: Definition) -> Result<String> {
    match definition {
        Definition::Reference(name) => {
            check_name(&name)?;
            if inner.types.contains_key(&name) {
                Ok(name)
            } else {
                Err(RpcError::Schema(format!("type `{name}` does not exist")))
            }
        }
        Definition::Record(def) => insert(inner, def.name, def.schema, Origin::Structural),
        Definition::Typed(def) => insert(
            inner,
            def.name.to_owned(),
            def.schema,
            Origin::Typed(def.origin, def.type_name),
        ),
    }
}

fn insert(
    inner: &mut StorageInner,
    name: String,
    schema: NamedType,
    origin: Origin,
) -> Result<String> {
    check_name(&name)?;

    if let Some(existing) = inner.types.get(&name) {
        let existing_origin = inner.origins.get(&name).copied();
        return match (existing_origin, origin) {
            (Some(Origin::Typed(current, _)), Origin::Typed(incoming, _))
                if current == incoming =>
            {
                Ok(name)
            }
            (Some(Origin::Structural), Origin::Structural) if *existing == schema => Ok(name),
            _ => Err(RpcError::Schema(format!(
                "type `{name}` is already registered with a different definition"
            ))),
        };
    }

    let resolves = |target: &str| target == name || inner.types.contains_key(target);
    validate(&name, &schema, &resolves)?;

    inner.origins.insert(name.clone(), origin);
    inner.types.insert(name.clone(), schema);
    Ok(name)
}
