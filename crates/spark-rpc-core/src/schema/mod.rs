//! 记录 Schema 与类型存储。
//!
//! # 教案式概览
//! - **意图（Why）**：服务之间通过自描述 Schema 交换类型目录，字段以 `order` 而非声明顺序决定线上布局，
//!   因此两个独立声明、但序号兼容的记录可以互相解码。
//! - **结构（How）**：[`types`] 定义类型模型，[`validate`] 负责递归结构校验，[`storage`] 提供注册表。
//! - **契约（What）**：所有失败都是 [`RpcError::Schema`](crate::RpcError::Schema)，消息以出错路径开头。

pub mod storage;
pub mod types;
pub mod validate;

pub use storage::{Definition, Record, RecordDefinition, Storage, TypedDefinition};
pub use types::{FieldDef, NamedType, RecordBuilder};
pub use validate::is_valid_name;
