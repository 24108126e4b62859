//! 结构校验：名称合法性、字段序号、枚举符号与指针解析。
//!
//! 所有失败都以 [`RpcError::Schema`] 返回，并在消息开头给出出错路径（如 `User.address`），
//! 便于注册期直接定位到具体字段。

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::types::NamedType;
use crate::error::{Result, RpcError};

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_$][A-Za-z_$0-9]*$").expect("identifier pattern is a valid regex")
});

/// 名称是否满足 `^[A-Za-z_$][A-Za-z_$0-9]*$`。
pub fn is_valid_name(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// 校验类型名，失败时返回带名称的 Schema 错误。
pub fn check_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(RpcError::Schema(format!("invalid type name `{name}`")))
    }
}

/// 递归校验一个类型。
///
/// # 契约说明（What）
/// - `path`：当前节点的可读路径，顶层即类型名；
/// - `resolves`：判断指针目标是否可解析，调用方负责把“正在注册的名称”也纳入判定；
/// - 数组元素、映射值与联合分支分别以 `[]`、`{}`、`|<index>` 追加到路径。
pub fn validate(path: &str, ty: &NamedType, resolves: &dyn Fn(&str) -> bool) -> Result<()> {
    match ty {
        NamedType::Null
        | NamedType::Boolean
        | NamedType::Int
        | NamedType::Long
        | NamedType::Float
        | NamedType::Double
        | NamedType::Bytes
        | NamedType::String
        | NamedType::Timestamp => Ok(()),
        NamedType::Enum { symbols } => {
            if symbols.is_empty() {
                return Err(RpcError::Schema(format!("{path}: enum has no symbols")));
            }
            let mut seen = HashSet::new();
            for symbol in symbols {
                if !is_valid_name(symbol) {
                    return Err(RpcError::Schema(format!(
                        "{path}: invalid enum symbol `{symbol}`"
                    )));
                }
                if !seen.insert(symbol.as_str()) {
                    return Err(RpcError::Schema(format!(
                        "{path}: duplicate enum symbol `{symbol}`"
                    )));
                }
            }
            Ok(())
        }
        NamedType::Record { fields } => {
            let mut orders = HashSet::new();
            for (name, field) in fields {
                let field_path = format!("{path}.{name}");
                if !is_valid_name(name) {
                    return Err(RpcError::Schema(format!("{field_path}: invalid field name")));
                }
                if field.order == 0 {
                    return Err(RpcError::Schema(format!(
                        "{field_path}: order must be a positive integer"
                    )));
                }
                if !orders.insert(field.order) {
                    return Err(RpcError::Schema(format!(
                        "{field_path}: duplicate order {}",
                        field.order
                    )));
                }
                validate(&field_path, &field.ty, resolves)?;
            }
            Ok(())
        }
        NamedType::Array { items } => validate(&format!("{path}[]"), items, resolves),
        NamedType::Map { values } => validate(&format!("{path}{{}}"), values, resolves),
        NamedType::Union { variants } => {
            if variants.is_empty() {
                return Err(RpcError::Schema(format!("{path}: union has no variants")));
            }
            for (index, variant) in variants.iter().enumerate() {
                validate(&format!("{path}|{index}"), variant, resolves)?;
            }
            Ok(())
        }
        NamedType::Pointer { name } => {
            if resolves(name) {
                Ok(())
            } else {
                Err(RpcError::Schema(format!(
                    "{path}: pointer to unregistered type `{name}`"
                )))
            }
        }
    }
}
