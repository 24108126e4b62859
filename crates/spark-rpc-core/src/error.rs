//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - RPC 两端（Server 分发、Client 拦截）共享同一份封闭错误分类，错误码以字符串形式穿越 `error` 头部，
//!   因此必须在本模块集中定义并保持稳定。
//! - 注册期（Schema、配置）错误与请求期错误共用一个枚举，调用方按 [`RpcError::code`] 做统一治理。
//!
//! ## 设计要求（What）
//! - 错误码遵循 `<领域>.<语义>` 约定，全部列在 [`codes`] 中；
//! - [`RpcError::from_wire`] 是 [`RpcError::code`]/[`RpcError::message`] 的逆运算，未知错误码回退为 `Internal`；
//! - `Validate` 的负载只能是纯字符串（头部只承载字符串），结构化信息由 [`Violation`] 编解码。

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

/// 稳定错误码集合。
///
/// # 契约说明（What）
/// - 码值一经发布不得修改：独立部署的服务之间只通过这些字符串还原错误类型；
/// - 新增错误码需要同时更新 [`RpcError::from_wire`]。
pub mod codes {
    /// 配置或装配阶段错误。
    pub const CONFIG: &str = "rpc.config";
    /// Schema 定义或注册错误。
    pub const SCHEMA: &str = "rpc.schema";
    /// 编解码失败。
    pub const SERIALIZER: &str = "rpc.serializer";
    /// 传输层错误（非超时）。
    pub const TRANSPORTER: &str = "rpc.transporter";
    /// 无法归类的内部错误。
    pub const INTERNAL: &str = "rpc.internal";
    /// 请求的方法没有注册处理器。
    pub const HANDLER_UNIMPLEMENTED: &str = "rpc.handler_unimplemented";
    /// 传输层请求超时。
    pub const REQUEST_TIMEOUT: &str = "rpc.request_timeout";
    /// 业务校验失败。
    pub const VALIDATE: &str = "rpc.validate";
    /// 请求不合法。
    pub const BAD_REQUEST: &str = "rpc.bad_request";
    /// 响应不合法。
    pub const BAD_RESPONSE: &str = "rpc.bad_response";
    /// 资源不存在。
    pub const NOT_FOUND: &str = "rpc.not_found";
    /// 未认证。
    pub const UNAUTHORIZED: &str = "rpc.unauthorized";
    /// 无权限。
    pub const FORBIDDEN: &str = "rpc.forbidden";
}

/// 框架统一的结果别名。
pub type Result<T, E = RpcError> = std::result::Result<T, E>;

/// RPC 核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：将 Schema 注册、编解码、传输与业务处理中的失败折叠为封闭集合，使 Server 能把任何错误
///   转换为 `error`/`error.message` 头部，Client 再按错误码原样重建。
/// - **契约 (What)**：
///   - 每个变体对应 [`codes`] 中的一个常量，见 [`RpcError::code`]；
///   - 消息文本在跨线 round-trip 后保持逐字节一致；
///   - 只有 [`RpcError::RequestTimeOut`] 被视为调用方可安全重试（见 [`RpcError::is_retryable`]）。
/// - **设计权衡 (Trade-offs)**：使用 `String` 承载消息，牺牲少量分配换取跨线还原的简单性。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("[rpc.config] {0}")]
    Config(String),

    #[error("[rpc.schema] {0}")]
    Schema(String),

    #[error("[rpc.serializer] {0}")]
    Serializer(String),

    #[error("[rpc.transporter] {0}")]
    Transporter(String),

    #[error("[rpc.internal] {0}")]
    Internal(String),

    #[error("[rpc.handler_unimplemented] {0}")]
    HandlerUnimplemented(String),

    #[error("[rpc.request_timeout] {0}")]
    RequestTimeOut(String),

    #[error("[rpc.validate] {0}")]
    Validate(Violation),

    #[error("[rpc.bad_request] {0}")]
    BadRequest(String),

    #[error("[rpc.bad_response] {0}")]
    BadResponse(String),

    #[error("[rpc.not_found] {0}")]
    NotFound(String),

    #[error("[rpc.unauthorized] {0}")]
    Unauthorized(String),

    #[error("[rpc.forbidden] {0}")]
    Forbidden(String),
}

impl RpcError {
    /// 返回穿越 `error` 头部的稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::Config(_) => codes::CONFIG,
            RpcError::Schema(_) => codes::SCHEMA,
            RpcError::Serializer(_) => codes::SERIALIZER,
            RpcError::Transporter(_) => codes::TRANSPORTER,
            RpcError::Internal(_) => codes::INTERNAL,
            RpcError::HandlerUnimplemented(_) => codes::HANDLER_UNIMPLEMENTED,
            RpcError::RequestTimeOut(_) => codes::REQUEST_TIMEOUT,
            RpcError::Validate(_) => codes::VALIDATE,
            RpcError::BadRequest(_) => codes::BAD_REQUEST,
            RpcError::BadResponse(_) => codes::BAD_RESPONSE,
            RpcError::NotFound(_) => codes::NOT_FOUND,
            RpcError::Unauthorized(_) => codes::UNAUTHORIZED,
            RpcError::Forbidden(_) => codes::FORBIDDEN,
        }
    }

    /// 返回不含错误码前缀的原始消息，即写入 `error.message` 头部的内容。
    pub fn message(&self) -> Cow<'_, str> {
        match self {
            RpcError::Config(msg)
            | RpcError::Schema(msg)
            | RpcError::Serializer(msg)
            | RpcError::Transporter(msg)
            | RpcError::Internal(msg)
            | RpcError::HandlerUnimplemented(msg)
            | RpcError::RequestTimeOut(msg)
            | RpcError::BadRequest(msg)
            | RpcError::BadResponse(msg)
            | RpcError::NotFound(msg)
            | RpcError::Unauthorized(msg)
            | RpcError::Forbidden(msg) => Cow::Borrowed(msg.as_str()),
            RpcError::Validate(violation) => Cow::Owned(violation.to_string()),
        }
    }

    /// 依据错误码与消息重建类型化错误。
    ///
    /// # 契约说明（What）
    /// - **输入**：`code` 来自响应头 `error`，`message` 来自 `error.message`（缺失时调用方传空串）；
    /// - **后置条件**：对任意 `err`，`from_wire(err.code(), &err.message()) == err`；
    /// - **边界**：未知错误码映射为 [`RpcError::Internal`]，消息保留原文并附带原始码值，避免信息丢失。
    pub fn from_wire(code: &str, message: &str) -> Self {
        let message = message.to_owned();
        match code {
            codes::CONFIG => RpcError::Config(message),
            codes::SCHEMA => RpcError::Schema(message),
            codes::SERIALIZER => RpcError::Serializer(message),
            codes::TRANSPORTER => RpcError::Transporter(message),
            codes::INTERNAL => RpcError::Internal(message),
            codes::HANDLER_UNIMPLEMENTED => RpcError::HandlerUnimplemented(message),
            codes::REQUEST_TIMEOUT => RpcError::RequestTimeOut(message),
            codes::VALIDATE => RpcError::Validate(Violation::parse(&message)),
            codes::BAD_REQUEST => RpcError::BadRequest(message),
            codes::BAD_RESPONSE => RpcError::BadResponse(message),
            codes::NOT_FOUND => RpcError::NotFound(message),
            codes::UNAUTHORIZED => RpcError::Unauthorized(message),
            codes::FORBIDDEN => RpcError::Forbidden(message),
            unknown => RpcError::Internal(format!("unknown error code `{unknown}`: {message}")),
        }
    }

    /// 调用方是否可以在无副作用风险的前提下重试。
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::RequestTimeOut(_))
    }

    /// 便捷构造：按字段描述的校验失败。
    pub fn invalid_fields<I, F, C>(fields: I) -> Self
    where
        I: IntoIterator<Item = (F, C)>,
        F: Into<String>,
        C: Into<String>,
    {
        RpcError::Validate(Violation::Fields(
            fields
                .into_iter()
                .map(|(field, constraint)| FieldViolation {
                    field: field.into(),
                    constraint: constraint.into(),
                })
                .collect(),
        ))
    }

    /// 便捷构造：违反命名常量的校验失败。
    pub fn invalid_constant(constant: impl Into<String>) -> Self {
        RpcError::Validate(Violation::Constant(constant.into()))
    }
}

/// 单个字段的校验失败描述。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub constraint: String,
}

/// `Validate` 错误携带的结构化子格式。
///
/// # 教案式说明
/// - **意图 (Why)**：头部只能承载字符串，但调用方需要知道“哪个字段违反了哪条约束”；
///   因此约定两种纯文本编码：`f><field>:<constraint>|...` 与 `c><constant>`。
/// - **契约 (What)**：`Display` 输出即线上文本，[`Violation::parse`] 为其逆运算；
///   不符合任一前缀的文本保存在 `Message` 中原样回传。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    Fields(Vec<FieldViolation>),
    Constant(String),
    Message(String),
}

impl Violation {
    const FIELDS_PREFIX: &'static str = "f>";
    const CONSTANT_PREFIX: &'static str = "c>";

    /// 从线上文本还原校验失败描述。
    pub fn parse(raw: &str) -> Self {
        if let Some(body) = raw.strip_prefix(Self::FIELDS_PREFIX) {
            let fields = body
                .split('|')
                .filter(|item| !item.is_empty())
                .map(|item| match item.split_once(':') {
                    Some((field, constraint)) => FieldViolation {
                        field: field.to_owned(),
                        constraint: constraint.to_owned(),
                    },
                    None => FieldViolation {
                        field: item.to_owned(),
                        constraint: String::new(),
                    },
                })
                .collect();
            Violation::Fields(fields)
        } else if let Some(constant) = raw.strip_prefix(Self::CONSTANT_PREFIX) {
            Violation::Constant(constant.to_owned())
        } else {
            Violation::Message(raw.to_owned())
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Fields(fields) => {
                f.write_str(Self::FIELDS_PREFIX)?;
                for (index, item) in fields.iter().enumerate() {
                    if index > 0 {
                        f.write_str("|")?;
                    }
                    write!(f, "{}:{}", item.field, item.constraint)?;
                }
                Ok(())
            }
            Violation::Constant(constant) => write!(f, "{}{constant}", Self::CONSTANT_PREFIX),
            Violation::Message(message) => f.write_str(message),
        }
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        RpcError::Serializer(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        RpcError::Serializer(err.to_string())
    }
}

impl From<toml::de::Error> for RpcError {
    fn from(err: toml::de::Error) -> Self {
        RpcError::Config(err.to_string())
    }
}
