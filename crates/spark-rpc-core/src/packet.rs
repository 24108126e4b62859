use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::RpcError;

/// 数据包头部：字符串到字符串的有序映射。
pub type Header = BTreeMap<String, String>;

/// 约定的头部键。
pub mod headers {
    /// 分发键：目标方法名。
    pub const METHOD: &str = "method";
    /// 回复地址；缺失表示即发即弃。
    pub const REPLY: &str = "reply";
    /// 调用方服务名。
    pub const SERVICE: &str = "service";
    /// 错误码。
    pub const ERROR: &str = "error";
    /// 错误消息。
    pub const ERROR_MESSAGE: &str = "error.message";
}

/// 头部名称规范化：去除首尾空白并转为小写。
///
/// 写入响应头与读取请求头都经过该函数，保证不同实现之间大小写不敏感。
pub fn normalize_header_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// 服务的 RPC 主题名。
pub fn rpc_subject(service: &str) -> String {
    format!("{service}_rpc")
}

/// 传输层交换的最小单元：头部 + 不透明字节体。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub body: Bytes,
}

impl Packet {
    pub fn new(header: Header, body: Bytes) -> Self {
        Self { header, body }
    }

    /// 以规范化名称写入头部，返回自身便于链式构造。
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.header.insert(normalize_header_name(name), value.into());
        self
    }

    /// 读取头部：先按原样查找，再按规范化名称查找。
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header
            .get(name)
            .or_else(|| self.header.get(&normalize_header_name(name)))
            .map(String::as_str)
    }

    /// 若头部携带错误码，则还原为类型化错误。
    pub fn error(&self) -> Option<RpcError> {
        self.header(headers::ERROR).map(|code| {
            RpcError::from_wire(code, self.header(headers::ERROR_MESSAGE).unwrap_or_default())
        })
    }

    /// 把错误写入头部，并清空字节体。
    pub fn set_error(&mut self, err: &RpcError) {
        self.header
            .insert(headers::ERROR.to_owned(), err.code().to_owned());
        self.header
            .insert(headers::ERROR_MESSAGE.to_owned(), err.message().into_owned());
        self.body = Bytes::new();
    }
}
