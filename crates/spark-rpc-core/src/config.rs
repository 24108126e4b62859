//! 声明式配置：服务名、编解码器选择与传输层超时。
//!
//! 配置以 TOML 描述，缺省字段取默认值；解析或校验失败一律返回 [`RpcError::Config`]。
//!
//! ```toml
//! service = "users"
//!
//! [serializer]
//! kind = "ordered"
//!
//! [transport]
//! request_timeout_ms = 3000
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// 编解码器选择。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializerConfig {
    /// `ordered` 或 `generic`。
    pub kind: String,
}

impl SerializerConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self::new("ordered")
    }
}

/// 传输层参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub request_timeout_ms: u64,
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
        }
    }
}

/// 单个服务进程的完整配置。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub service: String,
    pub serializer: SerializerConfig,
    pub transport: TransportConfig,
}

impl BrokerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: BrokerConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验语义约束：服务名非空、超时为正。
    pub fn validate(&self) -> Result<()> {
        if self.service.trim().is_empty() {
            return Err(RpcError::Config("service name must not be blank".into()));
        }
        if self.transport.request_timeout_ms == 0 {
            return Err(RpcError::Config(
                "transport.request_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
