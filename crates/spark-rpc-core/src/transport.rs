//! 传输层契约：主题上的发布/订阅与请求/应答。
//!
//! # 教案式概览
//! - **意图（Why）**：协议层只依赖“按主题收发 [`Packet`]”这一最小能力，具体实现（NATS、进程内总线等）
//!   作为外部协作者注入。
//! - **契约（What）**：
//!   - 实现必须原样保留头部映射与字节体；
//!   - `send_request` 负责分配回复地址并写入 `reply` 头部，超时时返回 [`RpcError::RequestTimeOut`]；
//!   - `subscribe` 的回调可能被并发调用，每个数据包彼此独立。
//!
//! [`RpcError::RequestTimeOut`]: crate::RpcError::RequestTimeOut

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::packet::Packet;

/// 订阅回调。
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    async fn on_packet(&self, packet: Packet);
}

/// 共享传输层。
#[async_trait]
pub trait Transporter: Send + Sync + 'static {
    /// 实现标识，写入 Schema 文档的 `transporter` 字段。
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn subscribe(&self, subject: &str, handler: Arc<dyn PacketHandler>) -> Result<()>;

    /// 请求/应答：等待对端回复或超时。
    async fn send_request(&self, subject: &str, packet: Packet) -> Result<Packet>;

    /// 即发即弃。
    async fn send(&self, subject: &str, packet: Packet) -> Result<()>;
}
