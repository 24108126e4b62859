#![deny(unsafe_code)]
#![doc = "spark-transport-memory: 进程内传输层。"]
#![doc = ""]
#![doc = "语义对齐常见的消息总线：主题订阅、`_INBOX.<n>` 回复地址、请求级超时。"]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use spark_rpc_core::{
    Packet, PacketHandler, Result, RpcError, TransportConfig, Transporter, headers,
};
use tokio::sync::oneshot;
use tracing::debug;

const INBOX_PREFIX: &str = "_INBOX.";

/// 进程内传输层。
///
/// # 教案式说明
/// - **意图（Why）**：为 Server/Client 的集成测试与演示提供零外部依赖的传输实现，
///   行为与真实消息总线保持一致，使协议层测试能够覆盖超时、即发即弃等边界。
/// - **逻辑（How）**：
///   - `subjects` 保存主题到订阅者列表的映射，每个入站数据包在独立的 Tokio 任务中交给订阅者；
///   - `send_request` 分配唯一的回复主题并写入 `reply` 头部，在 `inboxes` 中登记等待者，
///     随后以 `tokio::time::timeout` 等待回复；
///   - `send` 发往回复主题时唤醒对应等待者，迟到的回复被记录后丢弃。
/// - **契约（What）**：
///   - 头部与字节体原样传递；
///   - 请求发往无人订阅的主题返回 [`RpcError::Transporter`]，即发即弃消息则静默丢弃；
///   - 超时返回 [`RpcError::RequestTimeOut`]。
/// - **前置条件**：所有方法必须在 Tokio 运行时内调用。
pub struct MemoryTransport {
    subjects: DashMap<String, Vec<Arc<dyn PacketHandler>>>,
    inboxes: DashMap<String, oneshot::Sender<Packet>>,
    next_inbox: AtomicU64,
    request_timeout: Duration,
    connected: AtomicBool,
}

impl MemoryTransport {
    pub const NAME: &'static str = "memory";

    pub fn new(request_timeout: Duration) -> Self {
        Self {
            subjects: DashMap::new(),
            inboxes: DashMap::new(),
            next_inbox: AtomicU64::new(1),
            request_timeout,
            connected: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.request_timeout())
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// 移除主题上的全部订阅者，返回是否存在订阅。
    pub fn unsubscribe(&self, subject: &str) -> bool {
        self.subjects.remove(subject).is_some()
    }

    /// 仍在等待回复的请求数。
    pub fn pending_requests(&self) -> usize {
        self.inboxes.len()
    }

    fn subscribers(&self, subject: &str) -> Vec<Arc<dyn PacketHandler>> {
        self.subjects
            .get(subject)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn deliver(subscribers: Vec<Arc<dyn PacketHandler>>, packet: Packet) {
        for handler in subscribers {
            let packet = packet.clone();
            tokio::spawn(async move {
                handler.on_packet(packet).await;
            });
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("subjects", &self.subjects.len())
            .field("pending_requests", &self.inboxes.len())
            .field("request_timeout", &self.request_timeout)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl Transporter for MemoryTransport {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn connect(&self) -> Result<()> {
        if !self.connected.swap(true, Ordering::AcqRel) {
            debug!(transport = Self::NAME, "connected");
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str, handler: Arc<dyn PacketHandler>) -> Result<()> {
        if subject.trim().is_empty() {
            return Err(RpcError::Transporter("subject must not be blank".into()));
        }
        if subject.starts_with(INBOX_PREFIX) {
            return Err(RpcError::Transporter(format!(
                "subject `{subject}` is reserved for replies"
            )));
        }
        self.subjects
            .entry(subject.to_owned())
            .or_default()
            .push(handler);
        debug!(subject, "subscribed");
        Ok(())
    }

    async fn send_request(&self, subject: &str, mut packet: Packet) -> Result<Packet> {
        let subscribers = self.subscribers(subject);
        if subscribers.is_empty() {
            return Err(RpcError::Transporter(format!(
                "no subscribers for subject `{subject}`"
            )));
        }

        let inbox = format!(
            "{INBOX_PREFIX}{}",
            self.next_inbox.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = oneshot::channel();
        self.inboxes.insert(inbox.clone(), tx);
        packet
            .header
            .insert(headers::REPLY.to_owned(), inbox.clone());
        // 超时或调用方放弃等待时都要撤销登记。
        let _inbox = InboxGuard {
            inboxes: &self.inboxes,
            inbox,
        };
        Self::deliver(subscribers, packet);

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RpcError::Transporter(format!(
                "reply channel for `{subject}` closed"
            ))),
            Err(_) => Err(RpcError::RequestTimeOut(format!(
                "request to `{subject}` timed out after {} ms",
                self.request_timeout.as_millis()
            ))),
        }
    }

    async fn send(&self, subject: &str, packet: Packet) -> Result<()> {
        if subject.starts_with(INBOX_PREFIX) {
            match self.inboxes.remove(subject) {
                Some((_, waiter)) => {
                    if waiter.send(packet).is_err() {
                        debug!(subject, "requester went away before the reply arrived");
                    }
                }
                None => debug!(subject, "late reply dropped"),
            }
            return Ok(());
        }

        let subscribers = self.subscribers(subject);
        if subscribers.is_empty() {
            debug!(subject, "no subscribers, packet dropped");
            return Ok(());
        }
        Self::deliver(subscribers, packet);
        Ok(())
    }
}

/// 请求结束时移除回复地址的登记；回复已送达时条目早已被 `send` 取走。
struct InboxGuard<'a> {
    inboxes: &'a DashMap<String, oneshot::Sender<Packet>>,
    inbox: String,
}

impl Drop for InboxGuard<'_> {
    fn drop(&mut self) {
        self.inboxes.remove(&self.inbox);
    }
}
