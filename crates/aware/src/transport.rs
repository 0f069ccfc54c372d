//! 发现传输层接口
//!
//! 核心只依赖这里定义的接口：发布/订阅服务、向已发现的对端发送数据报、
//! 请求点对点承载网络。平台回调被转换成 [`SessionEvent`]，通过通道投递给协调器，
//! 所有状态修改都在协调器自己的任务里串行完成。

use crate::wire::WireFrame;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// 对端的稳定字符串键
pub type PeerKey = String;

/// 对端句柄
///
/// 由传输层创建，仅在当前发现会话内有效。核心只使用它派生出的 [`PeerKey`]。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    key: PeerKey,
}

impl PeerHandle {
    /// 创建新的对端句柄
    pub fn new(key: impl Into<PeerKey>) -> Self {
        Self { key: key.into() }
    }

    /// 获取对端键
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// 发现会话 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// 附着句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachHandle {
    pub id: u64,
}

/// 承载网络句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerHandle {
    /// 承载网络 ID
    pub id: u64,
    /// 对端
    pub peer: PeerHandle,
}

/// 承载网络请求参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerRequest {
    /// 预共享口令
    pub passphrase: String,
    /// 主机端监听端口（客户端请求时为 None）
    pub port: Option<u16>,
    /// 超时时间
    pub timeout: Duration,
}

/// 发现会话事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// 发现服务（仅订阅会话）
    ServiceDiscovered {
        peer: PeerHandle,
        /// 服务附加信息（房间名的 UTF-8 字节）
        service_info: Vec<u8>,
    },

    /// 收到数据报
    MessageReceived {
        peer: PeerHandle,
        payload: Vec<u8>,
    },

    /// 承载网络丢失（承载建立成功之后的任意时刻）
    BearerLost {
        peer: PeerHandle,
    },
}

/// 发现会话
///
/// 发布或订阅成功后返回，事件接收器由协调器独占消费。
#[derive(Debug)]
pub struct DiscoverySession {
    pub id: SessionId,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// 附着错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    /// 能力不可用（无线关闭或硬件不支持），用户干预后可重试
    #[error("近场能力不可用: {0}")]
    Unavailable(String),

    #[error("附着失败: {0}")]
    Failed(String),
}

/// 承载网络错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BearerError {
    #[error("承载网络请求超时 ({0:?})")]
    Timeout(Duration),

    #[error("承载网络请求被拒绝: {0}")]
    Rejected(String),

    #[error("发现会话已关闭")]
    SessionClosed,
}

/// 数据报发送错误（按对端计，不影响其他对端）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("未知对端: {0}")]
    UnknownPeer(String),

    #[error("发现会话已关闭")]
    SessionClosed,

    #[error("传输层发送失败: {0}")]
    Transport(String),
}

/// 发现传输层
///
/// 平台相关的近场能力实现此 trait。所有方法都必须可以从任意任务并发调用。
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// 附着到近场能力
    ///
    /// 已附着时必须直接返回现有句柄。
    async fn attach(&self) -> Result<AttachHandle, AttachError>;

    /// 以服务名发布房间
    async fn publish(
        &self,
        attach: &AttachHandle,
        service_name: &str,
        room_name: &str,
    ) -> Result<DiscoverySession, AttachError>;

    /// 订阅服务名，发现已发布的房间
    async fn subscribe(
        &self,
        attach: &AttachHandle,
        service_name: &str,
    ) -> Result<DiscoverySession, AttachError>;

    /// 向对端发送数据报（尽力而为，无确认）
    fn send_datagram(
        &self,
        session: SessionId,
        peer: &PeerHandle,
        sequence: u32,
        payload: &[u8],
    ) -> Result<(), SendError>;

    /// 请求到对端的承载网络
    async fn request_bearer(
        &self,
        session: SessionId,
        peer: &PeerHandle,
        request: BearerRequest,
    ) -> Result<BearerHandle, BearerError>;

    /// 关闭发现会话（可重复调用）
    fn close_session(&self, session: SessionId);

    /// 释放附着句柄（可重复调用）
    fn detach(&self, attach: &AttachHandle);
}

/// 数据报发件箱
///
/// 绑定到一个发现会话，为每个数据报分配递增序号。协调器和心跳监视器共用。
pub struct DatagramOutbox {
    transport: Arc<dyn DiscoveryTransport>,
    session: SessionId,
    sequence: AtomicU32,
}

impl DatagramOutbox {
    /// 创建新的发件箱
    pub fn new(transport: Arc<dyn DiscoveryTransport>, session: SessionId) -> Self {
        Self {
            transport,
            session,
            sequence: AtomicU32::new(0),
        }
    }

    /// 获取所属会话
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// 向单个对端发送帧
    pub fn send(&self, peer: &PeerHandle, frame: &WireFrame) -> Result<(), SendError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.transport
            .send_datagram(self.session, peer, sequence, &frame.encode())
    }

    /// 向多个对端发送帧，返回成功投递的数量
    ///
    /// 单个对端失败只记录日志，不影响其余对端。
    pub fn broadcast<'a, I>(&self, peers: I, frame: &WireFrame) -> usize
    where
        I: IntoIterator<Item = &'a PeerHandle>,
    {
        let mut delivered = 0;
        for peer in peers {
            match self.send(peer, frame) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("向 {} 发送 {} 失败: {}", peer, frame.kind(), e),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_handle_key() {
        let handle = PeerHandle::new("device-a:1");
        assert_eq!(handle.key(), "device-a:1");
        assert_eq!(handle.to_string(), "device-a:1");
        assert_eq!(handle, PeerHandle::new("device-a:1".to_string()));
    }

    #[test]
    fn test_error_display() {
        let err = AttachError::Unavailable("Wi-Fi 已关闭".to_string());
        assert!(err.to_string().contains("Wi-Fi 已关闭"));

        let err = BearerError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30s"));

        let err = SendError::UnknownPeer("peer-x".to_string());
        assert!(err.to_string().contains("peer-x"));
    }
}
