//! 局域网近场聊天核心模块
//!
//! 把"某台设备正在广播一个房间名"变成"一条可双向收发、链路消失时能平滑降级的通道"。
//!
//! # 架构
//!
//! - [`transport`] - 发现传输层接口（发布/订阅、数据报、承载网络）
//! - [`wire`] - 线路帧格式（控制帧与聊天帧）
//! - [`registry`] - 对端注册表与活跃时间记录
//! - [`keepalive`] - 心跳发送与超时剔除
//! - [`coordinator`] - 会话协调器（主机/客户端握手状态机）
//! - [`chat`] - 聊天会话门面、消息类型与存储边界
//! - [`memory`] - 进程内模拟网格，用于测试和模拟模式
//! - [`p2p`] - 基于 libp2p mDNS 的局域网传输实现

use thiserror::Error;

pub mod config;
pub mod transport;
pub mod wire;
pub mod registry;
pub mod keepalive;
pub mod coordinator;
pub mod chat;
pub mod memory;
pub mod p2p;

pub use config::{SessionConfig, KeepAliveConfig, LivenessConfig};
pub use transport::{
    DiscoveryTransport, DiscoverySession, SessionEvent, SessionId, PeerHandle, PeerKey,
    AttachHandle, BearerHandle, BearerRequest, AttachError, BearerError, SendError,
};
pub use wire::{WireFrame, ChatFrame, ParseError};
pub use registry::{PeerRegistry, RegisteredPeer};
pub use keepalive::KeepAliveMonitor;
pub use coordinator::{
    SessionCoordinator, CoordinatorState, CoordinatorEvents, ConnectionEvent, InboundChat,
    LostReason, Role,
};
pub use chat::{ChatMessage, ChatError, ChatSession, ConnectionState, MessageStore, MemoryMessageStore};
pub use memory::{MemoryMesh, MemoryTransport, BearerPolicy};
pub use p2p::{P2pConfig, P2pTransport};

/// 房间名
pub type RoomName = String;

/// 协调器错误
#[derive(Error, Debug)]
pub enum AwareError {
    #[error("附着失败: {0}")]
    Attach(#[from] AttachError),

    #[error("当前状态 {state:?} 不允许执行 {operation}")]
    InvalidState {
        operation: &'static str,
        state: CoordinatorState,
    },

    #[error("传输层错误: {0}")]
    Transport(String),
}

/// 协调器结果类型
pub type Result<T> = std::result::Result<T, AwareError>;
