//! 聊天消息
//!
//! 发送或收到聊天帧时创建，交给存储和界面使用。

use super::session::ConnectionState;
use crate::wire::ChatFrame;
use crate::AwareError;
use serde::{Deserialize, Serialize};

/// 聊天消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// 消息唯一 ID（UUID）
    pub id: String,

    /// 发送者 ID
    pub sender_id: String,

    /// 发送者显示名称
    pub sender_name: String,

    /// 消息内容
    pub content: String,

    /// Unix 时间戳（毫秒），只用于显示排序
    pub timestamp: i64,

    /// 是否为本机发送
    pub is_local: bool,
}

impl ChatMessage {
    /// 创建本机发送的消息
    pub fn local(
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(sender_id.into(), sender_name.into(), content.into(), true)
    }

    /// 从收到的聊天帧创建消息
    pub fn remote(frame: ChatFrame) -> Self {
        Self::new(frame.sender_id, frame.sender_name, frame.content, false)
    }

    fn new(sender_id: String, sender_name: String, content: String, is_local: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id,
            sender_name,
            content,
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_local,
        }
    }

    /// 设置时间戳
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 转换为线路聊天帧
    pub fn to_frame(&self) -> ChatFrame {
        ChatFrame::new(&self.sender_id, &self.sender_name, &self.content)
    }
}

/// 聊天错误类型
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// 当前状态不允许发送
    #[error("未连接，当前状态: {0:?}")]
    NotConnected(ConnectionState),

    /// 存储错误
    #[error("消息存储错误: {0}")]
    Store(String),

    /// 协调器错误
    #[error(transparent)]
    Aware(#[from] AwareError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_message_creation() {
        let msg = ChatMessage::local("u1", "Alice", "Hello");

        assert!(!msg.id.is_empty());
        assert_eq!(msg.sender_id, "u1");
        assert_eq!(msg.sender_name, "Alice");
        assert_eq!(msg.content, "Hello");
        assert!(msg.timestamp > 0);
        assert!(msg.is_local);
    }

    #[test]
    fn test_remote_message_from_frame() {
        let msg = ChatMessage::remote(ChatFrame::new("alice", "Alice", "hi|there"));

        assert!(!msg.is_local);
        assert_eq!(msg.content, "hi|there");
        assert_eq!(msg.to_frame(), ChatFrame::new("alice", "Alice", "hi|there"));
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = ChatMessage::local("u1", "Alice", "same");
        let b = ChatMessage::local("u1", "Alice", "same");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_message_serialization() {
        let original = ChatMessage::local("u1", "Alice", "你好").with_timestamp(1_700_000_000_000);

        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains("\"is_local\":true"));

        let decoded: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(original, decoded);
    }
}
