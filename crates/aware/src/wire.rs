//! 线路帧格式
//!
//! 数据报负载是 UTF-8 文本：
//!
//! - 控制帧：`CONNECT_REQUEST`、`KEEP_ALIVE`、`KEEP_ALIVE_ACK`，精确匹配，优先于聊天帧解析；
//! - 聊天帧：`<senderId>|<senderName>|<content>`，最多切分为 3 段，多余的分隔符归入内容。

use thiserror::Error;

/// 连接请求
pub const CONNECT_REQUEST: &str = "CONNECT_REQUEST";

/// 心跳
pub const KEEP_ALIVE: &str = "KEEP_ALIVE";

/// 心跳确认
pub const KEEP_ALIVE_ACK: &str = "KEEP_ALIVE_ACK";

/// 聊天帧字段分隔符
pub const FIELD_DELIMITER: char = '|';

/// 帧解析错误
///
/// 只在协调器内部使用，格式错误的帧被丢弃并记录日志。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("负载不是有效的 UTF-8")]
    InvalidUtf8,

    #[error("聊天帧字段不足: 期望 3 段, 收到 {0} 段")]
    MissingFields(usize),
}

/// 线路帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    ConnectRequest,
    KeepAlive,
    KeepAliveAck,
    Chat(ChatFrame),
}

impl WireFrame {
    /// 解析数据报负载
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(payload).map_err(|_| ParseError::InvalidUtf8)?;
        match text {
            CONNECT_REQUEST => Ok(Self::ConnectRequest),
            KEEP_ALIVE => Ok(Self::KeepAlive),
            KEEP_ALIVE_ACK => Ok(Self::KeepAliveAck),
            _ => ChatFrame::parse(text).map(Self::Chat),
        }
    }

    /// 编码为数据报负载
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::ConnectRequest => CONNECT_REQUEST.as_bytes().to_vec(),
            Self::KeepAlive => KEEP_ALIVE.as_bytes().to_vec(),
            Self::KeepAliveAck => KEEP_ALIVE_ACK.as_bytes().to_vec(),
            Self::Chat(frame) => frame.format().into_bytes(),
        }
    }

    /// 帧类型名称（用于日志）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectRequest => CONNECT_REQUEST,
            Self::KeepAlive => KEEP_ALIVE,
            Self::KeepAliveAck => KEEP_ALIVE_ACK,
            Self::Chat(_) => "CHAT",
        }
    }
}

/// 聊天帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatFrame {
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
}

impl ChatFrame {
    /// 创建新的聊天帧
    pub fn new(
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            content: content.into(),
        }
    }

    /// 从文本解析
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let parts: Vec<&str> = text.splitn(3, FIELD_DELIMITER).collect();
        match parts.as_slice() {
            [sender_id, sender_name, content] => Ok(Self::new(*sender_id, *sender_name, *content)),
            _ => Err(ParseError::MissingFields(parts.len())),
        }
    }

    /// 格式化为文本
    pub fn format(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.sender_id, FIELD_DELIMITER, self.sender_name, FIELD_DELIMITER, self.content
        )
    }
}
