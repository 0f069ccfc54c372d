//! 聊天模块
//!
//! 在会话协调器之上提供面向界面的聊天会话。
//!
//! # 架构
//!
//! - [`message`] - 聊天消息和错误类型
//! - [`store`] - 消息存储边界（按房间追加、列出、删除、计数）
//! - [`session`] - 聊天会话门面与连接状态机

pub mod message;
pub mod store;
pub mod session;

pub use message::{ChatMessage, ChatError};
pub use store::{MessageStore, MemoryMessageStore};
pub use session::{ChatSession, ConnectionState};
