//! 消息存储边界
//!
//! 持久化不属于核心，这里只定义接口和一个内存实现。

use super::message::{ChatError, ChatMessage};
use crate::RoomName;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// 每个房间最多保留的消息条数
const MAX_HISTORY_SIZE: usize = 1000;

/// 消息存储
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 追加消息
    async fn append(&self, room: &str, message: ChatMessage) -> Result<(), ChatError>;

    /// 按时间戳升序列出房间消息
    async fn list(&self, room: &str) -> Result<Vec<ChatMessage>, ChatError>;

    /// 删除房间的所有消息，返回删除数量
    async fn delete(&self, room: &str) -> Result<usize, ChatError>;

    /// 房间消息数量
    async fn count(&self, room: &str) -> Result<usize, ChatError>;
}

/// 内存消息存储
#[derive(Debug)]
pub struct MemoryMessageStore {
    rooms: RwLock<HashMap<RoomName, VecDeque<ChatMessage>>>,
    max_history: usize,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_history: MAX_HISTORY_SIZE,
        }
    }
}

impl MemoryMessageStore {
    /// 创建空存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置每个房间的历史上限
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, room: &str, message: ChatMessage) -> Result<(), ChatError> {
        let mut rooms = self.rooms.write().await;
        let history = rooms.entry(room.to_string()).or_default();
        history.push_back(message);
        while history.len() > self.max_history {
            history.pop_front();
        }
        Ok(())
    }

    async fn list(&self, room: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let rooms = self.rooms.read().await;
        let mut messages: Vec<ChatMessage> = rooms
            .get(room)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn delete(&self, room: &str) -> Result<usize, ChatError> {
        let removed = self.rooms.write().await.remove(room);
        Ok(removed.map(|history| history.len()).unwrap_or(0))
    }

    async fn count(&self, room: &str) -> Result<usize, ChatError> {
        Ok(self.rooms.read().await.get(room).map_or(0, |h| h.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_ordered_by_timestamp() {
        let store = MemoryMessageStore::new();
        store
            .append("room1", ChatMessage::local("u1", "A", "second").with_timestamp(200))
            .await
            .unwrap();
        store
            .append("room1", ChatMessage::local("u1", "A", "first").with_timestamp(100))
            .await
            .unwrap();
        store
            .append("room2", ChatMessage::local("u2", "B", "other").with_timestamp(50))
            .await
            .unwrap();

        let contents: Vec<String> = store
            .list("room1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert_eq!(store.count("room2").await.unwrap(), 1);
        assert!(store.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_room() {
        let store = MemoryMessageStore::new();
        store.append("room1", ChatMessage::local("u1", "A", "x")).await.unwrap();
        store.append("room1", ChatMessage::local("u1", "A", "y")).await.unwrap();

        assert_eq!(store.delete("room1").await.unwrap(), 2);
        assert_eq!(store.delete("room1").await.unwrap(), 0);
        assert_eq!(store.count("room1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_history_limit_drops_oldest() {
        let store = MemoryMessageStore::new().with_max_history(2);
        for (i, content) in ["a", "b", "c"].iter().enumerate() {
            store
                .append("room1", ChatMessage::local("u1", "A", *content).with_timestamp(i as i64))
                .await
                .unwrap();
        }

        let contents: Vec<String> = store
            .list("room1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["b", "c"]);
    }
}
