//! 对端注册表
//!
//! 维护已建立承载网络的对端及其最后活跃时间。发现、承载结果、心跳和停止路径
//! 会并发修改注册表，调用方不需要额外加锁。

use crate::transport::{PeerHandle, PeerKey, SessionId};
use crate::RoomName;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// 已注册的对端
#[derive(Debug, Clone)]
pub struct RegisteredPeer {
    /// 对端句柄
    pub handle: PeerHandle,

    /// 对端所在房间
    pub room: RoomName,

    /// 所属发现会话
    pub session: SessionId,

    /// 注册时间
    pub connected_at: Instant,

    /// 最后活跃时间
    pub last_activity: Instant,
}

impl RegisteredPeer {
    /// 创建新的注册记录
    pub fn new(handle: PeerHandle, room: RoomName, session: SessionId) -> Self {
        let now = Instant::now();
        Self {
            handle,
            room,
            session,
            connected_at: now,
            last_activity: now,
        }
    }

    /// 获取对端键
    pub fn key(&self) -> &str {
        self.handle.key()
    }

    /// 更新最后活跃时间
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// 检查是否超时（距离最后活跃达到指定时长）
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() >= timeout
    }

    /// 距离最后活跃的时间
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// 对端注册表
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerKey, RegisteredPeer>>,
}

impl PeerRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录对端
    ///
    /// 注册本身算作一次活跃。返回 true 表示新对端。
    pub async fn record(&self, handle: PeerHandle, room: RoomName, session: SessionId) -> bool {
        let mut peers = self.peers.write().await;
        let key = handle.key().to_string();

        if let Some(existing) = peers.get_mut(&key) {
            existing.handle = handle;
            existing.room = room;
            existing.session = session;
            existing.touch();
            tracing::debug!("更新对端: {}", key);
            false
        } else {
            tracing::info!("记录对端: {} (房间 {})", key, room);
            peers.insert(key, RegisteredPeer::new(handle, room, session));
            true
        }
    }

    /// 更新对端活跃时间
    ///
    /// 对端不存在时返回 false。
    pub async fn touch(&self, key: &str) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(key) {
            Some(peer) => {
                peer.touch();
                true
            }
            None => false,
        }
    }

    /// 剔除超时对端
    ///
    /// 每个对端只会被返回一次，之后的调用不会再包含它。
    pub async fn evict_stale(&self, timeout: Duration) -> Vec<RegisteredPeer> {
        let mut peers = self.peers.write().await;
        let stale: Vec<PeerKey> = peers
            .iter()
            .filter(|(_, peer)| peer.is_stale(timeout))
            .map(|(key, _)| key.clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(peer) = peers.remove(&key) {
                tracing::info!("剔除超时对端: {} (空闲 {:?})", key, peer.idle_time());
                evicted.push(peer);
            }
        }
        evicted
    }

    /// 移除对端
    pub async fn remove(&self, key: &str) -> Option<RegisteredPeer> {
        let mut peers = self.peers.write().await;
        let removed = peers.remove(key);
        if removed.is_some() {
            tracing::info!("移除对端: {}", key);
        }
        removed
    }

    /// 获取对端
    pub async fn get(&self, key: &str) -> Option<RegisteredPeer> {
        self.peers.read().await.get(key).cloned()
    }

    /// 检查对端是否已注册
    pub async fn contains(&self, key: &str) -> bool {
        self.peers.read().await.contains_key(key)
    }

    /// 列出所有对端
    pub async fn peers(&self) -> Vec<RegisteredPeer> {
        self.peers.read().await.values().cloned().collect()
    }

    /// 所有对端句柄
    pub async fn handles(&self) -> Vec<PeerHandle> {
        self.peers
            .read()
            .await
            .values()
            .map(|p| p.handle.clone())
            .collect()
    }

    /// 对端数量
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// 是否为空
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// 对端最后活跃时间
    pub async fn last_activity(&self, key: &str) -> Option<Instant> {
        self.peers.read().await.get(key).map(|p| p.last_activity)
    }

    /// 所有对端中最近的一次活跃时间
    pub async fn latest_activity(&self) -> Option<Instant> {
        self.peers
            .read()
            .await
            .values()
            .map(|p| p.last_activity)
            .max()
    }

    /// 清空注册表，返回被清除的对端数量
    pub async fn clear(&self) -> usize {
        let mut peers = self.peers.write().await;
        let count = peers.len();
        peers.clear();
        if count > 0 {
            tracing::debug!("清空注册表，移除 {} 个对端", count);
        }
        count
    }
}
