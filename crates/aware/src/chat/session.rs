//! 聊天会话门面
//!
//! 组合会话协调器和消息存储，把协调器事件映射到 [`ConnectionState`]，
//! 对界面暴露连接状态流和消息流。
//!
//! 除了协调器的心跳剔除，门面还有一个独立的活跃检测：`Connected` 或 `Hosting`
//! 状态下，如果在窗口期内既没有门面流量也没有任何对端活跃（包括心跳），
//! 强制回到 `Disconnected`。

use super::message::{ChatError, ChatMessage};
use super::store::MessageStore;
use crate::config::{LivenessConfig, SessionConfig};
use crate::coordinator::{
    ConnectionEvent, CoordinatorEvents, InboundChat, SessionCoordinator, UNKNOWN_ROOM,
};
use crate::transport::DiscoveryTransport;
use crate::RoomName;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// 消息广播通道容量
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// 连接状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Searching,
    Hosting(RoomName),
    Connected(RoomName),
    Error(String),
}

impl ConnectionState {
    /// 是否处于可收发状态
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected(_) | Self::Hosting(_))
    }
}

struct Facade {
    coordinator: Arc<SessionCoordinator>,
    store: Arc<dyn MessageStore>,
    state_tx: watch::Sender<ConnectionState>,
    message_tx: broadcast::Sender<ChatMessage>,
    room: Mutex<Option<RoomName>>,
    last_activity: Mutex<Instant>,
}

#[derive(Default)]
struct Tasks {
    forwarder: Option<JoinHandle<()>>,
    liveness: Option<JoinHandle<()>>,
}

/// 聊天会话
pub struct ChatSession {
    facade: Arc<Facade>,
    liveness: LivenessConfig,
    /// 协调器事件流，第一次启动时交给转发任务
    events: Mutex<Option<CoordinatorEvents>>,
    tasks: Mutex<Tasks>,
}

impl ChatSession {
    /// 创建新的聊天会话
    pub fn new(
        transport: Arc<dyn DiscoveryTransport>,
        config: SessionConfig,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let (coordinator, events) = SessionCoordinator::new(transport, config);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (message_tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);

        Self {
            facade: Arc::new(Facade {
                coordinator: Arc::new(coordinator),
                store,
                state_tx,
                message_tx,
                room: Mutex::new(None),
                last_activity: Mutex::new(Instant::now()),
            }),
            liveness: LivenessConfig::default(),
            events: Mutex::new(Some(events)),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// 设置活跃检测配置
    pub fn with_liveness(mut self, liveness: LivenessConfig) -> Self {
        self.liveness = liveness;
        self
    }

    /// 以主机身份开始聊天
    pub async fn start_hosting(&self, room: impl Into<RoomName>) -> Result<(), ChatError> {
        let room = room.into();
        self.prepare().await;

        let result = async {
            self.facade.coordinator.initialize().await?;
            self.facade.coordinator.start_hosting(room.clone()).await
        }
        .await;

        if let Err(e) = result {
            tracing::error!("主持房间 {} 失败: {}", room, e);
            self.facade.set_state(ConnectionState::Error(e.to_string()));
            return Err(e.into());
        }

        self.facade.set_room(Some(room.clone()));
        self.facade.touch();
        self.facade.set_state(ConnectionState::Hosting(room));
        self.start_liveness();
        Ok(())
    }

    /// 以客户端身份搜索房间
    pub async fn start_discovering(&self) -> Result<(), ChatError> {
        self.prepare().await;

        let result = async {
            self.facade.coordinator.initialize().await?;
            self.facade.coordinator.start_discovering().await
        }
        .await;

        if let Err(e) = result {
            tracing::error!("搜索房间失败: {}", e);
            self.facade.set_state(ConnectionState::Error(e.to_string()));
            return Err(e.into());
        }

        self.facade.set_room(None);
        self.facade.touch();
        self.facade.set_state(ConnectionState::Searching);
        self.start_liveness();
        Ok(())
    }

    /// 发送聊天消息
    ///
    /// `Error` 状态，或 `Disconnected` 且没有运行中的发现会话时拒绝发送。
    /// `Disconnected` 但会话仍在运行时先尝试投递，没有对端收到就拒绝，
    /// 投递成功则恢复为 `Connected`。其余状态下接受的消息会被存储并发布到消息流，
    /// 即使暂时没有对端收到。
    pub async fn send_message(
        &self,
        sender_id: &str,
        sender_name: &str,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        let state = self.current_state();
        let session_running = self.facade.coordinator.role().is_some();
        let rejected = match state {
            ConnectionState::Error(_) => true,
            ConnectionState::Disconnected => !session_running,
            _ => false,
        };
        if rejected {
            tracing::warn!("当前状态 {:?} 不能发送消息", state);
            return Err(ChatError::NotConnected(state));
        }

        let message = ChatMessage::local(sender_id, sender_name, content);
        let room = self.facade.room_or_unknown();
        let delivered = self
            .facade
            .coordinator
            .send_message(sender_id, sender_name, content)
            .await;

        if state == ConnectionState::Disconnected {
            if !delivered {
                tracing::warn!("未连接且没有对端收到，拒绝消息 {}", message.id);
                return Err(ChatError::NotConnected(state));
            }
            if self.current_state() == ConnectionState::Disconnected {
                self.facade.set_room(Some(room.clone()));
                self.facade.set_state(ConnectionState::Connected(room.clone()));
            }
        } else if !delivered {
            tracing::debug!("消息 {} 已保存，但没有对端收到", message.id);
        }

        self.facade.persist(&room, message.clone()).await;
        let _ = self.facade.message_tx.send(message.clone());
        self.facade.touch();
        Ok(message)
    }

    /// 停止会话
    pub async fn stop(&self) {
        if let Some(liveness) = self.lock_tasks().liveness.take() {
            liveness.abort();
        }
        self.facade.coordinator.stop().await;
        self.facade.set_room(None);
        self.facade.set_state(ConnectionState::Disconnected);
    }

    /// 订阅连接状态
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.facade.state_tx.subscribe()
    }

    /// 订阅消息流
    pub fn subscribe_messages(&self) -> broadcast::Receiver<ChatMessage> {
        self.facade.message_tx.subscribe()
    }

    /// 当前连接状态
    pub fn current_state(&self) -> ConnectionState {
        self.facade.state_tx.borrow().clone()
    }

    /// 当前房间
    pub fn current_room(&self) -> Option<RoomName> {
        self.facade.room()
    }

    /// 当前房间的历史消息
    pub async fn history(&self) -> Result<Vec<ChatMessage>, ChatError> {
        match self.current_room() {
            Some(room) => self.facade.store.list(&room).await,
            None => Ok(Vec::new()),
        }
    }

    /// 清除当前房间的历史消息
    pub async fn clear_history(&self) -> Result<usize, ChatError> {
        match self.current_room() {
            Some(room) => self.facade.store.delete(&room).await,
            None => Ok(0),
        }
    }

    /// 底层协调器
    pub fn coordinator(&self) -> Arc<SessionCoordinator> {
        self.facade.coordinator.clone()
    }

    /// 启动前的准备：转发任务只启动一次，已有会话先停止
    async fn prepare(&self) {
        if self.facade.coordinator.role().is_some() {
            tracing::info!("停止当前会话后重新开始");
            self.stop().await;
        }

        let events = match self.events.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(events) = events {
            let forwarder = tokio::spawn(run_forwarder(self.facade.clone(), events));
            self.lock_tasks().forwarder = Some(forwarder);
        }
    }

    fn start_liveness(&self) {
        let mut tasks = self.lock_tasks();
        if let Some(previous) = tasks.liveness.take() {
            previous.abort();
        }
        tasks.liveness = Some(tokio::spawn(run_liveness(
            self.facade.clone(),
            self.liveness.clone(),
        )));
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Tasks> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        let mut tasks = self.lock_tasks();
        if let Some(forwarder) = tasks.forwarder.take() {
            forwarder.abort();
        }
        if let Some(liveness) = tasks.liveness.take() {
            liveness.abort();
        }
    }
}

impl Facade {
    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::info!("连接状态: {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn room(&self) -> Option<RoomName> {
        match self.room.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn room_or_unknown(&self) -> RoomName {
        self.room().unwrap_or_else(|| UNKNOWN_ROOM.to_string())
    }

    fn set_room(&self, room: Option<RoomName>) {
        match self.room.lock() {
            Ok(mut guard) => *guard = room,
            Err(poisoned) => *poisoned.into_inner() = room,
        }
    }

    fn touch(&self) {
        match self.last_activity.lock() {
            Ok(mut guard) => *guard = Instant::now(),
            Err(poisoned) => *poisoned.into_inner() = Instant::now(),
        }
    }

    fn last_activity(&self) -> Instant {
        match self.last_activity.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    async fn persist(&self, room: &str, message: ChatMessage) {
        if let Err(e) = self.store.append(room, message).await {
            tracing::error!("保存消息失败: {}", e);
        }
    }

    async fn on_inbound(&self, inbound: InboundChat) {
        let message = ChatMessage::remote(inbound.frame);
        tracing::info!("💬 [{}] {}: {}", inbound.room, message.sender_name, message.content);

        self.persist(&inbound.room, message.clone()).await;
        let _ = self.message_tx.send(message);
        self.touch();

        if !self.state().is_live() && self.coordinator.role().is_some() {
            self.set_room(Some(inbound.room.clone()));
            self.set_state(ConnectionState::Connected(inbound.room));
        }
    }

    async fn on_connection(&self, event: ConnectionEvent) {
        if self.coordinator.role().is_none() {
            tracing::debug!("会话已停止，忽略连接事件: {:?}", event);
            return;
        }

        match event {
            ConnectionEvent::ConnectionEstablished { peer, room } => {
                tracing::info!("🔗 已连接到 {} (房间 {})", peer, room);
                self.touch();
                self.set_room(Some(room.clone()));
                self.set_state(ConnectionState::Connected(room));
            }
            ConnectionEvent::ConnectionFailed { peer, error, .. } => {
                if self.coordinator.peer_count().await == 0 {
                    self.set_state(ConnectionState::Error(format!("连接 {} 失败: {}", peer, error)));
                } else {
                    tracing::warn!("连接 {} 失败，保持现有连接: {}", peer, error);
                }
            }
            ConnectionEvent::ConnectionLost {
                peer,
                remaining_peers,
                ..
            } => {
                if remaining_peers == 0 {
                    tracing::warn!("最后一个对端 {} 已断开", peer);
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }
}

async fn run_forwarder(facade: Arc<Facade>, mut events: CoordinatorEvents) {
    loop {
        tokio::select! {
            Some(inbound) = events.messages.recv() => facade.on_inbound(inbound).await,
            Some(event) = events.connections.recv() => facade.on_connection(event).await,
            else => break,
        }
    }
    tracing::debug!("协调器事件流已关闭");
}

async fn run_liveness(facade: Arc<Facade>, config: LivenessConfig) {
    let mut ticker =
        tokio::time::interval_at(Instant::now() + config.check_interval, config.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if !facade.state().is_live() {
            continue;
        }

        let mut last = facade.last_activity();
        if let Some(peer_activity) = facade.coordinator.latest_activity().await {
            last = last.max(peer_activity);
        }

        if last.elapsed() > config.timeout {
            tracing::warn!("超过 {:?} 没有任何流量，判定连接已断开", config.timeout);
            facade.set_state(ConnectionState::Disconnected);
        }
    }
}
