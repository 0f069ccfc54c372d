//! 会话协调器
//!
//! 拥有一个活跃的发现会话（主机或客户端角色），驱动握手流程，
//! 并通过两条独立的事件流输出入站聊天帧和连接事件。
//!
//! 每个发现会话有一个事件泵任务，串行处理发现事件、入站帧、承载网络结果、
//! 超时剔除和承载网络丢失。`stop()` 会递增纪元号，旧纪元的承载结果一律丢弃。

use crate::config::SessionConfig;
use crate::keepalive::KeepAliveMonitor;
use crate::registry::{PeerRegistry, RegisteredPeer};
use crate::transport::{
    AttachHandle, BearerError, BearerHandle, BearerRequest, DatagramOutbox, DiscoverySession,
    DiscoveryTransport, PeerHandle, PeerKey, SessionEvent, SessionId,
};
use crate::wire::{ChatFrame, WireFrame};
use crate::{AwareError, Result, RoomName};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// 发现事件没有附带房间名时使用的名称
pub const UNKNOWN_ROOM: &str = "Unknown";

/// 协调器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Attaching,
    Attached,
    Hosting,
    Discovering,
    PeerFound,
    AwaitingBearer,
    Active,
    Terminated,
}

/// 会话角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// 发布房间的一方
    Host,
    /// 订阅并加入房间的一方
    Client,
}

impl Role {
    /// 没有活跃对端时回落到的状态
    fn idle_state(self) -> CoordinatorState {
        match self {
            Self::Host => CoordinatorState::Hosting,
            Self::Client => CoordinatorState::Discovering,
        }
    }
}

/// 连接丢失原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostReason {
    /// 传输层报告承载网络丢失
    BearerLost,
    /// 超过心跳超时没有任何流量
    Stale,
}

/// 连接事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// 承载网络建立成功，对端已注册
    ConnectionEstablished { peer: PeerKey, room: RoomName },

    /// 承载网络请求失败（不会自动重试）
    ConnectionFailed {
        peer: PeerKey,
        room: RoomName,
        error: BearerError,
    },

    /// 已注册的对端丢失
    ConnectionLost {
        peer: PeerKey,
        room: RoomName,
        reason: LostReason,
        /// 剔除后剩余的对端数量
        remaining_peers: usize,
    },
}

/// 入站聊天帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundChat {
    pub peer: PeerKey,
    pub room: RoomName,
    pub frame: ChatFrame,
}

/// 协调器输出的事件流
pub struct CoordinatorEvents {
    pub messages: mpsc::UnboundedReceiver<InboundChat>,
    pub connections: mpsc::UnboundedReceiver<ConnectionEvent>,
}

struct Inner {
    state: CoordinatorState,
    role: Option<Role>,
    room: Option<RoomName>,
    epoch: u64,
    attach: Option<AttachHandle>,
    session: Option<SessionId>,
    outbox: Option<Arc<DatagramOutbox>>,
    monitor: Option<Arc<KeepAliveMonitor>>,
    pump: Option<JoinHandle<()>>,
    /// 正在进行的承载网络请求，按对端去重
    bearers: HashMap<PeerKey, JoinHandle<()>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: CoordinatorState::Idle,
            role: None,
            room: None,
            epoch: 0,
            attach: None,
            session: None,
            outbox: None,
            monitor: None,
            pump: None,
            bearers: HashMap::new(),
        }
    }
}

struct Shared {
    transport: Arc<dyn DiscoveryTransport>,
    config: SessionConfig,
    registry: Arc<PeerRegistry>,
    inner: Mutex<Inner>,
    message_tx: mpsc::UnboundedSender<InboundChat>,
    connection_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

/// 事件泵持有的会话上下文
struct PumpContext {
    epoch: u64,
    session: SessionId,
    role: Role,
    room: Option<RoomName>,
    outbox: Arc<DatagramOutbox>,
    monitor: Arc<KeepAliveMonitor>,
    bearer_tx: mpsc::UnboundedSender<BearerOutcome>,
    /// 发现阶段记录的房间名
    known_rooms: HashMap<PeerKey, RoomName>,
}

struct BearerOutcome {
    epoch: u64,
    peer: PeerHandle,
    room: RoomName,
    result: std::result::Result<BearerHandle, BearerError>,
}

/// 会话协调器
pub struct SessionCoordinator {
    shared: Arc<Shared>,
}

impl SessionCoordinator {
    /// 创建新的协调器，返回协调器和事件流
    pub fn new(
        transport: Arc<dyn DiscoveryTransport>,
        config: SessionConfig,
    ) -> (Self, CoordinatorEvents) {
        let (message_tx, messages) = mpsc::unbounded_channel();
        let (connection_tx, connections) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            transport,
            config,
            registry: Arc::new(PeerRegistry::new()),
            inner: Mutex::new(Inner::default()),
            message_tx,
            connection_tx,
        });

        (
            Self { shared },
            CoordinatorEvents {
                messages,
                connections,
            },
        )
    }

    /// 附着到近场能力
    ///
    /// 已附着时不做任何事。失败时状态恢复原值，可以重试。
    pub async fn initialize(&self) -> Result<()> {
        let (previous, epoch) = {
            let mut inner = self.shared.lock();
            match inner.state {
                CoordinatorState::Idle | CoordinatorState::Terminated => {
                    let previous = inner.state;
                    inner.state = CoordinatorState::Attaching;
                    (previous, inner.epoch)
                }
                CoordinatorState::Attaching => {
                    return Err(AwareError::InvalidState {
                        operation: "initialize",
                        state: inner.state,
                    });
                }
                _ => return Ok(()),
            }
        };

        tracing::info!("附着近场能力...");
        match self.shared.transport.attach().await {
            Ok(handle) => {
                let mut inner = self.shared.lock();
                if inner.epoch != epoch {
                    drop(inner);
                    self.shared.transport.detach(&handle);
                    return Err(AwareError::Transport("附着期间协调器已停止".to_string()));
                }
                inner.attach = Some(handle);
                inner.state = CoordinatorState::Attached;
                tracing::info!("✅ 近场能力已附着");
                Ok(())
            }
            Err(e) => {
                let mut inner = self.shared.lock();
                if inner.epoch == epoch {
                    inner.state = previous;
                }
                tracing::error!("附着失败: {}", e);
                Err(e.into())
            }
        }
    }

    /// 以主机身份发布房间
    pub async fn start_hosting(&self, room: impl Into<RoomName>) -> Result<()> {
        let room = room.into();
        let (attach, epoch) = self.shared.attached_handle("start_hosting")?;

        let session = self
            .shared
            .transport
            .publish(&attach, &self.shared.config.service_name, &room)
            .await?;

        tracing::info!("🏠 开始主持房间: {} ({})", room, session.id);
        self.shared.launch(session, epoch, Role::Host, Some(room))
    }

    /// 以客户端身份搜索房间
    pub async fn start_discovering(&self) -> Result<()> {
        let (attach, epoch) = self.shared.attached_handle("start_discovering")?;

        let session = self
            .shared
            .transport
            .subscribe(&attach, &self.shared.config.service_name)
            .await?;

        tracing::info!("🔍 开始搜索房间 ({})", session.id);
        self.shared.launch(session, epoch, Role::Client, None)
    }

    /// 向所有已注册对端发送聊天帧
    ///
    /// 至少一个对端发送成功时返回 true。没有对端时不发送任何数据。
    pub async fn send_message(&self, sender_id: &str, sender_name: &str, content: &str) -> bool {
        let outbox = self.shared.lock().outbox.clone();
        let outbox = match outbox {
            Some(outbox) => outbox,
            None => {
                tracing::debug!("没有活跃的发现会话，消息未发送");
                return false;
            }
        };

        let handles = self.shared.registry.handles().await;
        if handles.is_empty() {
            tracing::debug!("没有已连接的对端，消息未发送");
            return false;
        }

        let frame = WireFrame::Chat(ChatFrame::new(sender_id, sender_name, content));
        let delivered = outbox.broadcast(&handles, &frame);
        tracing::debug!("消息已发送到 {}/{} 个对端", delivered, handles.len());
        delivered > 0
    }

    /// 停止会话并释放所有资源（可重复调用）
    pub async fn stop(&self) {
        let (session, attach, pump, bearers, monitor) = {
            let mut inner = self.shared.lock();
            let already_stopped = inner.state == CoordinatorState::Terminated
                && inner.session.is_none()
                && inner.attach.is_none();
            inner.epoch += 1;
            inner.state = CoordinatorState::Terminated;
            inner.role = None;
            inner.room = None;
            inner.outbox = None;
            let drained: Vec<JoinHandle<()>> = inner.bearers.drain().map(|(_, task)| task).collect();
            let taken = (
                inner.session.take(),
                inner.attach.take(),
                inner.pump.take(),
                drained,
                inner.monitor.take(),
            );
            if already_stopped {
                tracing::debug!("协调器已停止");
            }
            taken
        };

        if let Some(pump) = pump {
            pump.abort();
        }
        for task in bearers {
            task.abort();
        }
        if let Some(monitor) = monitor {
            monitor.stop();
        }
        if let Some(session) = session {
            self.shared.transport.close_session(session);
        }
        if let Some(attach) = attach {
            self.shared.transport.detach(&attach);
        }

        let cleared = self.shared.registry.clear().await;
        tracing::info!("⏹️ 协调器已停止，清除 {} 个对端", cleared);
    }

    /// 当前状态
    pub fn state(&self) -> CoordinatorState {
        self.shared.lock().state
    }

    /// 当前角色
    pub fn role(&self) -> Option<Role> {
        self.shared.lock().role
    }

    /// 主机端发布的房间名
    pub fn room(&self) -> Option<RoomName> {
        self.shared.lock().room.clone()
    }

    /// 已注册对端数量
    pub async fn peer_count(&self) -> usize {
        self.shared.registry.len().await
    }

    /// 已注册对端列表
    pub async fn peers(&self) -> Vec<RegisteredPeer> {
        self.shared.registry.peers().await
    }

    /// 对端注册表
    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.shared.registry.clone()
    }

    /// 所有对端中最近一次活跃时间（包括心跳）
    pub async fn latest_activity(&self) -> Option<Instant> {
        self.shared.registry.latest_activity().await
    }

    /// 获取配置
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        for (_, task) in inner.bearers.drain() {
            task.abort();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn attached_handle(&self, operation: &'static str) -> Result<(AttachHandle, u64)> {
        let inner = self.lock();
        match (&inner.state, &inner.attach) {
            (CoordinatorState::Attached, Some(attach)) => Ok((attach.clone(), inner.epoch)),
            _ => Err(AwareError::InvalidState {
                operation,
                state: inner.state,
            }),
        }
    }

    /// 发现会话打开后启动事件泵和心跳监视器
    fn launch(
        self: &Arc<Self>,
        session: DiscoverySession,
        epoch: u64,
        role: Role,
        room: Option<RoomName>,
    ) -> Result<()> {
        let DiscoverySession { id, events } = session;

        let mut inner = self.lock();
        if inner.epoch != epoch || inner.state != CoordinatorState::Attached {
            let state = inner.state;
            drop(inner);
            self.transport.close_session(id);
            return Err(AwareError::InvalidState {
                operation: "launch",
                state,
            });
        }

        let outbox = Arc::new(DatagramOutbox::new(self.transport.clone(), id));
        let (stale_tx, stale_rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(KeepAliveMonitor::new(
            self.config.keep_alive.clone(),
            self.registry.clone(),
            outbox.clone(),
            stale_tx,
        ));
        let (bearer_tx, bearer_rx) = mpsc::unbounded_channel();

        let ctx = PumpContext {
            epoch,
            session: id,
            role,
            room: room.clone(),
            outbox: outbox.clone(),
            monitor: monitor.clone(),
            bearer_tx,
            known_rooms: HashMap::new(),
        };

        inner.state = role.idle_state();
        inner.role = Some(role);
        inner.room = room;
        inner.session = Some(id);
        inner.outbox = Some(outbox);
        inner.monitor = Some(monitor);
        inner.pump = Some(tokio::spawn(run_pump(
            self.clone(),
            ctx,
            events,
            stale_rx,
            bearer_rx,
        )));
        Ok(())
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.connection_tx.send(event);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock().epoch == epoch
    }

    /// 根据注册表和进行中的请求重新计算状态
    async fn refresh_state(&self, ctx: &PumpContext) {
        let active = !self.registry.is_empty().await;
        let mut inner = self.lock();
        if inner.epoch != ctx.epoch {
            return;
        }
        inner.state = if active {
            CoordinatorState::Active
        } else if !inner.bearers.is_empty() {
            CoordinatorState::AwaitingBearer
        } else {
            ctx.role.idle_state()
        };
    }

    fn set_state_if(&self, epoch: u64, from: &[CoordinatorState], to: CoordinatorState) {
        let mut inner = self.lock();
        if inner.epoch == epoch && from.contains(&inner.state) {
            inner.state = to;
        }
    }

    /// 对端已注册或正在请求承载网络
    async fn is_known(&self, key: &str) -> bool {
        let pending = self.lock().bearers.contains_key(key);
        pending || self.registry.contains(key).await
    }

    /// 为对端发起承载网络请求（已在进行中则忽略）
    fn spawn_bearer(self: &Arc<Self>, ctx: &PumpContext, peer: PeerHandle, room: RoomName) {
        let (settle, port) = match ctx.role {
            Role::Host => (None, Some(self.config.port)),
            Role::Client => (Some(self.config.settle_delay), None),
        };
        let request = BearerRequest {
            passphrase: self.config.passphrase.clone(),
            port,
            timeout: self.config.bearer_timeout,
        };

        let mut inner = self.lock();
        if inner.epoch != ctx.epoch || inner.bearers.contains_key(peer.key()) {
            return;
        }

        let key = peer.key().to_string();
        let task = tokio::spawn(request_bearer(
            self.clone(),
            ctx.epoch,
            ctx.session,
            peer,
            room,
            request,
            settle,
            ctx.bearer_tx.clone(),
        ));
        inner.bearers.insert(key, task);
    }

    async fn handle_session_event(self: &Arc<Self>, ctx: &mut PumpContext, event: SessionEvent) {
        match event {
            SessionEvent::ServiceDiscovered { peer, service_info } => {
                self.handle_discovery(ctx, peer, service_info).await;
            }
            SessionEvent::MessageReceived { peer, payload } => {
                self.handle_datagram(ctx, peer, &payload).await;
            }
            SessionEvent::BearerLost { peer } => {
                match self.registry.remove(peer.key()).await {
                    Some(lost) => self.report_lost(ctx, lost, LostReason::BearerLost).await,
                    None => tracing::debug!("未注册对端 {} 的承载网络丢失，忽略", peer),
                }
            }
        }
    }

    async fn handle_discovery(
        self: &Arc<Self>,
        ctx: &mut PumpContext,
        peer: PeerHandle,
        service_info: Vec<u8>,
    ) {
        if ctx.role != Role::Client {
            tracing::debug!("主机会话忽略发现事件: {}", peer);
            return;
        }

        let room = room_from_service_info(&service_info);
        ctx.known_rooms.insert(peer.key().to_string(), room.clone());

        if self.is_known(peer.key()).await {
            tracing::debug!("重复发现对端 {}，忽略", peer);
            return;
        }

        tracing::info!("📡 发现房间: {} ({})", room, peer);
        self.set_state_if(
            ctx.epoch,
            &[CoordinatorState::Discovering],
            CoordinatorState::PeerFound,
        );

        if let Err(e) = ctx.outbox.send(&peer, &WireFrame::ConnectRequest) {
            tracing::warn!("向 {} 发送连接请求失败: {}", peer, e);
        }
        self.spawn_bearer(ctx, peer, room);
    }

    async fn handle_datagram(self: &Arc<Self>, ctx: &mut PumpContext, peer: PeerHandle, payload: &[u8]) {
        let frame = match WireFrame::parse(payload) {
            Ok(frame) => frame,
            Err(e) => {
                ctx.monitor.on_traffic(&peer).await;
                tracing::warn!("丢弃来自 {} 的无效帧: {}", peer, e);
                return;
            }
        };

        match frame {
            WireFrame::ConnectRequest => {
                ctx.monitor.on_traffic(&peer).await;
                if ctx.role != Role::Host {
                    tracing::debug!("客户端会话忽略来自 {} 的连接请求", peer);
                    return;
                }
                if self.is_known(peer.key()).await {
                    tracing::debug!("对端 {} 已连接或正在连接，忽略重复请求", peer);
                    return;
                }

                tracing::info!("🤝 收到 {} 的连接请求", peer);
                self.set_state_if(
                    ctx.epoch,
                    &[CoordinatorState::Hosting],
                    CoordinatorState::AwaitingBearer,
                );
                let room = ctx.room.clone().unwrap_or_else(|| UNKNOWN_ROOM.to_string());
                self.spawn_bearer(ctx, peer, room);
            }
            WireFrame::KeepAlive => ctx.monitor.on_keep_alive(&peer).await,
            WireFrame::KeepAliveAck => ctx.monitor.on_keep_alive_ack(&peer).await,
            WireFrame::Chat(frame) => {
                ctx.monitor.on_traffic(&peer).await;
                let room = self.room_for(ctx, peer.key()).await;
                tracing::debug!("收到 {} 的聊天消息 (房间 {})", frame.sender_name, room);
                let _ = self.message_tx.send(InboundChat {
                    peer: peer.key().to_string(),
                    room,
                    frame,
                });
            }
        }
    }

    async fn handle_bearer_outcome(&self, ctx: &PumpContext, outcome: BearerOutcome) {
        if outcome.epoch != ctx.epoch || !self.is_current(outcome.epoch) {
            tracing::debug!("丢弃过期的承载网络结果: {}", outcome.peer);
            return;
        }
        self.lock().bearers.remove(outcome.peer.key());

        let key = outcome.peer.key().to_string();
        match outcome.result {
            Ok(bearer) => {
                self.registry
                    .record(outcome.peer, outcome.room.clone(), ctx.session)
                    .await;
                ctx.monitor.start();
                tracing::info!("✅ 与 {} 的承载网络已建立 (#{})", key, bearer.id);
                self.refresh_state(ctx).await;
                self.emit(ConnectionEvent::ConnectionEstablished {
                    peer: key,
                    room: outcome.room,
                });
            }
            Err(error) => {
                tracing::warn!("❌ 与 {} 的承载网络请求失败: {}", key, error);
                self.refresh_state(ctx).await;
                self.emit(ConnectionEvent::ConnectionFailed {
                    peer: key,
                    room: outcome.room,
                    error,
                });
            }
        }
    }

    async fn report_lost(&self, ctx: &PumpContext, peer: RegisteredPeer, reason: LostReason) {
        let remaining_peers = self.registry.len().await;
        tracing::warn!(
            "🔌 对端 {} 已断开 ({:?})，剩余 {} 个对端",
            peer.key(),
            reason,
            remaining_peers
        );

        if remaining_peers == 0 {
            ctx.monitor.stop();
        }
        self.refresh_state(ctx).await;
        self.emit(ConnectionEvent::ConnectionLost {
            peer: peer.key().to_string(),
            room: peer.room,
            reason,
            remaining_peers,
        });
    }

    async fn room_for(&self, ctx: &PumpContext, key: &str) -> RoomName {
        if let Some(peer) = self.registry.get(key).await {
            return peer.room;
        }
        ctx.known_rooms
            .get(key)
            .cloned()
            .or_else(|| ctx.room.clone())
            .unwrap_or_else(|| UNKNOWN_ROOM.to_string())
    }
}

/// 从服务附加信息解析房间名
fn room_from_service_info(service_info: &[u8]) -> RoomName {
    if service_info.is_empty() {
        return UNKNOWN_ROOM.to_string();
    }
    String::from_utf8_lossy(service_info).into_owned()
}

async fn run_pump(
    shared: Arc<Shared>,
    mut ctx: PumpContext,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut stale_rx: mpsc::UnboundedReceiver<RegisteredPeer>,
    mut bearer_rx: mpsc::UnboundedReceiver<BearerOutcome>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => shared.handle_session_event(&mut ctx, event).await,
                None => {
                    tracing::warn!("发现会话 {} 的事件流已关闭", ctx.session);
                    ctx.monitor.stop();
                    break;
                }
            },
            Some(outcome) = bearer_rx.recv() => {
                shared.handle_bearer_outcome(&ctx, outcome).await;
            }
            Some(peer) = stale_rx.recv() => {
                shared.report_lost(&ctx, peer, LostReason::Stale).await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn request_bearer(
    shared: Arc<Shared>,
    epoch: u64,
    session: SessionId,
    peer: PeerHandle,
    room: RoomName,
    request: BearerRequest,
    settle: Option<Duration>,
    outcome_tx: mpsc::UnboundedSender<BearerOutcome>,
) {
    if let Some(delay) = settle {
        tokio::time::sleep(delay).await;
    }
    shared.set_state_if(
        epoch,
        &[CoordinatorState::PeerFound, CoordinatorState::Discovering],
        CoordinatorState::AwaitingBearer,
    );

    tracing::info!("请求到 {} 的承载网络...", peer);
    let ceiling = request.timeout;
    let result = match tokio::time::timeout(
        ceiling,
        shared.transport.request_bearer(session, &peer, request),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(BearerError::Timeout(ceiling)),
    };

    let _ = outcome_tx.send(BearerOutcome {
        epoch,
        peer,
        room,
        result,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BearerPolicy, MemoryMesh, MemoryTransport};

    fn coordinator(device: &MemoryTransport) -> (SessionCoordinator, CoordinatorEvents) {
        SessionCoordinator::new(Arc::new(device.clone()), SessionConfig::default())
    }

    async fn next_connection(events: &mut CoordinatorEvents) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(120), events.connections.recv())
            .await
            .unwrap()
            .unwrap()
    }

    struct Pair {
        mesh: MemoryMesh,
        host_device: MemoryTransport,
        client_device: MemoryTransport,
        host: SessionCoordinator,
        host_events: CoordinatorEvents,
        client: SessionCoordinator,
        client_events: CoordinatorEvents,
    }

    async fn pair() -> Pair {
        let mesh = MemoryMesh::new();
        let host_device = mesh.device("host");
        let client_device = mesh.device("client");
        let (host, host_events) = coordinator(&host_device);
        let (client, client_events) = coordinator(&client_device);

        host.initialize().await.unwrap();
        host.start_hosting("room1").await.unwrap();
        client.initialize().await.unwrap();
        client.start_discovering().await.unwrap();

        Pair {
            mesh,
            host_device,
            client_device,
            host,
            host_events,
            client,
            client_events,
        }
    }

    async fn connected_pair() -> Pair {
        let mut pair = pair().await;
        assert!(matches!(
            next_connection(&mut pair.host_events).await,
            ConnectionEvent::ConnectionEstablished { .. }
        ));
        assert!(matches!(
            next_connection(&mut pair.client_events).await,
            ConnectionEvent::ConnectionEstablished { .. }
        ));
        pair
    }

    #[tokio::test]
    async fn test_initialize_unavailable_then_retry() {
        let mesh = MemoryMesh::new();
        let device = mesh.device("a");
        let (coordinator, _events) = coordinator(&device);

        device.set_available(false);
        let err = coordinator.initialize().await.unwrap_err();
        assert!(matches!(err, AwareError::Attach(crate::AttachError::Unavailable(_))));
        assert_eq!(coordinator.state(), CoordinatorState::Idle);

        device.set_available(true);
        coordinator.initialize().await.unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Attached);

        // 已附着时再次调用不做任何事
        coordinator.initialize().await.unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Attached);
    }

    #[tokio::test]
    async fn test_start_requires_attached() {
        let mesh = MemoryMesh::new();
        let (coordinator, _events) = coordinator(&mesh.device("a"));

        let err = coordinator.start_hosting("room1").await.unwrap_err();
        assert!(matches!(
            err,
            AwareError::InvalidState {
                operation: "start_hosting",
                state: CoordinatorState::Idle
            }
        ));

        coordinator.initialize().await.unwrap();
        coordinator.start_hosting("room1").await.unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Hosting);
        assert_eq!(coordinator.role(), Some(Role::Host));
        assert_eq!(coordinator.room(), Some("room1".to_string()));

        assert!(coordinator.start_discovering().await.is_err());
    }

    #[tokio::test]
    async fn test_send_without_peers() {
        let mesh = MemoryMesh::new();
        let device = mesh.device("a");
        let (coordinator, _events) = coordinator(&device);

        assert!(!coordinator.send_message("alice", "Alice", "hi").await);

        coordinator.initialize().await.unwrap();
        coordinator.start_hosting("room1").await.unwrap();
        assert!(!coordinator.send_message("alice", "Alice", "hi").await);
        assert!(device.sent_datagrams().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_client_handshake() {
        let mut pair = pair().await;

        assert_eq!(
            next_connection(&mut pair.host_events).await,
            ConnectionEvent::ConnectionEstablished {
                peer: pair.client_device.session_handles()[0].key().to_string(),
                room: "room1".to_string(),
            }
        );
        assert_eq!(
            next_connection(&mut pair.client_events).await,
            ConnectionEvent::ConnectionEstablished {
                peer: pair.host_device.session_handles()[0].key().to_string(),
                room: "room1".to_string(),
            }
        );

        assert_eq!(pair.host.state(), CoordinatorState::Active);
        assert_eq!(pair.client.state(), CoordinatorState::Active);
        assert_eq!(pair.host.peer_count().await, 1);
        assert_eq!(pair.client.peer_count().await, 1);

        assert!(pair.client.send_message("alice", "Alice", "hi").await);
        let inbound = pair.host_events.messages.recv().await.unwrap();
        assert_eq!(inbound.frame, ChatFrame::new("alice", "Alice", "hi"));
        assert_eq!(inbound.room, "room1");

        // 客户端发出的第一帧是 CONNECT_REQUEST
        let host_key = pair.host_device.session_handles()[0].key().to_string();
        let sent = pair.client_device.sent_payloads_to(&host_key);
        assert_eq!(sent[0], b"CONNECT_REQUEST".to_vec());
        assert!(sent.contains(&b"alice|Alice|hi".to_vec()));

        // 主机使用固定端口请求承载网络，客户端等待后才请求
        assert_eq!(pair.host.config().port, 8888);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_discovery_single_bearer() {
        let mut pair = pair().await;
        pair.mesh.announce();
        pair.mesh.announce();

        next_connection(&mut pair.client_events).await;
        pair.mesh.announce();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let host_key = pair.host_device.session_handles()[0].key().to_string();
        assert_eq!(pair.client_device.bearer_request_count(&host_key), 1);
        assert!(pair.client_events.connections.try_recv().is_err());

        let client_key = pair.client_device.session_handles()[0].key().to_string();
        assert_eq!(pair.host_device.bearer_request_count(&client_key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bearer_timeout_reports_failure() {
        let mesh = MemoryMesh::new();
        let host_device = mesh.device("host");
        let client_device = mesh.device("client");
        client_device.set_bearer_policy(BearerPolicy::Hang);

        let (host, _host_events) = coordinator(&host_device);
        let (client, mut client_events) = coordinator(&client_device);
        host.initialize().await.unwrap();
        host.start_hosting("room1").await.unwrap();
        client.initialize().await.unwrap();
        client.start_discovering().await.unwrap();

        match next_connection(&mut client_events).await {
            ConnectionEvent::ConnectionFailed { room, error, .. } => {
                assert_eq!(room, "room1");
                assert_eq!(error, BearerError::Timeout(Duration::from_secs(30)));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(client.peer_count().await, 0);
        assert_eq!(client.state(), CoordinatorState::Discovering);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bearer_rejected_is_not_retried() {
        let mesh = MemoryMesh::new();
        let host_device = mesh.device("host");
        let client_device = mesh.device("client");
        client_device.set_bearer_policy(BearerPolicy::Reject);

        let (host, _host_events) = coordinator(&host_device);
        let (client, mut client_events) = coordinator(&client_device);
        host.initialize().await.unwrap();
        host.start_hosting("room1").await.unwrap();
        client.initialize().await.unwrap();
        client.start_discovering().await.unwrap();

        assert!(matches!(
            next_connection(&mut client_events).await,
            ConnectionEvent::ConnectionFailed {
                error: BearerError::Rejected(_),
                ..
            }
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        let host_key = host_device.session_handles()[0].key().to_string();
        assert_eq!(client_device.bearer_request_count(&host_key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bearer_lost_falls_back_to_role_state() {
        let mut pair = connected_pair().await;

        pair.client_device.drop_bearers();

        match next_connection(&mut pair.client_events).await {
            ConnectionEvent::ConnectionLost {
                reason,
                remaining_peers,
                room,
                ..
            } => {
                assert_eq!(reason, LostReason::BearerLost);
                assert_eq!(remaining_peers, 0);
                assert_eq!(room, "room1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(pair.client.state(), CoordinatorState::Discovering);

        assert!(matches!(
            next_connection(&mut pair.host_events).await,
            ConnectionEvent::ConnectionLost {
                reason: LostReason::BearerLost,
                ..
            }
        ));
        assert_eq!(pair.host.state(), CoordinatorState::Hosting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_peers_alive() {
        let mut pair = connected_pair().await;

        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(pair.host.peer_count().await, 1);
        assert_eq!(pair.client.peer_count().await, 1);
        assert!(pair.client_events.connections.try_recv().is_err());

        let host_key = pair.host_device.session_handles()[0].key().to_string();
        let sent = pair.client_device.sent_payloads_to(&host_key);
        assert!(sent.contains(&b"KEEP_ALIVE".to_vec()));
        assert!(sent.contains(&b"KEEP_ALIVE_ACK".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_reported_stale_once() {
        let mut pair = connected_pair().await;

        pair.host_device.set_partitioned(true);

        match next_connection(&mut pair.client_events).await {
            ConnectionEvent::ConnectionLost {
                reason,
                remaining_peers,
                ..
            } => {
                assert_eq!(reason, LostReason::Stale);
                assert_eq!(remaining_peers, 0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(pair.client.state(), CoordinatorState::Discovering);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(pair.client_events.connections.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_garbage_is_dropped() {
        let mut pair = connected_pair().await;

        let host_handle = pair.host_device.session_handles()[0].clone();
        let session_id = pair.client_device.session_ids()[0];
        pair.client_device
            .send_datagram(session_id, &host_handle, 100, b"no delimiters here")
            .unwrap();
        pair.client_device
            .send_datagram(session_id, &host_handle, 101, b"bob|Bob|a|b")
            .unwrap();

        let inbound = pair.host_events.messages.recv().await.unwrap();
        assert_eq!(inbound.frame, ChatFrame::new("bob", "Bob", "a|b"));
        assert!(pair.host_events.messages.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_survives_failing_peer() {
        let mesh = MemoryMesh::new();
        let host_device = mesh.device("host");
        let first_device = mesh.device("first");
        let second_device = mesh.device("second");
        let (host, mut host_events) = coordinator(&host_device);
        let (first, mut first_events) = coordinator(&first_device);
        let (second, mut second_events) = coordinator(&second_device);

        host.initialize().await.unwrap();
        host.start_hosting("room1").await.unwrap();
        for (client, events) in [(&first, &mut first_events), (&second, &mut second_events)] {
            client.initialize().await.unwrap();
            client.start_discovering().await.unwrap();
            assert!(matches!(
                next_connection(events).await,
                ConnectionEvent::ConnectionEstablished { .. }
            ));
        }
        for _ in 0..2 {
            assert!(matches!(
                next_connection(&mut host_events).await,
                ConnectionEvent::ConnectionEstablished { .. }
            ));
        }
        assert_eq!(host.peer_count().await, 2);

        // 第一个客户端的会话消失，主机仍然登记着它，发送会得到 UnknownPeer
        let first_key = first_device.session_handles()[0].key().to_string();
        first.stop().await;
        assert_eq!(host.peer_count().await, 2);

        assert!(host.send_message("h", "Host", "hello").await);
        assert!(host_device
            .sent_payloads_to(&first_key)
            .iter()
            .any(|p| p.as_slice() == b"h|Host|hello"));

        let inbound = tokio::time::timeout(Duration::from_secs(5), second_events.messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.frame, ChatFrame::new("h", "Host", "hello"));
        assert_eq!(inbound.room, "room1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_restartable() {
        let pair = connected_pair().await;

        pair.host.stop().await;
        pair.host.stop().await;
        assert_eq!(pair.host.state(), CoordinatorState::Terminated);
        assert_eq!(pair.host.peer_count().await, 0);
        assert!(pair.host_device.session_handles().is_empty());
        assert!(!pair.host.send_message("h", "Host", "bye").await);

        pair.host.initialize().await.unwrap();
        pair.host.start_hosting("room2").await.unwrap();
        assert_eq!(pair.host.state(), CoordinatorState::Hosting);
        assert_eq!(pair.host.room(), Some("room2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_pending_bearer() {
        let mesh = MemoryMesh::new();
        let host_device = mesh.device("host");
        let client_device = mesh.device("client");
        client_device.set_bearer_policy(BearerPolicy::Hang);

        let (host, _host_events) = coordinator(&host_device);
        let (client, mut client_events) = coordinator(&client_device);
        host.initialize().await.unwrap();
        host.start_hosting("room1").await.unwrap();
        client.initialize().await.unwrap();
        client.start_discovering().await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        client.stop().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(client_events.connections.try_recv().is_err());
        assert_eq!(client.peer_count().await, 0);
    }

    #[test]
    fn test_room_from_service_info() {
        assert_eq!(room_from_service_info(b"room1"), "room1");
        assert_eq!(room_from_service_info(b""), "Unknown");
    }
}
