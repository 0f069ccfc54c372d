//! 基于 libp2p 的局域网传输
//!
//! 用 mDNS 发现同一局域网内的节点，再通过 `service-info` 协议查询对方发布的服务和房间。
//! 数据报走 `datagram` 协议，承载网络就是一条存活的 libp2p 连接：请求时拨号，
//! 连接建立即成功，到对端的最后一条连接关闭时报告 `BearerLost`。
//!
//! Swarm 由驱动任务独占，外部通过命令通道与之交互。

use super::codec::{
    DatagramCodec, DatagramProtocol, ServiceAdvert, ServiceInfoCodec, ServiceInfoProtocol,
    ServiceQuery,
};
use super::config::P2pConfig;
use crate::transport::{
    AttachError, AttachHandle, BearerError, BearerHandle, BearerRequest, DiscoverySession,
    DiscoveryTransport, PeerHandle, SendError, SessionEvent, SessionId,
};
use crate::{AwareError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    identity::Keypair,
    mdns, noise,
    request_response::{self, ProtocolSupport},
    swarm::SwarmEvent,
    tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// 组合的 Behaviour：mDNS 发现、服务信息查询和数据报
#[derive(libp2p::swarm::NetworkBehaviour)]
struct AwareBehaviour {
    mdns: mdns::tokio::Behaviour,
    service_info: request_response::Behaviour<ServiceInfoCodec>,
    datagram: request_response::Behaviour<DatagramCodec>,
}

enum Command {
    Attach {
        reply: oneshot::Sender<AttachHandle>,
    },
    Open {
        attach: AttachHandle,
        kind: SessionKind,
        reply: oneshot::Sender<std::result::Result<DiscoverySession, AttachError>>,
    },
    Datagram {
        session: SessionId,
        peer: PeerId,
        payload: Vec<u8>,
    },
    Bearer {
        session: SessionId,
        peer: PeerHandle,
        peer_id: PeerId,
        reply: oneshot::Sender<std::result::Result<BearerHandle, BearerError>>,
    },
    Close(SessionId),
    Detach(AttachHandle),
    Shutdown,
}

#[derive(Debug, Clone)]
enum SessionKind {
    Publish { service: String, room: String },
    Subscribe { service: String },
}

struct SessionEntry {
    kind: SessionKind,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

struct BearerWaiter {
    id: u64,
    session: SessionId,
    peer: PeerHandle,
    reply: oneshot::Sender<std::result::Result<BearerHandle, BearerError>>,
}

/// libp2p 局域网传输
pub struct P2pTransport {
    local_peer_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    open_sessions: Mutex<HashSet<SessionId>>,
    max_datagram_size: usize,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl P2pTransport {
    /// 创建传输层并启动驱动任务
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn new(config: P2pConfig) -> Result<Self> {
        let swarm = build_swarm(&config)?;
        let local_peer_id = *swarm.local_peer_id();
        tracing::info!("本地 Peer ID: {}", local_peer_id);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            swarm,
            attach: None,
            next_id: 0,
            sessions: HashMap::new(),
            discovered: HashMap::new(),
            bearers: Vec::new(),
            waiters: HashMap::new(),
        };

        Ok(Self {
            local_peer_id,
            commands,
            open_sessions: Mutex::new(HashSet::new()),
            max_datagram_size: config.max_datagram_size,
            driver: Mutex::new(Some(tokio::spawn(driver.run(command_rx)))),
        })
    }

    /// 本地 Peer ID
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn is_open(&self, session: SessionId) -> bool {
        match self.open_sessions.lock() {
            Ok(guard) => guard.contains(&session),
            Err(poisoned) => poisoned.into_inner().contains(&session),
        }
    }

    fn set_open(&self, session: SessionId, open: bool) {
        let mut sessions = match self.open_sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if open {
            sessions.insert(session);
        } else {
            sessions.remove(&session);
        }
    }

    async fn open(
        &self,
        attach: &AttachHandle,
        kind: SessionKind,
    ) -> std::result::Result<DiscoverySession, AttachError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Open {
                attach: attach.clone(),
                kind,
                reply,
            })
            .map_err(|_| driver_gone())?;

        let session = rx.await.map_err(|_| driver_gone())??;
        self.set_open(session.id, true);
        Ok(session)
    }
}

impl Drop for P2pTransport {
    fn drop(&mut self) {
        if self.commands.send(Command::Shutdown).is_ok() {
            return;
        }
        let driver = match self.driver.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(driver) = driver {
            driver.abort();
        }
    }
}

fn driver_gone() -> AttachError {
    AttachError::Unavailable("局域网驱动任务已退出".to_string())
}

/// 丢弃调用方已超时放弃的等待者
fn prune_abandoned_waiters(waiters: &mut HashMap<PeerId, Vec<BearerWaiter>>) {
    for (peer_id, pending) in waiters.iter_mut() {
        let before = pending.len();
        pending.retain(|waiter| !waiter.reply.is_closed());
        if pending.len() < before {
            tracing::debug!("清理 {} 个已放弃的 {} 承载网络请求", before - pending.len(), peer_id);
        }
    }
    waiters.retain(|_, pending| !pending.is_empty());
}

/// 从对端键解析 Peer ID
fn parse_peer(peer: &PeerHandle) -> Option<PeerId> {
    peer.key().parse().ok()
}

#[async_trait]
impl DiscoveryTransport for P2pTransport {
    async fn attach(&self) -> std::result::Result<AttachHandle, AttachError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Attach { reply })
            .map_err(|_| driver_gone())?;
        rx.await.map_err(|_| driver_gone())
    }

    async fn publish(
        &self,
        attach: &AttachHandle,
        service_name: &str,
        room_name: &str,
    ) -> std::result::Result<DiscoverySession, AttachError> {
        self.open(
            attach,
            SessionKind::Publish {
                service: service_name.to_string(),
                room: room_name.to_string(),
            },
        )
        .await
    }

    async fn subscribe(
        &self,
        attach: &AttachHandle,
        service_name: &str,
    ) -> std::result::Result<DiscoverySession, AttachError> {
        self.open(
            attach,
            SessionKind::Subscribe {
                service: service_name.to_string(),
            },
        )
        .await
    }

    fn send_datagram(
        &self,
        session: SessionId,
        peer: &PeerHandle,
        _sequence: u32,
        payload: &[u8],
    ) -> std::result::Result<(), SendError> {
        if !self.is_open(session) {
            return Err(SendError::SessionClosed);
        }
        let peer_id = parse_peer(peer).ok_or_else(|| SendError::UnknownPeer(peer.key().to_string()))?;
        if payload.len() > self.max_datagram_size {
            return Err(SendError::Transport(format!(
                "数据报过大: {} 字节",
                payload.len()
            )));
        }

        self.commands
            .send(Command::Datagram {
                session,
                peer: peer_id,
                payload: payload.to_vec(),
            })
            .map_err(|_| SendError::Transport("局域网驱动任务已退出".to_string()))
    }

    async fn request_bearer(
        &self,
        session: SessionId,
        peer: &PeerHandle,
        request: BearerRequest,
    ) -> std::result::Result<BearerHandle, BearerError> {
        let peer_id = parse_peer(peer)
            .ok_or_else(|| BearerError::Rejected(format!("无效的对端: {}", peer)))?;
        tracing::debug!(
            "请求到 {} 的连接 (端口 {:?}，链路由 noise 加密，不使用预共享口令)",
            peer,
            request.port
        );

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Bearer {
                session,
                peer: peer.clone(),
                peer_id,
                reply,
            })
            .map_err(|_| BearerError::SessionClosed)?;

        match tokio::time::timeout(request.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BearerError::SessionClosed),
            Err(_) => Err(BearerError::Timeout(request.timeout)),
        }
    }

    fn close_session(&self, session: SessionId) {
        self.set_open(session, false);
        let _ = self.commands.send(Command::Close(session));
    }

    fn detach(&self, attach: &AttachHandle) {
        let _ = self.commands.send(Command::Detach(attach.clone()));
    }
}

fn build_swarm(config: &P2pConfig) -> Result<Swarm<AwareBehaviour>> {
    let mut swarm = SwarmBuilder::with_existing_identity(Keypair::generate_ed25519())
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| AwareError::Transport(e.to_string()))?
        .with_behaviour(
            |key| -> std::result::Result<AwareBehaviour, Box<dyn std::error::Error + Send + Sync>> {
                let mdns = mdns::tokio::Behaviour::new(
                    mdns::Config {
                        query_interval: config.query_interval,
                        ..Default::default()
                    },
                    key.public().to_peer_id(),
                )?;

                let rr_config =
                    request_response::Config::default().with_request_timeout(config.request_timeout);

                let service_info = request_response::Behaviour::with_codec(
                    ServiceInfoCodec,
                    [(ServiceInfoProtocol, ProtocolSupport::Full)],
                    rr_config.clone(),
                );
                let datagram = request_response::Behaviour::with_codec(
                    DatagramCodec::new(config.max_datagram_size),
                    [(DatagramProtocol, ProtocolSupport::Full)],
                    rr_config,
                );

                Ok(AwareBehaviour {
                    mdns,
                    service_info,
                    datagram,
                })
            },
        )
        .map_err(|e| AwareError::Transport(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_connection_timeout))
        .build();

    for addr in &config.listen_addresses {
        swarm
            .listen_on(addr.clone())
            .map_err(|e| AwareError::Transport(e.to_string()))?;
    }

    Ok(swarm)
}

/// 驱动任务：独占 Swarm，处理命令和网络事件
struct Driver {
    swarm: Swarm<AwareBehaviour>,
    attach: Option<AttachHandle>,
    next_id: u64,
    sessions: HashMap<SessionId, SessionEntry>,
    /// mDNS 发现的节点及地址
    discovered: HashMap<PeerId, Vec<Multiaddr>>,
    /// 已建立的承载网络
    bearers: Vec<(SessionId, PeerHandle)>,
    /// 等待连接建立的承载网络请求
    waiters: HashMap<PeerId, Vec<BearerWaiter>>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
            }
        }
        tracing::info!("局域网驱动任务已停止");
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Attach { reply } => {
                let handle = match &self.attach {
                    Some(existing) => existing.clone(),
                    None => {
                        let handle = AttachHandle { id: self.next_id() };
                        self.attach = Some(handle.clone());
                        handle
                    }
                };
                let _ = reply.send(handle);
            }
            Command::Open { attach, kind, reply } => {
                let _ = reply.send(self.open_session(attach, kind));
            }
            Command::Datagram {
                session,
                peer,
                payload,
            } => {
                if !self.sessions.contains_key(&session) {
                    tracing::debug!("会话 {} 已关闭，丢弃数据报", session);
                    return;
                }
                self.swarm.behaviour_mut().datagram.send_request(&peer, payload);
            }
            Command::Bearer {
                session,
                peer,
                peer_id,
                reply,
            } => self.request_bearer(session, peer, peer_id, reply),
            Command::Close(session) => self.close_session(session),
            Command::Detach(attach) => {
                if self.attach.as_ref() != Some(&attach) {
                    return;
                }
                let sessions: Vec<SessionId> = self.sessions.keys().copied().collect();
                for session in sessions {
                    self.close_session(session);
                }
                self.attach = None;
                tracing::debug!("已释放附着句柄");
            }
            Command::Shutdown => {}
        }
    }

    fn open_session(
        &mut self,
        attach: AttachHandle,
        kind: SessionKind,
    ) -> std::result::Result<DiscoverySession, AttachError> {
        if self.attach.as_ref() != Some(&attach) {
            return Err(AttachError::Failed("附着句柄已失效".to_string()));
        }

        let id = SessionId(self.next_id());
        let (tx, events) = mpsc::unbounded_channel();

        if let SessionKind::Subscribe { service } = &kind {
            let peers: Vec<PeerId> = self.discovered.keys().copied().collect();
            for peer in peers {
                self.query_service(peer, service.clone());
            }
        }

        tracing::info!("打开发现会话 {}: {:?}", id, kind);
        self.sessions.insert(id, SessionEntry { kind, tx });
        Ok(DiscoverySession { id, events })
    }

    fn close_session(&mut self, session: SessionId) {
        if self.sessions.remove(&session).is_some() {
            tracing::debug!("关闭发现会话 {}", session);
        }
        self.bearers.retain(|(s, _)| *s != session);
        for waiters in self.waiters.values_mut() {
            waiters.retain(|w| w.session != session);
        }
    }

    fn query_service(&mut self, peer: PeerId, service: String) {
        tracing::debug!("向 {} 查询服务 {}", peer, service);
        self.swarm
            .behaviour_mut()
            .service_info
            .send_request(&peer, ServiceQuery { service_name: service });
    }

    fn subscribed_services(&self) -> HashSet<String> {
        self.sessions
            .values()
            .filter_map(|entry| match &entry.kind {
                SessionKind::Subscribe { service } => Some(service.clone()),
                SessionKind::Publish { .. } => None,
            })
            .collect()
    }

    fn request_bearer(
        &mut self,
        session: SessionId,
        peer: PeerHandle,
        peer_id: PeerId,
        reply: oneshot::Sender<std::result::Result<BearerHandle, BearerError>>,
    ) {
        prune_abandoned_waiters(&mut self.waiters);

        if !self.sessions.contains_key(&session) {
            let _ = reply.send(Err(BearerError::SessionClosed));
            return;
        }

        let waiter = BearerWaiter {
            id: self.next_id(),
            session,
            peer,
            reply,
        };

        if self.swarm.is_connected(&peer_id) {
            self.resolve_waiter(waiter);
            return;
        }

        if let Err(e) = self.swarm.dial(peer_id) {
            tracing::warn!("拨号 {} 失败: {}", peer_id, e);
            let _ = waiter.reply.send(Err(BearerError::Rejected(e.to_string())));
            return;
        }
        self.waiters.entry(peer_id).or_default().push(waiter);
    }

    fn resolve_waiter(&mut self, waiter: BearerWaiter) {
        let handle = BearerHandle {
            id: waiter.id,
            peer: waiter.peer.clone(),
        };
        if waiter.reply.send(Ok(handle)).is_ok() {
            self.bearers.push((waiter.session, waiter.peer));
        }
    }

    fn emit(&self, session: SessionId, event: SessionEvent) {
        if let Some(entry) = self.sessions.get(&session) {
            let _ = entry.tx.send(event);
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<AwareBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(AwareBehaviourEvent::Mdns(event)) => self.on_mdns(event),
            SwarmEvent::Behaviour(AwareBehaviourEvent::ServiceInfo(event)) => {
                self.on_service_info(event)
            }
            SwarmEvent::Behaviour(AwareBehaviourEvent::Datagram(event)) => self.on_datagram(event),
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("开始监听: {}", address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                tracing::debug!("与 {} 建立连接", peer_id);
                if let Some(waiters) = self.waiters.remove(&peer_id) {
                    for waiter in waiters {
                        self.resolve_waiter(waiter);
                    }
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                tracing::debug!("与 {} 的连接关闭 (剩余 {})", peer_id, num_established);
                if num_established == 0 {
                    self.on_peer_disconnected(peer_id);
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                if let Some(waiters) = self.waiters.remove(&peer_id) {
                    tracing::warn!("连接 {} 失败: {}", peer_id, error);
                    for waiter in waiters {
                        let _ = waiter.reply.send(Err(BearerError::Rejected(error.to_string())));
                    }
                }
            }
            _ => {}
        }
    }

    fn on_mdns(&mut self, event: mdns::Event) {
        match event {
            mdns::Event::Discovered(list) => {
                let mut fresh = HashSet::new();
                for (peer_id, addr) in list {
                    tracing::info!("通过 mDNS 发现节点: {} at {}", peer_id, addr);
                    self.swarm.add_peer_address(peer_id, addr.clone());
                    let addresses = self.discovered.entry(peer_id).or_default();
                    if !addresses.contains(&addr) {
                        addresses.push(addr);
                    }
                    fresh.insert(peer_id);
                }

                let services = self.subscribed_services();
                for peer_id in fresh {
                    for service in &services {
                        self.query_service(peer_id, service.clone());
                    }
                }
            }
            mdns::Event::Expired(list) => {
                for (peer_id, addr) in list {
                    tracing::info!("节点 mDNS 记录过期: {} at {}", peer_id, addr);
                    if let Some(addresses) = self.discovered.get_mut(&peer_id) {
                        addresses.retain(|a| *a != addr);
                        if addresses.is_empty() {
                            self.discovered.remove(&peer_id);
                        }
                    }
                }
            }
        }
    }

    fn on_service_info(&mut self, event: request_response::Event<ServiceQuery, ServiceAdvert>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request { request, channel, .. } => {
                    let room_name = self.sessions.values().find_map(|entry| match &entry.kind {
                        SessionKind::Publish { service, room } if *service == request.service_name => {
                            Some(room.clone())
                        }
                        _ => None,
                    });
                    let advert = ServiceAdvert {
                        service_name: request.service_name,
                        room_name,
                    };
                    if self
                        .swarm
                        .behaviour_mut()
                        .service_info
                        .send_response(channel, advert)
                        .is_err()
                    {
                        tracing::debug!("向 {} 回复服务信息失败", peer);
                    }
                }
                request_response::Message::Response { response, .. } => {
                    let Some(room) = response.room_name else {
                        tracing::debug!("{} 没有发布服务 {}", peer, response.service_name);
                        return;
                    };
                    tracing::info!("📡 {} 发布了房间: {}", peer, room);

                    let handle = PeerHandle::new(peer.to_string());
                    let targets: Vec<SessionId> = self
                        .sessions
                        .iter()
                        .filter(|(_, entry)| {
                            matches!(&entry.kind, SessionKind::Subscribe { service } if *service == response.service_name)
                        })
                        .map(|(id, _)| *id)
                        .collect();
                    for session in targets {
                        self.emit(
                            session,
                            SessionEvent::ServiceDiscovered {
                                peer: handle.clone(),
                                service_info: room.as_bytes().to_vec(),
                            },
                        );
                    }
                }
            },
            request_response::Event::OutboundFailure { peer, error, .. } => {
                tracing::debug!("向 {} 查询服务失败: {}", peer, error);
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                tracing::debug!("处理 {} 的服务查询失败: {}", peer, error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn on_datagram(&mut self, event: request_response::Event<Vec<u8>, ()>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request { request, channel, .. } => {
                    let _ = self.swarm.behaviour_mut().datagram.send_response(channel, ());

                    let handle = PeerHandle::new(peer.to_string());
                    let sessions: Vec<SessionId> = self.sessions.keys().copied().collect();
                    for session in sessions {
                        self.emit(
                            session,
                            SessionEvent::MessageReceived {
                                peer: handle.clone(),
                                payload: request.clone(),
                            },
                        );
                    }
                }
                request_response::Message::Response { .. } => {}
            },
            request_response::Event::OutboundFailure { peer, error, .. } => {
                tracing::debug!("向 {} 发送数据报失败: {}", peer, error);
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                tracing::debug!("接收 {} 的数据报失败: {}", peer, error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn on_peer_disconnected(&mut self, peer_id: PeerId) {
        let key = peer_id.to_string();
        let (lost, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.bearers)
            .into_iter()
            .partition(|(_, peer)| peer.key() == key);
        self.bearers = kept;

        for (session, peer) in lost {
            tracing::warn!("💔 到 {} 的所有连接已关闭，承载网络丢失", peer);
            self.emit(session, SessionEvent::BearerLost { peer });
        }
    }
}
